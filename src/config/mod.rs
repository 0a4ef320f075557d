//! Tracker configuration: fixed names and the `obj_tracker.*` GUCs.

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// Schema that owns the tracker's table, view and functions
pub const TRACKER_SCHEMA: &str = "obj_tracker";

/// Fully qualified store table
pub const TRACKER_TABLE: &str = "obj_tracker.tracked_objects";

/// Operation tag recorded for rows seeded by reconciliation
pub const INITIAL_LOAD_OPERATION: &str = "INITIAL_LOAD";

/// Namespaces whose objects are never tracked (besides temp namespaces)
pub const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// Prefixes of per-backend temporary namespaces
pub const TEMP_SCHEMA_PREFIXES: &[&str] = &["pg_temp", "pg_toast_temp"];

static ENABLED: GucSetting<bool> = GucSetting::<bool>::new(true);
static TRACK_EXTENSION_OBJECTS: GucSetting<bool> = GucSetting::<bool>::new(false);

/// Register GUCs. Called once from `_PG_init`.
pub fn register_gucs() {
    GucRegistry::define_bool_guc(
        "obj_tracker.enabled",
        "Record DDL events in obj_tracker.tracked_objects",
        "When off, the ddl_command_end and sql_drop handlers return without touching the store.",
        &ENABLED,
        GucContext::Suset,
        GucFlags::default(),
    );

    GucRegistry::define_bool_guc(
        "obj_tracker.track_extension_objects",
        "Also track objects created by CREATE EXTENSION",
        "Extension members are skipped by default so library internals stay out of the inventory.",
        &TRACK_EXTENSION_OBJECTS,
        GucContext::Suset,
        GucFlags::default(),
    );
}

pub fn tracking_enabled() -> bool {
    ENABLED.get()
}

pub fn track_extension_objects() -> bool {
    TRACK_EXTENSION_OBJECTS.get()
}
