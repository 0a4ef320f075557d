//! Change Event Ingestor
//!
//! Applies the host's two event classes to an [`ObjectStore`]:
//! - **change** (object created or altered): resolve the exact key and upsert
//! - **drop** (object removed): resolve a candidate key and invalidate every
//!   row matching it. The object is gone by then, so there is no handle to
//!   verify and no catalog detail to refine the type with.
//!
//! One event per affected object; a statement touching several objects
//! yields several independent events, applied in the order the host
//! reports them.

use crate::config::{SYSTEM_SCHEMAS, TEMP_SCHEMA_PREFIXES, TRACKER_SCHEMA};
use crate::error::TrackerResult;
use crate::identity::{self, ObjectKey};
use crate::object_type::{CatalogDetail, ObjectType};
use crate::store::{DropPattern, ObjectStore, ObjectWrite, UpsertOutcome};

/// Object classes whose CREATE/ALTER/DROP statements are tracked
const TRACKED_CLASSES: &[&str] = &[
    "TABLE",
    "INDEX",
    "SEQUENCE",
    "VIEW",
    "MATERIALIZED VIEW",
    "FUNCTION",
    "PROCEDURE",
    "AGGREGATE",
    "TRIGGER",
    "SCHEMA",
    "TYPE",
    "DOMAIN",
];

/// Change tags outside the `CREATE`/`ALTER` × class grid
const EXTRA_CHANGE_TAGS: &[&str] = &["CREATE TABLE AS", "SELECT INTO"];

/// How a command tag participates in tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Change,
    Drop,
    Ignored,
}

pub fn classify_tag(tag: &str) -> TagClass {
    let upper = tag.trim().to_uppercase();

    if EXTRA_CHANGE_TAGS.contains(&upper.as_str()) {
        return TagClass::Change;
    }

    let Some((verb, class)) = upper.split_once(' ') else {
        return TagClass::Ignored;
    };
    if !TRACKED_CLASSES.contains(&class) {
        return TagClass::Ignored;
    }

    match verb {
        "CREATE" | "ALTER" => TagClass::Change,
        "DROP" => TagClass::Drop,
        _ => TagClass::Ignored,
    }
}

/// Statement-level class of an event trigger's `TG_TAG`.
///
/// Extension statements pass so their member sub-commands reach the
/// per-object filters in [`apply_change`]; each sub-command is then judged
/// by its own tag.
pub fn statement_class(tag: &str) -> TagClass {
    let upper = tag.trim().to_uppercase();
    match upper.as_str() {
        "CREATE EXTENSION" | "ALTER EXTENSION" => TagClass::Change,
        "DROP EXTENSION" => TagClass::Drop,
        _ => classify_tag(&upper),
    }
}

/// Namespaces the tracker never records objects in
pub fn is_excluded_schema(schema: &str) -> bool {
    schema == TRACKER_SCHEMA
        || SYSTEM_SCHEMAS.contains(&schema)
        || TEMP_SCHEMA_PREFIXES
            .iter()
            .any(|prefix| schema.strip_prefix(prefix).is_some_and(|rest| rest.is_empty() || rest.starts_with('_')))
}

/// One affected object of a create/alter statement
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Host `object_type` text (`table`, `function`, ...)
    pub kind: String,
    pub schema: Option<String>,
    pub identity: String,
    pub native_handle: Option<u32>,
    /// Command tag of this object's sub-command
    pub command_tag: String,
    pub in_extension: bool,
    /// Catalog facts looked up through the native handle
    pub detail: CatalogDetail,
}

impl ChangeEvent {
    pub fn object_type(&self) -> ObjectType {
        ObjectType::classify(&self.kind, self.detail)
    }

    pub fn key(&self) -> ObjectKey {
        identity::resolve(&self.identity, self.object_type(), self.schema.as_deref())
    }
}

/// One removed object of a drop statement
#[derive(Debug, Clone, PartialEq)]
pub struct DropEvent {
    pub kind: String,
    pub schema: Option<String>,
    pub identity: String,
    /// Tag of the dropping statement
    pub command_tag: String,
}

impl DropEvent {
    /// Candidate key, resolved with the same segment rule as changes
    pub fn candidate_key(&self) -> ObjectKey {
        let object_type = ObjectType::from_event_kind(&self.kind);
        identity::resolve(&self.identity, object_type, self.schema.as_deref())
    }

    /// Best-effort selection of rows this drop invalidates. Empty resolved
    /// fields leave that column unconstrained.
    pub fn pattern(&self) -> DropPattern {
        let key = self.candidate_key();
        DropPattern {
            schema: Some(key.schema).filter(|s| !s.is_empty()),
            name: Some(key.name).filter(|n| !n.is_empty()),
            types: ObjectType::drop_candidates(&self.kind),
        }
    }
}

/// Ingestion switches read from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestOptions {
    pub track_extension_objects: bool,
}

/// What the change path did with one event
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    Applied { key: ObjectKey, outcome: UpsertOutcome },
    SkippedTag,
    SkippedExtensionMember,
    SkippedSchema { schema: String },
}

pub fn apply_change<S: ObjectStore + ?Sized>(
    store: &mut S,
    event: &ChangeEvent,
    options: IngestOptions,
) -> TrackerResult<ChangeOutcome> {
    if classify_tag(&event.command_tag) != TagClass::Change {
        return Ok(ChangeOutcome::SkippedTag);
    }
    if event.in_extension && !options.track_extension_objects {
        return Ok(ChangeOutcome::SkippedExtensionMember);
    }

    let key = event.key();
    if is_excluded_schema(&key.schema) {
        return Ok(ChangeOutcome::SkippedSchema { schema: key.schema });
    }

    let outcome = store.upsert(&ObjectWrite {
        key: &key,
        operation: &event.command_tag,
        native_handle: event.native_handle,
    })?;

    Ok(ChangeOutcome::Applied { key, outcome })
}

/// Apply a drop. Returns the ids of invalidated rows; none is not an error.
pub fn apply_drop<S: ObjectStore + ?Sized>(store: &mut S, event: &DropEvent) -> TrackerResult<Vec<i64>> {
    if statement_class(&event.command_tag) != TagClass::Drop {
        return Ok(Vec::new());
    }

    let pattern = event.pattern();
    if pattern.schema.as_deref().is_some_and(is_excluded_schema) {
        return Ok(Vec::new());
    }

    store.mark_dropped(&pattern, &event.command_tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStatus;

    fn change(kind: &str, schema: &str, identity: &str, tag: &str) -> ChangeEvent {
        ChangeEvent {
            kind: kind.to_string(),
            schema: Some(schema.to_string()),
            identity: identity.to_string(),
            native_handle: Some(16400),
            command_tag: tag.to_string(),
            in_extension: false,
            detail: CatalogDetail::Unknown,
        }
    }

    fn dropped(kind: &str, schema: Option<&str>, identity: &str, tag: &str) -> DropEvent {
        DropEvent {
            kind: kind.to_string(),
            schema: schema.map(str::to_string),
            identity: identity.to_string(),
            command_tag: tag.to_string(),
        }
    }

    #[test]
    fn test_classify_tag() {
        assert_eq!(classify_tag("CREATE TABLE"), TagClass::Change);
        assert_eq!(classify_tag("alter materialized view"), TagClass::Change);
        assert_eq!(classify_tag("CREATE TABLE AS"), TagClass::Change);
        assert_eq!(classify_tag("SELECT INTO"), TagClass::Change);
        assert_eq!(classify_tag("DROP FUNCTION"), TagClass::Drop);
        assert_eq!(classify_tag("DROP EXTENSION"), TagClass::Ignored);
        assert_eq!(classify_tag("COMMENT"), TagClass::Ignored);
        assert_eq!(classify_tag("GRANT"), TagClass::Ignored);
    }

    #[test]
    fn test_extension_statements_reach_member_filters() {
        assert_eq!(statement_class("CREATE EXTENSION"), TagClass::Change);
        assert_eq!(statement_class("alter extension"), TagClass::Change);
        assert_eq!(statement_class("DROP EXTENSION"), TagClass::Drop);
        assert_eq!(statement_class("CREATE TABLE"), TagClass::Change);
        assert_eq!(statement_class("GRANT"), TagClass::Ignored);

        // the extension's own row is not an object class we track
        assert_eq!(classify_tag("CREATE EXTENSION"), TagClass::Ignored);
    }

    #[test]
    fn test_excluded_schemas() {
        assert!(is_excluded_schema("pg_catalog"));
        assert!(is_excluded_schema("obj_tracker"));
        assert!(is_excluded_schema("pg_temp_3"));
        assert!(is_excluded_schema("pg_toast_temp_3"));
        assert!(!is_excluded_schema("public"));
        assert!(!is_excluded_schema("pg_tempest"));
    }

    #[test]
    fn test_create_alter_drop_lifecycle() {
        let mut store = MemoryStore::new();
        let opts = IngestOptions::default();

        apply_change(&mut store, &change("table", "public", "public.employees", "CREATE TABLE"), opts).unwrap();
        let key = ObjectKey::new("public", "employees", ObjectType::Table);
        let created = store.get(&key).unwrap().clone();
        assert_eq!(created.status, ObjectStatus::Valid);
        assert_eq!(created.last_operation, "CREATE TABLE");

        apply_change(&mut store, &change("table", "public", "public.employees", "ALTER TABLE"), opts).unwrap();
        let altered = store.get(&key).unwrap().clone();
        assert_eq!(altered.id, created.id);
        assert_eq!(altered.last_operation, "ALTER TABLE");
        assert!(altered.last_change_at > created.last_change_at);
        assert_eq!(altered.created_at, created.created_at);

        let ids = apply_drop(&mut store, &dropped("table", Some("public"), "public.employees", "DROP TABLE")).unwrap();
        assert_eq!(ids, vec![created.id]);
        let dropped = store.get(&key).unwrap();
        assert_eq!(dropped.status, ObjectStatus::Invalid);
        assert_eq!(dropped.last_operation, "DROP TABLE");
        assert_eq!(dropped.created_at, created.created_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_create_yields_one_row() {
        let mut store = MemoryStore::new();
        let event = change("view", "public", "public.v_staff", "CREATE VIEW");

        apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        let first = store.enumerate().unwrap()[0].last_change_at;
        apply_change(&mut store, &event, IngestOptions::default()).unwrap();

        let rows = store.enumerate().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].last_change_at > first);
    }

    #[test]
    fn test_catalog_detail_refines_type() {
        let mut store = MemoryStore::new();
        let mut event = change("table", "sales", "sales.orders_2024", "CREATE TABLE");
        event.detail = CatalogDetail::Relation { relkind: 'r', is_partition: true };

        let outcome = apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        match outcome {
            ChangeOutcome::Applied { key, .. } => assert_eq!(key.object_type, ObjectType::Partition),
            other => panic!("unexpected outcome {other:?}"),
        }

        // a plain DROP TABLE still reaches the partition row
        let ids = apply_drop(&mut store, &dropped("table", Some("sales"), "sales.orders_2024", "DROP TABLE")).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_extension_members_skipped_unless_enabled() {
        let mut store = MemoryStore::new();
        let mut event = change("function", "public", "public.hstore_in(cstring)", "CREATE FUNCTION");
        event.in_extension = true;

        let outcome = apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        assert_eq!(outcome, ChangeOutcome::SkippedExtensionMember);
        assert!(store.is_empty());

        let opts = IngestOptions { track_extension_objects: true };
        apply_change(&mut store, &event, opts).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_extension_member_rows_invalidated_by_drop_extension() {
        let mut store = MemoryStore::new();
        let mut member = change("type", "public", "public.hstore", "CREATE TYPE");
        member.in_extension = true;
        apply_change(&mut store, &member, IngestOptions { track_extension_objects: true }).unwrap();

        let ids = apply_drop(&mut store, &dropped("type", Some("public"), "public.hstore", "DROP EXTENSION")).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.enumerate().unwrap()[0].last_operation, "DROP EXTENSION");
    }

    #[test]
    fn test_select_into_recreate_is_valid_again() {
        let mut store = MemoryStore::new();
        let opts = IngestOptions::default();
        let key = ObjectKey::new("public", "t2", ObjectType::Table);

        apply_change(&mut store, &change("table", "public", "public.t2", "SELECT INTO"), opts).unwrap();
        apply_drop(&mut store, &dropped("table", Some("public"), "public.t2", "DROP TABLE")).unwrap();
        let dropped_at = store.get(&key).unwrap().created_at;

        apply_change(&mut store, &change("table", "public", "public.t2", "SELECT INTO"), opts).unwrap();
        let row = store.get(&key).unwrap();
        assert_eq!(row.status, ObjectStatus::Valid);
        assert_eq!(row.last_operation, "SELECT INTO");
        assert!(row.created_at > dropped_at);
    }

    #[test]
    fn test_triggers_on_one_table_tracked_apart() {
        let mut store = MemoryStore::new();
        let opts = IngestOptions::default();
        apply_change(&mut store, &change("trigger", "public", "trg_a on public.t", "CREATE TRIGGER"), opts).unwrap();
        apply_change(&mut store, &change("trigger", "public", "trg_b on public.t", "CREATE TRIGGER"), opts).unwrap();
        assert_eq!(store.len(), 2);

        let ids = apply_drop(&mut store, &dropped("trigger", None, "trg_a on public.t", "DROP TRIGGER")).unwrap();
        assert_eq!(ids.len(), 1);

        let remaining = store.get(&ObjectKey::new("public", "trg_b on t", ObjectType::Trigger)).unwrap();
        assert_eq!(remaining.status, ObjectStatus::Valid);
    }

    #[test]
    fn test_temp_objects_skipped() {
        let mut store = MemoryStore::new();
        let event = change("table", "pg_temp_4", "pg_temp_4.scratch", "CREATE TABLE");

        let outcome = apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        assert!(matches!(outcome, ChangeOutcome::SkippedSchema { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unrecognized_tag_skipped() {
        let mut store = MemoryStore::new();
        let event = change("table", "public", "public.employees", "COMMENT");

        let outcome = apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        assert_eq!(outcome, ChangeOutcome::SkippedTag);
    }

    #[test]
    fn test_drop_with_empty_schema_matches_any_schema() {
        let mut store = MemoryStore::new();
        let opts = IngestOptions::default();
        apply_change(&mut store, &change("sequence", "hr", "hr.seq_ids", "CREATE SEQUENCE"), opts).unwrap();
        apply_change(&mut store, &change("sequence", "ops", "ops.seq_ids", "CREATE SEQUENCE"), opts).unwrap();

        let ids = apply_drop(&mut store, &dropped("sequence", Some(""), "seq_ids", "DROP SEQUENCE")).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_unmatched_drop_is_noop() {
        let mut store = MemoryStore::new();
        let ids = apply_drop(&mut store, &dropped("view", Some("public"), "public.never_seen", "DROP VIEW")).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_drop_routine_matches_signature() {
        let mut store = MemoryStore::new();
        let opts = IngestOptions::default();
        apply_change(&mut store, &change("function", "public", "public.f(integer)", "CREATE FUNCTION"), opts).unwrap();
        apply_change(&mut store, &change("function", "public", "public.f(text)", "CREATE FUNCTION"), opts).unwrap();

        let ids = apply_drop(&mut store, &dropped("function", Some("public"), "public.f(text)", "DROP FUNCTION")).unwrap();
        assert_eq!(ids.len(), 1);

        let still_valid = store.get(&ObjectKey::new("public", "f(integer)", ObjectType::Function)).unwrap();
        assert_eq!(still_valid.status, ObjectStatus::Valid);
    }

    #[test]
    fn test_schema_events_use_identity_as_schema() {
        let mut store = MemoryStore::new();
        let mut event = change("schema", "", "reporting", "CREATE SCHEMA");
        event.schema = None;

        apply_change(&mut store, &event, IngestOptions::default()).unwrap();
        assert!(store.get(&ObjectKey::new("reporting", "reporting", ObjectType::Schema)).is_some());

        let ids = apply_drop(&mut store, &dropped("schema", None, "reporting", "DROP SCHEMA")).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_alter_tag_on_drop_path_ignored() {
        let mut store = MemoryStore::new();
        apply_change(&mut store, &change("table", "public", "public.t", "CREATE TABLE"), IngestOptions::default()).unwrap();

        // ALTER TABLE ... DROP COLUMN reports a dropped column under ALTER TABLE
        let ids = apply_drop(&mut store, &dropped("table column", Some("public"), "public.t.c", "ALTER TABLE")).unwrap();
        assert!(ids.is_empty());
    }
}
