use pgrx::prelude::*;

mod catalog;
mod event_trigger;
mod metadata;
pub mod config;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod object_type;
pub mod projection;
pub mod reconcile;
pub mod store;

pub use error::{TrackerError, TrackerResult};

pg_module_magic!();

/// Get the version of the pg_object_tracker extension
#[pg_extern]
fn pg_object_tracker_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Initialize the extension
/// Registers the `obj_tracker.*` GUCs; the event triggers themselves are
/// installed by the extension script.
#[pg_guard]
extern "C" fn _PG_init() {
    config::register_gucs();
    pgrx::log!("pg_object_tracker: GUCs registered");
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    fn tracked(name: &str, object_type: &str) -> (Option<String>, Option<String>) {
        let query = format!(
            "SELECT (SELECT status || '|' || last_operation FROM obj_tracker.tracked_objects \
             WHERE object_name = '{}' AND object_type = '{}')",
            name, object_type
        );
        let joined = Spi::get_one::<String>(&query).unwrap();
        match joined.as_deref().and_then(|s| s.split_once('|')) {
            Some((status, op)) => (Some(status.to_string()), Some(op.to_string())),
            None => (None, None),
        }
    }

    fn timestamps(name: &str) -> (f64, f64) {
        let created = Spi::get_one::<f64>(&format!(
            "SELECT EXTRACT(EPOCH FROM created_at)::float8 FROM obj_tracker.tracked_objects \
             WHERE object_schema = 'public' AND object_name = '{}' AND object_type = 'TABLE'",
            name
        ))
        .unwrap()
        .unwrap();
        let changed = Spi::get_one::<f64>(&format!(
            "SELECT EXTRACT(EPOCH FROM last_change_at)::float8 FROM obj_tracker.tracked_objects \
             WHERE object_schema = 'public' AND object_name = '{}' AND object_type = 'TABLE'",
            name
        ))
        .unwrap()
        .unwrap();
        (created, changed)
    }

    #[pg_test]
    fn test_version_function() {
        let version = crate::pg_object_tracker_version();
        assert!(version.starts_with("0.1"));
    }

    #[pg_test]
    fn test_create_alter_drop_table() {
        Spi::run("CREATE TABLE public.employees (id int)").unwrap();
        assert_eq!(
            tracked("employees", "TABLE"),
            (Some("VALID".to_string()), Some("CREATE TABLE".to_string()))
        );
        let (created, first_change) = timestamps("employees");

        Spi::run("ALTER TABLE public.employees ADD COLUMN name text").unwrap();
        assert_eq!(tracked("employees", "TABLE").1, Some("ALTER TABLE".to_string()));
        let (created_after_alter, second_change) = timestamps("employees");
        assert_eq!(created, created_after_alter);
        assert!(second_change > first_change);

        Spi::run("DROP TABLE public.employees").unwrap();
        assert_eq!(
            tracked("employees", "TABLE"),
            (Some("INVALID".to_string()), Some("DROP TABLE".to_string()))
        );
        let (created_after_drop, _) = timestamps("employees");
        assert_eq!(created, created_after_drop);

        let rows = Spi::get_one::<i64>(
            "SELECT count(*) FROM obj_tracker.tracked_objects WHERE object_name = 'employees'",
        );
        assert_eq!(rows, Ok(Some(1)));
    }

    #[pg_test]
    fn test_multi_object_statement_tracks_each_object() {
        Spi::run("CREATE TABLE public.badges (id serial PRIMARY KEY, label text)").unwrap();

        assert_eq!(tracked("badges", "TABLE").0, Some("VALID".to_string()));
        assert_eq!(tracked("badges_pkey", "INDEX").0, Some("VALID".to_string()));
        assert_eq!(tracked("badges_id_seq", "SEQUENCE").0, Some("VALID".to_string()));

        // dependent objects go down with the table
        Spi::run("DROP TABLE public.badges").unwrap();
        assert_eq!(tracked("badges_pkey", "INDEX").0, Some("INVALID".to_string()));
        assert_eq!(tracked("badges_id_seq", "SEQUENCE").0, Some("INVALID".to_string()));
    }

    #[pg_test]
    fn test_function_name_and_display() {
        Spi::run(
            "CREATE FUNCTION public.get_employee_count() RETURNS int LANGUAGE sql AS 'SELECT 1'",
        )
        .unwrap();

        assert_eq!(tracked("get_employee_count()", "FUNCTION").0, Some("VALID".to_string()));

        let display = Spi::get_one::<String>(
            "SELECT object_name FROM obj_tracker.all_objects \
             WHERE owner = 'public' AND signature = 'get_employee_count()'",
        );
        assert_eq!(display, Ok(Some("get_employee_count".to_string())));

        Spi::run("DROP FUNCTION public.get_employee_count()").unwrap();
        assert_eq!(
            tracked("get_employee_count()", "FUNCTION"),
            (Some("INVALID".to_string()), Some("DROP FUNCTION".to_string()))
        );
    }

    #[pg_test]
    fn test_partitions_keep_refined_type() {
        Spi::run("CREATE TABLE public.events (at date) PARTITION BY RANGE (at)").unwrap();
        Spi::run(
            "CREATE TABLE public.events_2024 PARTITION OF public.events \
             FOR VALUES FROM ('2024-01-01') TO ('2025-01-01')",
        )
        .unwrap();

        assert_eq!(tracked("events", "PARTITIONED TABLE").0, Some("VALID".to_string()));
        assert_eq!(tracked("events_2024", "PARTITION").0, Some("VALID".to_string()));

        Spi::run("DROP TABLE public.events").unwrap();
        assert_eq!(tracked("events", "PARTITIONED TABLE").0, Some("INVALID".to_string()));
        assert_eq!(tracked("events_2024", "PARTITION").0, Some("INVALID".to_string()));
    }

    #[pg_test]
    fn test_schema_lifecycle() {
        Spi::run("CREATE SCHEMA staging").unwrap();
        let schema = Spi::get_one::<String>(
            "SELECT object_schema FROM obj_tracker.tracked_objects \
             WHERE object_name = 'staging' AND object_type = 'SCHEMA'",
        );
        assert_eq!(schema, Ok(Some("staging".to_string())));

        Spi::run("DROP SCHEMA staging").unwrap();
        assert_eq!(tracked("staging", "SCHEMA").0, Some("INVALID".to_string()));
    }

    #[pg_test]
    fn test_disabled_tracking_records_nothing() {
        Spi::run("SET LOCAL obj_tracker.enabled = off").unwrap();
        Spi::run("CREATE TABLE public.untracked (id int)").unwrap();

        assert_eq!(tracked("untracked", "TABLE"), (None, None));
    }

    #[pg_test]
    fn test_temporary_tables_ignored() {
        Spi::run("CREATE TEMP TABLE scratch (id int)").unwrap();
        assert_eq!(tracked("scratch", "TABLE"), (None, None));
    }

    fn available_extension() -> Option<&'static str> {
        // contrib extensions whose main type shares the extension's name
        ["hstore", "citext"].into_iter().find(|name| {
            Spi::get_one::<bool>(&format!(
                "SELECT EXISTS (SELECT 1 FROM pg_available_extensions \
                 WHERE name = '{}' AND installed_version IS NULL)",
                name
            )) == Ok(Some(true))
        })
    }

    #[pg_test]
    fn test_create_table_as_and_select_into() {
        Spi::run("CREATE TABLE public.report AS SELECT 1 AS n").unwrap();
        assert_eq!(
            tracked("report", "TABLE"),
            (Some("VALID".to_string()), Some("CREATE TABLE AS".to_string()))
        );

        Spi::run("DROP TABLE public.report").unwrap();
        assert_eq!(tracked("report", "TABLE").0, Some("INVALID".to_string()));

        Spi::run("SELECT 2 AS n INTO public.report").unwrap();
        assert_eq!(
            tracked("report", "TABLE"),
            (Some("VALID".to_string()), Some("SELECT INTO".to_string()))
        );
    }

    #[pg_test]
    fn test_extension_members_tracked_when_enabled() {
        let Some(extension) = available_extension() else {
            notice!("no contrib extension available, skipping");
            return;
        };

        Spi::run("SET LOCAL obj_tracker.track_extension_objects = on").unwrap();
        Spi::run(&format!("CREATE EXTENSION {} SCHEMA public", extension)).unwrap();
        assert_eq!(tracked(extension, "TYPE").0, Some("VALID".to_string()));

        Spi::run(&format!("DROP EXTENSION {}", extension)).unwrap();
        assert_eq!(
            tracked(extension, "TYPE"),
            (Some("INVALID".to_string()), Some("DROP EXTENSION".to_string()))
        );
    }

    #[pg_test]
    fn test_extension_members_skipped_by_default() {
        let Some(extension) = available_extension() else {
            notice!("no contrib extension available, skipping");
            return;
        };

        Spi::run(&format!("CREATE EXTENSION {} SCHEMA public", extension)).unwrap();
        assert_eq!(tracked(extension, "TYPE"), (None, None));
    }

    #[pg_test]
    fn test_reconcile_clear_first_rebuilds_store() {
        Spi::run(
            "INSERT INTO obj_tracker.tracked_objects (object_schema, object_name, object_type, last_operation) \
             VALUES ('gone', 'stale_view', 'VIEW', 'CREATE VIEW')",
        )
        .unwrap();
        Spi::run("CREATE TABLE public.kept (id int)").unwrap();
        assert_eq!(tracked("kept", "TABLE").1, Some("CREATE TABLE".to_string()));

        let report = Spi::get_one::<pgrx::JsonB>("SELECT obj_tracker.reconcile(true)")
            .unwrap()
            .unwrap();
        assert!(report.0["cleared"].as_u64().unwrap_or(0) >= 2);

        assert_eq!(tracked("stale_view", "VIEW"), (None, None));
        assert_eq!(
            tracked("kept", "TABLE"),
            (Some("VALID".to_string()), Some("INITIAL_LOAD".to_string()))
        );
    }

    #[pg_test]
    fn test_quoted_schema_reconciled_and_dropped() {
        Spi::run("SET LOCAL obj_tracker.enabled = off").unwrap();
        Spi::run(r#"CREATE SCHEMA "Sales""#).unwrap();
        Spi::run("SET LOCAL obj_tracker.enabled = on").unwrap();
        Spi::run("SELECT obj_tracker.reconcile(false)").unwrap();

        assert_eq!(tracked(r#""Sales""#, "SCHEMA").1, Some("INITIAL_LOAD".to_string()));

        Spi::run(r#"DROP SCHEMA "Sales""#).unwrap();
        assert_eq!(tracked(r#""Sales""#, "SCHEMA").0, Some("INVALID".to_string()));

        let rows = Spi::get_one::<i64>(
            "SELECT count(*) FROM obj_tracker.tracked_objects \
             WHERE object_type = 'SCHEMA' AND object_name LIKE '%Sales%'",
        );
        assert_eq!(rows, Ok(Some(1)));
    }

    #[pg_test]
    fn test_alter_schema_and_function() {
        Spi::run("CREATE SCHEMA ops").unwrap();
        Spi::run("ALTER SCHEMA ops RENAME TO ops_archive").unwrap();
        assert_eq!(
            tracked("ops_archive", "SCHEMA"),
            (Some("VALID".to_string()), Some("ALTER SCHEMA".to_string()))
        );
        // a rename is a new key; the old row is left as it was
        assert_eq!(tracked("ops", "SCHEMA"), (Some("VALID".to_string()), Some("CREATE SCHEMA".to_string())));

        Spi::run("CREATE FUNCTION public.f_rate() RETURNS int LANGUAGE sql AS 'SELECT 3'").unwrap();
        Spi::run("ALTER FUNCTION public.f_rate() STABLE").unwrap();
        assert_eq!(
            tracked("f_rate()", "FUNCTION"),
            (Some("VALID".to_string()), Some("ALTER FUNCTION".to_string()))
        );
    }

    #[pg_test]
    fn test_alter_of_invalid_row_is_tolerated() {
        Spi::run("CREATE TABLE public.t_race (id int)").unwrap();
        Spi::run("UPDATE obj_tracker.tracked_objects SET status = 'INVALID' WHERE object_name = 't_race'").unwrap();

        Spi::run("ALTER TABLE public.t_race ADD COLUMN note text").unwrap();
        assert_eq!(
            tracked("t_race", "TABLE"),
            (Some("INVALID".to_string()), Some("ALTER TABLE".to_string()))
        );
    }

    #[pg_test]
    fn test_tracking_fault_does_not_abort_ddl() {
        Spi::run(
            "ALTER TABLE obj_tracker.tracked_objects \
             ADD CONSTRAINT no_widgets CHECK (object_name <> 'widgets')",
        )
        .unwrap();

        // the tracker's insert fails; the statement itself goes through
        Spi::run("CREATE TABLE public.widgets (id int)").unwrap();
        let exists = Spi::get_one::<bool>("SELECT to_regclass('public.widgets') IS NOT NULL");
        assert_eq!(exists, Ok(Some(true)));
        assert_eq!(tracked("widgets", "TABLE"), (None, None));

        // and the session keeps tracking afterwards
        Spi::run("CREATE TABLE public.gadgets (id int)").unwrap();
        assert_eq!(tracked("gadgets", "TABLE").0, Some("VALID".to_string()));
    }

    #[pg_test]
    fn test_two_triggers_on_one_table() {
        Spi::run("CREATE TABLE public.orders (id int)").unwrap();
        Spi::run(
            "CREATE FUNCTION public.noop_trg() RETURNS trigger LANGUAGE plpgsql AS 'BEGIN RETURN NEW; END'",
        )
        .unwrap();
        Spi::run("CREATE TRIGGER trg_a BEFORE INSERT ON public.orders FOR EACH ROW EXECUTE FUNCTION public.noop_trg()").unwrap();
        Spi::run("CREATE TRIGGER trg_b BEFORE INSERT ON public.orders FOR EACH ROW EXECUTE FUNCTION public.noop_trg()").unwrap();

        Spi::run("DROP TRIGGER trg_a ON public.orders").unwrap();
        assert_eq!(tracked("trg_a on orders", "TRIGGER").0, Some("INVALID".to_string()));
        assert_eq!(tracked("trg_b on orders", "TRIGGER").0, Some("VALID".to_string()));
    }

    #[pg_test]
    fn test_objects_json_lists_rows() {
        Spi::run("CREATE VIEW public.v_one AS SELECT 1 AS one").unwrap();

        let json = Spi::get_one::<pgrx::JsonB>("SELECT obj_tracker.objects_json()")
            .unwrap()
            .unwrap();
        let rows = json.0.as_array().cloned().unwrap_or_default();
        assert!(rows.iter().any(|r| r["object_name"] == "v_one" && r["object_type"] == "VIEW"));
    }
}
