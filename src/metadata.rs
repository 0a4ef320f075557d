use pgrx::prelude::*;

// Store table. The schema itself comes from the control file.
extension_sql!(
    r"
    CREATE TABLE obj_tracker.tracked_objects (
        id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
        object_schema TEXT NOT NULL,
        object_name TEXT NOT NULL,
        object_type TEXT NOT NULL CHECK (object_type = upper(object_type)),
        status TEXT NOT NULL DEFAULT 'VALID' CHECK (status IN ('VALID', 'INVALID')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        last_change_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        last_operation TEXT NOT NULL,
        native_handle OID,
        CONSTRAINT tracked_objects_key UNIQUE (object_schema, object_name, object_type)
    );

    CREATE INDEX tracked_objects_name_idx ON obj_tracker.tracked_objects (object_name, object_type);

    SELECT pg_catalog.pg_extension_config_dump('obj_tracker.tracked_objects', '');

    COMMENT ON TABLE obj_tracker.tracked_objects IS
        'One row per schema object seen by DDL event triggers or reconciliation';
    COMMENT ON COLUMN obj_tracker.tracked_objects.native_handle IS
        'OID at last observation, diagnostics only';
    ",
    name = "create_tracked_objects",
    bootstrap,
);

// View, event triggers and the initial seeding need the Rust functions, so
// they run last.
extension_sql!(
    r"
    CREATE VIEW obj_tracker.all_objects AS
    SELECT id AS object_id,
           object_schema AS owner,
           obj_tracker.display_name(object_type, object_name) AS object_name,
           object_name AS signature,
           object_type,
           status,
           created_at AS created,
           last_change_at AS last_ddl_time,
           last_operation,
           native_handle
    FROM obj_tracker.tracked_objects
    ORDER BY 2, 3, 5;

    COMMENT ON VIEW obj_tracker.all_objects IS
        'Tracked schema objects with routine argument lists stripped from object_name';

    CREATE FUNCTION obj_tracker.on_ddl_command_end() RETURNS event_trigger
    LANGUAGE plpgsql SECURITY DEFINER SET search_path = pg_catalog, pg_temp AS $$
    BEGIN
        PERFORM obj_tracker.handle_ddl_command_end(TG_TAG);
    END;
    $$;

    CREATE FUNCTION obj_tracker.on_sql_drop() RETURNS event_trigger
    LANGUAGE plpgsql SECURITY DEFINER SET search_path = pg_catalog, pg_temp AS $$
    BEGIN
        PERFORM obj_tracker.handle_sql_drop(TG_TAG);
    END;
    $$;

    CREATE EVENT TRIGGER obj_tracker_ddl_end ON ddl_command_end
        EXECUTE FUNCTION obj_tracker.on_ddl_command_end();

    CREATE EVENT TRIGGER obj_tracker_sql_drop ON sql_drop
        EXECUTE FUNCTION obj_tracker.on_sql_drop();

    SELECT obj_tracker.reconcile(false);
    ",
    name = "create_views_and_event_triggers",
    finalize,
);

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_tracked_objects_schema() {
        let columns = Spi::connect(|client| {
            let mut columns = Vec::new();
            let query = "
                SELECT column_name::text, data_type::text, is_nullable::text
                FROM information_schema.columns
                WHERE table_schema = 'obj_tracker' AND table_name = 'tracked_objects'
                ORDER BY ordinal_position
            ";

            for row in client.select(query, None, None)? {
                let name: String = row.get(1)?.unwrap_or_default();
                let data_type: String = row.get(2)?.unwrap_or_default();
                let nullable: String = row.get(3)?.unwrap_or_default();
                columns.push((name, data_type, nullable));
            }

            Ok::<_, pgrx::spi::SpiError>(columns)
        }).expect("Failed to query column info");

        let expected_columns = vec![
            ("id", "bigint", "NO"),
            ("object_schema", "text", "NO"),
            ("object_name", "text", "NO"),
            ("object_type", "text", "NO"),
            ("status", "text", "NO"),
            ("created_at", "timestamp with time zone", "NO"),
            ("last_change_at", "timestamp with time zone", "NO"),
            ("last_operation", "text", "NO"),
            ("native_handle", "oid", "YES"),
        ];

        for (expected_name, expected_type, expected_nullable) in expected_columns {
            let found = columns.iter().any(|(name, data_type, nullable)| {
                name == expected_name && data_type == expected_type && nullable == expected_nullable
            });
            assert!(found, "Column {} with type {} nullable {} not found", expected_name, expected_type, expected_nullable);
        }
    }

    #[pg_test(error = "duplicate key value violates unique constraint \"tracked_objects_key\"")]
    fn test_key_is_unique() {
        let insert = "INSERT INTO obj_tracker.tracked_objects (object_schema, object_name, object_type, last_operation)
                      VALUES ('s', 'n', 'TABLE', 'CREATE TABLE')";
        Spi::run(insert).unwrap();
        Spi::run(insert).unwrap();
    }

    #[pg_test]
    fn test_event_triggers_installed() {
        let count = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_event_trigger
             WHERE evtname IN ('obj_tracker_ddl_end', 'obj_tracker_sql_drop') AND evtenabled <> 'D'",
        );
        assert_eq!(count, Ok(Some(2)));
    }
}
