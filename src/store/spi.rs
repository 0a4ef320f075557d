//! `ObjectStore` over `obj_tracker.tracked_objects`, via SPI.
//!
//! Runs inside the caller's transaction: a rolled-back DDL statement takes
//! its tracker writes with it. Timestamps come from `clock_timestamp()` so
//! several events in one transaction still advance `last_change_at`.

use chrono::{DateTime, Utc};
use pgrx::prelude::*;
use pgrx::IntoDatum;

use super::{DropPattern, ObjectStatus, ObjectStore, ObjectWrite, TrackedObject, UpsertOutcome};
use crate::config::TRACKER_TABLE;
use crate::error::{TrackerError, TrackerResult};
use crate::object_type::ObjectType;

type SpiArgs = Vec<(PgOid, Option<pg_sys::Datum>)>;

const UPSERT_SQL: &str = "\
    INSERT INTO obj_tracker.tracked_objects AS t \
        (object_schema, object_name, object_type, status, created_at, last_change_at, \
         last_operation, native_handle) \
    VALUES ($1, $2, $3, 'VALID', clock_timestamp(), clock_timestamp(), $4, $5) \
    ON CONFLICT (object_schema, object_name, object_type) DO UPDATE SET \
        last_change_at = clock_timestamp(), \
        last_operation = EXCLUDED.last_operation, \
        native_handle = COALESCE(EXCLUDED.native_handle, t.native_handle), \
        status = CASE WHEN $6 THEN 'VALID' ELSE t.status END, \
        created_at = CASE WHEN $6 THEN clock_timestamp() ELSE t.created_at END \
    RETURNING id, (xmax = 0) AS inserted";

const INSERT_IF_ABSENT_SQL: &str = "\
    INSERT INTO obj_tracker.tracked_objects \
        (object_schema, object_name, object_type, status, created_at, last_change_at, \
         last_operation, native_handle) \
    VALUES ($1, $2, $3, 'VALID', clock_timestamp(), clock_timestamp(), $4, $5) \
    ON CONFLICT (object_schema, object_name, object_type) DO NOTHING \
    RETURNING id";

const MARK_DROPPED_SQL: &str = "\
    UPDATE obj_tracker.tracked_objects SET \
        status = 'INVALID', \
        last_change_at = clock_timestamp(), \
        last_operation = $4 \
    WHERE object_schema = COALESCE($1, object_schema) \
      AND object_name = COALESCE($2, object_name) \
      AND upper(object_type) = ANY($3) \
    RETURNING id";

const ENUMERATE_SQL: &str = "\
    SELECT id, object_schema, object_name, object_type, status, \
           EXTRACT(EPOCH FROM created_at)::float8 AS created_epoch, \
           EXTRACT(EPOCH FROM last_change_at)::float8 AS changed_epoch, \
           last_operation, native_handle \
    FROM obj_tracker.tracked_objects \
    ORDER BY id";

const CLEAR_SQL: &str = "\
    WITH removed AS (DELETE FROM obj_tracker.tracked_objects RETURNING 1) \
    SELECT count(*) AS removed FROM removed";

/// Store backed by the extension's table; stateless, every call goes through SPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiStore;

fn text_arg(value: &str) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), value.into_datum())
}

fn write_args(write: &ObjectWrite<'_>) -> SpiArgs {
    vec![
        text_arg(&write.key.schema),
        text_arg(&write.key.name),
        text_arg(write.key.object_type.as_str()),
        text_arg(write.operation),
        (
            PgOid::BuiltIn(PgBuiltInOids::OIDOID),
            write.native_handle.map(pg_sys::Oid::from).into_datum(),
        ),
    ]
}

fn spi_failure(query: &str, e: pgrx::spi::Error) -> TrackerError {
    TrackerError::SpiError {
        query: query.to_string(),
        error: e.to_string(),
    }
}

fn epoch_to_utc(epoch: f64, column: &str) -> TrackerResult<DateTime<Utc>> {
    #[allow(clippy::cast_possible_truncation)]
    let micros = (epoch * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| TrackerError::MalformedRow {
        table: TRACKER_TABLE.to_string(),
        column: column.to_string(),
    })
}

fn required<T>(value: Option<T>, column: &str) -> TrackerResult<T> {
    value.ok_or_else(|| TrackerError::MalformedRow {
        table: TRACKER_TABLE.to_string(),
        column: column.to_string(),
    })
}

impl ObjectStore for SpiStore {
    fn upsert(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<UpsertOutcome> {
        let mut args = write_args(write);
        args.push((PgOid::BuiltIn(PgBuiltInOids::BOOLOID), write.is_creation().into_datum()));

        let outcome = Spi::connect(|mut client| {
            let rows = client.update(UPSERT_SQL, None, Some(args))?;
            let mut outcome = None;
            for row in rows {
                let id: Option<i64> = row["id"].value()?;
                let inserted: Option<bool> = row["inserted"].value()?;
                outcome = Some((id, inserted.unwrap_or(false)));
            }
            Ok::<_, pgrx::spi::Error>(outcome)
        })
        .map_err(|e| spi_failure(UPSERT_SQL, e))?;

        match outcome {
            Some((Some(id), true)) => Ok(UpsertOutcome::Inserted { id }),
            Some((Some(id), false)) => Ok(UpsertOutcome::Merged { id }),
            _ => Err(crate::internal_error!("upsert returned no row for {:?}", write.key)),
        }
    }

    fn insert_if_absent(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<bool> {
        let args = write_args(write);

        Spi::connect(|mut client| {
            let rows = client.update(INSERT_IF_ABSENT_SQL, None, Some(args))?;
            Ok::<_, pgrx::spi::Error>(!rows.is_empty())
        })
        .map_err(|e| spi_failure(INSERT_IF_ABSENT_SQL, e))
    }

    fn mark_dropped(&mut self, pattern: &DropPattern, operation: &str) -> TrackerResult<Vec<i64>> {
        let types: Vec<String> = pattern.types.iter().map(|t| t.as_str().to_uppercase()).collect();
        let args = vec![
            (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), pattern.schema.clone().into_datum()),
            (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), pattern.name.clone().into_datum()),
            (PgOid::BuiltIn(PgBuiltInOids::TEXTARRAYOID), types.into_datum()),
            text_arg(operation),
        ];

        Spi::connect(|mut client| {
            let rows = client.update(MARK_DROPPED_SQL, None, Some(args))?;
            let mut ids = Vec::new();
            for row in rows {
                if let Some(id) = row["id"].value::<i64>()? {
                    ids.push(id);
                }
            }
            Ok::<_, pgrx::spi::Error>(ids)
        })
        .map_err(|e| spi_failure(MARK_DROPPED_SQL, e))
    }

    fn enumerate(&self) -> TrackerResult<Vec<TrackedObject>> {
        let raw = Spi::connect(|client| {
            let rows = client.select(ENUMERATE_SQL, None, None)?;
            let mut raw = Vec::new();
            for row in rows {
                raw.push((
                    row["id"].value::<i64>()?,
                    row["object_schema"].value::<String>()?,
                    row["object_name"].value::<String>()?,
                    row["object_type"].value::<String>()?,
                    row["status"].value::<String>()?,
                    row["created_epoch"].value::<f64>()?,
                    row["changed_epoch"].value::<f64>()?,
                    row["last_operation"].value::<String>()?,
                    row["native_handle"].value::<pg_sys::Oid>()?,
                ));
            }
            Ok::<_, pgrx::spi::Error>(raw)
        })
        .map_err(|e| spi_failure(ENUMERATE_SQL, e))?;

        raw.into_iter()
            .map(|(id, schema, name, object_type, status, created, changed, operation, handle)| {
                Ok(TrackedObject {
                    id: required(id, "id")?,
                    schema: required(schema, "object_schema")?,
                    name: required(name, "object_name")?,
                    object_type: ObjectType::parse(&required(object_type, "object_type")?),
                    status: ObjectStatus::parse(&required(status, "status")?)?,
                    created_at: epoch_to_utc(required(created, "created_at")?, "created_at")?,
                    last_change_at: epoch_to_utc(required(changed, "last_change_at")?, "last_change_at")?,
                    last_operation: required(operation, "last_operation")?,
                    native_handle: handle.map(|oid| oid.as_u32()),
                })
            })
            .collect()
    }

    fn clear(&mut self) -> TrackerResult<usize> {
        let removed = Spi::connect(|mut client| {
            let rows = client.update(CLEAR_SQL, None, None)?;
            let mut removed = 0_i64;
            for row in rows {
                removed = row["removed"].value::<i64>()?.unwrap_or(0);
            }
            Ok::<_, pgrx::spi::Error>(removed)
        })
        .map_err(|e| spi_failure(CLEAR_SQL, e))?;

        usize::try_from(removed).map_err(|_| crate::internal_error!("negative row count {}", removed))
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::identity::ObjectKey;

    fn reset() {
        Spi::run("DELETE FROM obj_tracker.tracked_objects").unwrap();
    }

    #[pg_test]
    fn test_spi_upsert_merges_on_key() {
        reset();
        let mut store = SpiStore;
        let key = ObjectKey::new("app", "orders", ObjectType::Table);
        let write = ObjectWrite { key: &key, operation: "CREATE TABLE", native_handle: Some(4242) };

        let first = store.upsert(&write).unwrap();
        let second = store.upsert(&ObjectWrite { operation: "ALTER TABLE", native_handle: None, ..write.clone() }).unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted { .. }));
        assert_eq!(second, UpsertOutcome::Merged { id: first.id() });

        let rows = store.enumerate().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_operation, "ALTER TABLE");
        assert_eq!(rows[0].native_handle, Some(4242));
        assert!(rows[0].last_change_at > rows[0].created_at);
    }

    #[pg_test]
    fn test_spi_insert_if_absent_is_insert_only() {
        reset();
        let mut store = SpiStore;
        let key = ObjectKey::new("app", "orders", ObjectType::Table);

        assert!(store.insert_if_absent(&ObjectWrite { key: &key, operation: "INITIAL_LOAD", native_handle: None }).unwrap());
        assert!(!store.insert_if_absent(&ObjectWrite { key: &key, operation: "INITIAL_LOAD", native_handle: None }).unwrap());
        assert_eq!(store.enumerate().unwrap().len(), 1);
    }

    #[pg_test]
    fn test_spi_mark_dropped_with_open_schema() {
        reset();
        let mut store = SpiStore;
        let a = ObjectKey::new("app", "orders", ObjectType::Table);
        let b = ObjectKey::new("archive", "orders", ObjectType::Partition);
        store.upsert(&ObjectWrite { key: &a, operation: "CREATE TABLE", native_handle: None }).unwrap();
        store.upsert(&ObjectWrite { key: &b, operation: "CREATE TABLE", native_handle: None }).unwrap();

        let pattern = DropPattern {
            schema: None,
            name: Some("orders".to_string()),
            types: ObjectType::drop_candidates("table"),
        };
        let ids = store.mark_dropped(&pattern, "DROP TABLE").unwrap();
        assert_eq!(ids.len(), 2);

        let invalid = Spi::get_one::<i64>(
            "SELECT count(*) FROM obj_tracker.tracked_objects WHERE status = 'INVALID'",
        );
        assert_eq!(invalid, Ok(Some(2)));
    }

    #[pg_test]
    fn test_spi_alter_after_drop_keeps_invalid() {
        reset();
        let mut store = SpiStore;
        let key = ObjectKey::new("app", "orders", ObjectType::Table);
        store.upsert(&ObjectWrite { key: &key, operation: "CREATE TABLE", native_handle: None }).unwrap();
        let pattern = DropPattern {
            schema: Some("app".to_string()),
            name: Some("orders".to_string()),
            types: vec![ObjectType::Table],
        };
        store.mark_dropped(&pattern, "DROP TABLE").unwrap();
        let created = store.enumerate().unwrap()[0].created_at;

        let outcome = store.upsert(&ObjectWrite { key: &key, operation: "ALTER TABLE", native_handle: None }).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Merged { .. }));

        let row = &store.enumerate().unwrap()[0];
        assert_eq!(row.status, ObjectStatus::Invalid);
        assert_eq!(row.last_operation, "ALTER TABLE");
        assert_eq!(row.created_at, created);

        // SELECT INTO re-creates the table
        store.upsert(&ObjectWrite { key: &key, operation: "SELECT INTO", native_handle: None }).unwrap();
        assert_eq!(store.enumerate().unwrap()[0].status, ObjectStatus::Valid);
    }

    #[pg_test]
    fn test_spi_clear_counts_rows() {
        reset();
        let mut store = SpiStore;
        let key = ObjectKey::new("app", "orders", ObjectType::Table);
        store.upsert(&ObjectWrite { key: &key, operation: "CREATE TABLE", native_handle: None }).unwrap();

        assert_eq!(store.clear().unwrap(), 1);
        assert_eq!(store.clear().unwrap(), 0);
    }
}
