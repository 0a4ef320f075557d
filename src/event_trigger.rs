//! Event Trigger handlers for DDL tracking
//!
//! Two event triggers feed the ingestor:
//!
//! ```sql
//! CREATE EVENT TRIGGER obj_tracker_ddl_end ON ddl_command_end
//!     EXECUTE FUNCTION obj_tracker.on_ddl_command_end();
//! CREATE EVENT TRIGGER obj_tracker_sql_drop ON sql_drop
//!     EXECUTE FUNCTION obj_tracker.on_sql_drop();
//! ```
//!
//! The `event_trigger` functions are thin plpgsql wrappers (see `metadata`)
//! that pass `TG_TAG` to the handlers below. Handlers run synchronously in
//! the DDL statement's transaction and read the affected objects from
//! `pg_event_trigger_ddl_commands()` / `pg_event_trigger_dropped_objects()`.
//!
//! # Failure policy
//! A tracking fault never aborts the DDL. Each handler body runs in an
//! internal subtransaction; on a `TrackerError` or a PostgreSQL `ERROR` the
//! subtransaction is rolled back and the fault is reported as a warning.

use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;
use pgrx::PgTryBuilder;

use crate::error::TrackerResult;
use crate::ingest::{self, ChangeEvent, ChangeOutcome, DropEvent, IngestOptions, TagClass};
use crate::object_type::CatalogDetail;
use crate::store::spi::SpiStore;

const DDL_COMMANDS_SQL: &str = "\
    SELECT c.objid, c.object_type, c.schema_name, c.object_identity, c.command_tag, c.in_extension, \
           r.relkind::text AS relkind, r.relispartition, \
           p.prokind::text AS prokind, \
           t.typtype::text AS typtype \
    FROM pg_event_trigger_ddl_commands() c \
    LEFT JOIN pg_class r ON c.classid = 'pg_class'::regclass AND r.oid = c.objid AND c.objsubid = 0 \
    LEFT JOIN pg_proc p ON c.classid = 'pg_proc'::regclass AND p.oid = c.objid \
    LEFT JOIN pg_type t ON c.classid = 'pg_type'::regclass AND t.oid = c.objid";

const DROPPED_OBJECTS_SQL: &str = "\
    SELECT object_type, schema_name, object_identity \
    FROM pg_event_trigger_dropped_objects() \
    WHERE NOT is_temporary";

fn first_char(code: Option<String>) -> Option<char> {
    code.and_then(|c| c.chars().next())
}

fn catalog_detail(
    relkind: Option<char>,
    is_partition: Option<bool>,
    prokind: Option<char>,
    typtype: Option<char>,
) -> CatalogDetail {
    match (relkind, prokind, typtype) {
        (Some(relkind), _, _) => CatalogDetail::Relation {
            relkind,
            is_partition: is_partition.unwrap_or(false),
        },
        (None, Some(prokind), _) => CatalogDetail::Routine { prokind },
        (None, None, Some(typtype)) => CatalogDetail::Type { typtype },
        (None, None, None) => CatalogDetail::Unknown,
    }
}

/// Get created/altered objects from pg_event_trigger_ddl_commands()
fn get_ddl_commands() -> spi::Result<Vec<ChangeEvent>> {
    Spi::connect(|client| {
        let results = client.select(DDL_COMMANDS_SQL, None, None)?;
        let mut events = Vec::new();

        for row in results {
            let objid: Option<pg_sys::Oid> = row["objid"].value()?;
            let relkind = first_char(row["relkind"].value()?);
            let prokind = first_char(row["prokind"].value()?);
            let typtype = first_char(row["typtype"].value()?);

            events.push(ChangeEvent {
                kind: row["object_type"].value::<String>()?.unwrap_or_default(),
                schema: row["schema_name"].value()?,
                identity: row["object_identity"].value::<String>()?.unwrap_or_default(),
                native_handle: objid.map(|oid| oid.as_u32()),
                command_tag: row["command_tag"].value::<String>()?.unwrap_or_default(),
                in_extension: row["in_extension"].value::<bool>()?.unwrap_or(false),
                detail: catalog_detail(relkind, row["relispartition"].value()?, prokind, typtype),
            });
        }

        Ok::<_, spi::Error>(events)
    })
}

/// Get removed objects from pg_event_trigger_dropped_objects()
fn get_dropped_objects(command_tag: &str) -> spi::Result<Vec<DropEvent>> {
    Spi::connect(|client| {
        let results = client.select(DROPPED_OBJECTS_SQL, None, None)?;
        let mut events = Vec::new();

        for row in results {
            events.push(DropEvent {
                kind: row["object_type"].value::<String>()?.unwrap_or_default(),
                schema: row["schema_name"].value()?,
                identity: row["object_identity"].value::<String>()?.unwrap_or_default(),
                command_tag: command_tag.to_string(),
            });
        }

        Ok::<_, spi::Error>(events)
    })
}

fn ingest_ddl_commands(options: IngestOptions) -> TrackerResult<usize> {
    let mut store = SpiStore;
    let mut applied = 0;

    for event in get_ddl_commands()? {
        match ingest::apply_change(&mut store, &event, options)? {
            ChangeOutcome::Applied { key, outcome } => {
                debug1!(
                    "obj_tracker: {} {}.{} ({}) -> row {}",
                    event.command_tag, key.schema, key.name, key.object_type, outcome.id()
                );
                applied += 1;
            }
            skipped => {
                debug1!("obj_tracker: skipped {} '{}': {:?}", event.command_tag, event.identity, skipped);
            }
        }
    }

    Ok(applied)
}

fn ingest_dropped_objects(command_tag: &str) -> TrackerResult<usize> {
    let mut store = SpiStore;
    let mut invalidated = 0;

    for event in get_dropped_objects(command_tag)? {
        let ids = ingest::apply_drop(&mut store, &event)?;
        if ids.is_empty() {
            debug1!("obj_tracker: {} '{}' matched no tracked object", command_tag, event.identity);
        } else {
            debug1!("obj_tracker: {} '{}' invalidated rows {:?}", command_tag, event.identity, ids);
        }
        invalidated += ids.len();
    }

    Ok(invalidated)
}

/// Run `body` in an internal subtransaction.
///
/// Committed when `body` returns `Ok`. Rolled back when it returns `Err`,
/// raises a PostgreSQL `ERROR` or panics; the latter two come back as
/// an internal `TrackerError`. Memory context and resource owner are
/// restored either way, so the caller's transaction stays usable.
fn in_subtransaction<F>(body: F) -> TrackerResult<usize>
where
    F: FnOnce() -> TrackerResult<usize> + std::panic::UnwindSafe,
{
    // SAFETY: called from a backend with an open transaction (event
    // trigger context); the saved context and owner outlive the
    // subtransaction.
    let (context, owner) = unsafe {
        let saved = (pg_sys::CurrentMemoryContext, pg_sys::CurrentResourceOwner);
        pg_sys::BeginInternalSubTransaction(std::ptr::null());
        saved
    };

    let restore = move |commit: bool| unsafe {
        if commit {
            pg_sys::ReleaseCurrentSubTransaction();
        } else {
            pg_sys::RollbackAndReleaseCurrentSubTransaction();
        }
        pg_sys::CurrentMemoryContext = context;
        pg_sys::CurrentResourceOwner = owner;
    };

    PgTryBuilder::new(|| {
        let result = body();
        restore(result.is_ok());
        result
    })
    .catch_others(|caught| {
        // SAFETY: the report was copied out of the error stack before unwinding
        unsafe { pg_sys::FlushErrorState() };
        restore(false);
        let message = match &caught {
            CaughtError::PostgresError(report)
            | CaughtError::ErrorReport(report)
            | CaughtError::RustPanic { ereport: report, .. } => report.message().to_string(),
        };
        Err(crate::internal_error!("tracking rolled back: {}", message))
    })
    .execute()
}

/// Handler for `ddl_command_end`, called with the statement's `TG_TAG`
#[pg_extern]
fn handle_ddl_command_end(command_tag: &str) {
    if !crate::config::tracking_enabled() || ingest::statement_class(command_tag) != TagClass::Change {
        return;
    }

    let options = IngestOptions {
        track_extension_objects: crate::config::track_extension_objects(),
    };

    if let Err(e) = in_subtransaction(move || ingest_ddl_commands(options)) {
        // Log error but don't fail the transaction
        warning!("obj_tracker: failed to record {}: {}", command_tag, e);
    }
}

/// Handler for `sql_drop`, called with the statement's `TG_TAG`
#[pg_extern]
fn handle_sql_drop(command_tag: &str) {
    if !crate::config::tracking_enabled() || ingest::statement_class(command_tag) != TagClass::Drop {
        return;
    }

    let tag = command_tag.to_string();
    if let Err(e) = in_subtransaction(move || ingest_dropped_objects(&tag)) {
        warning!("obj_tracker: failed to record {}: {}", command_tag, e);
    }
}
