//! Reconciliation Loader
//!
//! Seeds the store with every object that already exists. Writes are
//! insert-only: a key that is already tracked keeps its status, timestamps
//! and last operation, so re-running never rewrites real change history.

use pgrx::prelude::*;
use pgrx::JsonB;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogSource, PgCatalog};
use crate::config::INITIAL_LOAD_OPERATION;
use crate::error::TrackerResult;
use crate::identity;
use crate::ingest::is_excluded_schema;
use crate::store::spi::SpiStore;
use crate::store::{ObjectStore, ObjectWrite};

/// Counts from one reconciliation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub cleared: usize,
    pub scanned: usize,
    pub inserted: usize,
    /// Already tracked, or left out by namespace
    pub skipped: usize,
}

pub fn reconcile<S, C>(store: &mut S, source: &C, clear_first: bool) -> TrackerResult<ReconcileReport>
where
    S: ObjectStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    let mut report = ReconcileReport::default();

    if clear_first {
        report.cleared = store.clear()?;
    }

    for object in source.existing_objects()? {
        report.scanned += 1;

        let key = identity::resolve(&object.identity, object.object_type(), object.schema.as_deref());
        if is_excluded_schema(&key.schema) {
            report.skipped += 1;
            continue;
        }

        let write = ObjectWrite {
            key: &key,
            operation: INITIAL_LOAD_OPERATION,
            native_handle: object.oid,
        };
        if store.insert_if_absent(&write)? {
            report.inserted += 1;
        } else {
            report.skipped += 1;
        }
    }

    Ok(report)
}

fn reconcile_report_json(clear_first: bool) -> TrackerResult<JsonB> {
    let report = reconcile(&mut SpiStore, &PgCatalog, clear_first)?;

    info!(
        "obj_tracker: reconciliation scanned {} objects, inserted {}, skipped {}{}",
        report.scanned,
        report.inserted,
        report.skipped,
        if clear_first { format!(" (cleared {} rows first)", report.cleared) } else { String::new() }
    );

    Ok(JsonB(serde_json::to_value(report)?))
}

/// SQL function: seed the tracker from the live catalog
///
/// Usage: SELECT obj_tracker.reconcile();       -- keep existing rows
///        SELECT obj_tracker.reconcile(true);   -- start from an empty store
#[pg_extern(name = "reconcile")]
fn reconcile_objects(clear_first: default!(bool, false)) -> JsonB {
    match reconcile_report_json(clear_first) {
        Ok(report) => report,
        Err(e) => error!("obj_tracker: reconciliation failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogObject;
    use crate::identity::ObjectKey;
    use crate::object_type::{CatalogDetail, ObjectType};
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStatus;

    fn existing(kind: &str, schema: Option<&str>, identity: &str, detail: CatalogDetail) -> CatalogObject {
        CatalogObject {
            kind: kind.to_string(),
            schema: schema.map(str::to_string),
            identity: identity.to_string(),
            detail,
            oid: Some(20000),
        }
    }

    fn sample_catalog() -> Vec<CatalogObject> {
        vec![
            existing("schema", None, "hr", CatalogDetail::Unknown),
            existing("table", Some("hr"), "hr.employees", CatalogDetail::Relation { relkind: 'r', is_partition: false }),
            existing("table", Some("hr"), "hr.payroll_2024", CatalogDetail::Relation { relkind: 'r', is_partition: true }),
            existing("function", Some("hr"), "hr.headcount(hr.dept_t)", CatalogDetail::Routine { prokind: 'f' }),
            existing("type", Some("hr"), "hr.dept_t", CatalogDetail::Type { typtype: 'e' }),
            existing("foreign table", Some("hr"), "hr.remote_staff", CatalogDetail::Relation { relkind: 'f', is_partition: false }),
        ]
    }

    #[test]
    fn test_reconcile_seeds_every_object() {
        let mut store = MemoryStore::new();
        let report = reconcile(&mut store, &sample_catalog(), false).unwrap();

        assert_eq!(report.scanned, 6);
        assert_eq!(report.inserted, 6);
        assert!(store.enumerate().unwrap().iter().all(|r| r.last_operation == "INITIAL_LOAD"
            && r.status == ObjectStatus::Valid));

        assert!(store.get(&ObjectKey::new("hr", "payroll_2024", ObjectType::Partition)).is_some());
        assert!(store.get(&ObjectKey::new("hr", "headcount(hr.dept_t)", ObjectType::Function)).is_some());
        assert!(store.get(&ObjectKey::new("hr", "dept_t", ObjectType::Enum)).is_some());
        assert!(store.get(&ObjectKey::new("hr", "hr", ObjectType::Schema)).is_some());
        // unmapped kinds are recorded, not dropped
        assert!(store.get(&ObjectKey::new("hr", "remote_staff", ObjectType::Other)).is_some());
    }

    #[test]
    fn test_reconcile_twice_is_idempotent() {
        let mut store = MemoryStore::new();
        reconcile(&mut store, &sample_catalog(), false).unwrap();
        let first = store.enumerate().unwrap();

        let report = reconcile(&mut store, &sample_catalog(), false).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 6);
        assert_eq!(store.enumerate().unwrap(), first);
    }

    #[test]
    fn test_reconcile_preserves_tracked_history() {
        let mut store = MemoryStore::new();
        let key = ObjectKey::new("hr", "employees", ObjectType::Table);
        store
            .upsert(&ObjectWrite { key: &key, operation: "ALTER TABLE", native_handle: None })
            .unwrap();
        let pattern = crate::store::DropPattern {
            schema: Some("hr".to_string()),
            name: Some("employees".to_string()),
            types: vec![ObjectType::Table],
        };
        store.mark_dropped(&pattern, "DROP TABLE").unwrap();
        let before = store.get(&key).unwrap().clone();

        reconcile(&mut store, &sample_catalog(), false).unwrap();

        let after = store.get(&key).unwrap();
        assert_eq!(after, &before);
        assert_eq!(after.status, ObjectStatus::Invalid);
    }

    #[test]
    fn test_reconcile_clear_first_starts_over() {
        let mut store = MemoryStore::new();
        let stale = ObjectKey::new("old", "gone", ObjectType::View);
        store
            .upsert(&ObjectWrite { key: &stale, operation: "CREATE VIEW", native_handle: None })
            .unwrap();

        let report = reconcile(&mut store, &sample_catalog(), true).unwrap();
        assert_eq!(report.cleared, 1);
        assert_eq!(report.inserted, 6);
        assert!(store.get(&stale).is_none());
    }

    #[test]
    fn test_reconcile_skips_excluded_namespaces() {
        let mut store = MemoryStore::new();
        let catalog = vec![existing(
            "table",
            Some("obj_tracker"),
            "obj_tracker.tracked_objects",
            CatalogDetail::Relation { relkind: 'r', is_partition: false },
        )];

        let report = reconcile(&mut store, &catalog, false).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_report_serializes() {
        let report = ReconcileReport { cleared: 0, scanned: 3, inserted: 2, skipped: 1 };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["skipped"], 1);
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod pg_tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_reconcile_sql_is_insert_only() {
        Spi::run("SET LOCAL obj_tracker.enabled = off").unwrap();
        Spi::run("CREATE TABLE public.legacy_orders (id int)").unwrap();
        Spi::run("SET LOCAL obj_tracker.enabled = on").unwrap();

        let first = Spi::get_one::<pgrx::JsonB>("SELECT obj_tracker.reconcile()").unwrap().unwrap();
        assert!(first.0["inserted"].as_u64().unwrap_or(0) >= 1);

        let op = Spi::get_one::<String>(
            "SELECT last_operation FROM obj_tracker.tracked_objects \
             WHERE object_schema = 'public' AND object_name = 'legacy_orders' AND object_type = 'TABLE'",
        );
        assert_eq!(op, Ok(Some("INITIAL_LOAD".to_string())));

        let second = Spi::get_one::<pgrx::JsonB>("SELECT obj_tracker.reconcile(false)").unwrap().unwrap();
        assert_eq!(second.0["inserted"].as_u64(), Some(0));

        let rows = Spi::get_one::<i64>(
            "SELECT count(*) FROM obj_tracker.tracked_objects WHERE object_name = 'legacy_orders'",
        );
        assert_eq!(rows, Ok(Some(1)));
    }
}
