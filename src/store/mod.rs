//! Tracked Object Store
//!
//! One row per distinct `(schema, name, type)`. Rows are never removed by a
//! drop; a drop moves the row to `INVALID`. Callers depend only on
//! [`ObjectStore`]:
//! - [`ObjectStore::upsert`]: merge-on-conflict write used by create/alter events
//! - [`ObjectStore::insert_if_absent`]: insert-only write used by reconciliation
//! - [`ObjectStore::mark_dropped`]: best-effort pattern match used by drop events
//! - [`ObjectStore::enumerate`] / [`ObjectStore::clear`]
//!
//! Two implementations: [`spi::SpiStore`] over `obj_tracker.tracked_objects`
//! and [`memory::MemoryStore`] for running the engine outside a backend.

pub mod memory;
pub mod spi;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TrackerError, TrackerResult};
use crate::identity::ObjectKey;
use crate::object_type::ObjectType;

/// Existence flag of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectStatus {
    Valid,
    Invalid,
}

impl ObjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectStatus::Valid => "VALID",
            ObjectStatus::Invalid => "INVALID",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "VALID" => Ok(ObjectStatus::Valid),
            "INVALID" => Ok(ObjectStatus::Invalid),
            other => Err(TrackerError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: i64,
    pub schema: String,
    pub name: String,
    pub object_type: ObjectType,
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub last_change_at: DateTime<Utc>,
    /// Verbatim tag of the most recent event
    pub last_operation: String,
    /// Host OID at last observation, diagnostics only
    pub native_handle: Option<u32>,
}

impl TrackedObject {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.schema.clone(), self.name.clone(), self.object_type)
    }
}

/// A write to the store for one resolved object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectWrite<'a> {
    pub key: &'a ObjectKey,
    /// Command tag (`CREATE TABLE`, `ALTER FUNCTION`, `INITIAL_LOAD`, ...)
    pub operation: &'a str,
    pub native_handle: Option<u32>,
}

impl ObjectWrite<'_> {
    /// Creation-class tags reset status and `created_at` on merge.
    pub fn is_creation(&self) -> bool {
        is_creation_tag(self.operation)
    }
}

/// Case-insensitive `CREATE` prefix test
/// `CREATE ...` tags, plus `SELECT INTO`, which also creates its target table
pub fn is_creation_tag(tag: &str) -> bool {
    let tag = tag.trim();
    tag.eq_ignore_ascii_case("SELECT INTO")
        || tag
            .get(..6)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("CREATE"))
}

/// Whether an upsert created the row or merged into an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Merged { id: i64 },
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            UpsertOutcome::Inserted { id } | UpsertOutcome::Merged { id } => id,
        }
    }
}

/// Selection used by drops: `None` fields match any stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropPattern {
    pub schema: Option<String>,
    pub name: Option<String>,
    /// Compared case-insensitively against the stored type
    pub types: Vec<ObjectType>,
}

impl DropPattern {
    pub fn matches(&self, row: &TrackedObject) -> bool {
        let schema_ok = self.schema.as_ref().is_none_or(|s| *s == row.schema);
        let name_ok = self.name.as_ref().is_none_or(|n| *n == row.name);
        let type_ok = self
            .types
            .iter()
            .any(|t| t.as_str().eq_ignore_ascii_case(row.object_type.as_str()));

        schema_ok && name_ok && type_ok
    }
}

/// Narrow interface over the tracking table
pub trait ObjectStore {
    /// Insert a VALID row, or merge into the row with the same key.
    ///
    /// On merge `last_change_at` and `last_operation` always move; status and
    /// `created_at` are reset only for creation-class tags.
    fn upsert(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<UpsertOutcome>;

    /// Insert a VALID row unless the key is already present. Returns whether a
    /// row was inserted; existing rows are never modified.
    fn insert_if_absent(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<bool>;

    /// Move every row matching `pattern` to INVALID with `operation` as last
    /// operation. Returns the ids of affected rows, possibly none.
    fn mark_dropped(&mut self, pattern: &DropPattern, operation: &str) -> TrackerResult<Vec<i64>>;

    /// All rows, in id order
    fn enumerate(&self) -> TrackerResult<Vec<TrackedObject>>;

    /// Remove every row. Returns how many were removed.
    fn clear(&mut self) -> TrackerResult<usize>;
}
