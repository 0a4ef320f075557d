//! Query Projection
//!
//! Read-only rendering of the store. Routine rows keep their full signature
//! for disambiguation and get a short display name (`get_count(integer)` is
//! shown as `get_count`); every other type displays its stored name. Rows
//! are ordered by owner, display name, type.
//!
//! The SQL view `obj_tracker.all_objects` calls [`display_name`] through its
//! SQL binding, so the view and [`project`] render identically.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use pgrx::prelude::*;
use pgrx::JsonB;
use regex::Regex;
use serde::Serialize;

use crate::error::TrackerResult;
use crate::object_type::ObjectType;
use crate::store::spi::SpiStore;
use crate::store::{ObjectStatus, ObjectStore, TrackedObject};

/// Routine head: everything before the first `(`, then the last dotted segment of it
static ROUTINE_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[^(]*\.)?([^.(]*)\(").expect("routine head pattern is valid")
});

pub fn display_name(object_type: ObjectType, name: &str) -> String {
    if !object_type.is_routine() {
        return name.to_string();
    }

    ROUTINE_HEAD
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| name.to_string(), |m| m.as_str().to_string())
}

/// One row of the projection, shaped like a catalog `ALL_OBJECTS` listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectView {
    pub object_id: i64,
    pub owner: String,
    pub object_name: String,
    pub signature: String,
    pub object_type: ObjectType,
    pub status: ObjectStatus,
    pub created: DateTime<Utc>,
    pub last_ddl_time: DateTime<Utc>,
    pub last_operation: String,
    pub native_handle: Option<u32>,
}

impl From<TrackedObject> for ObjectView {
    fn from(row: TrackedObject) -> Self {
        Self {
            object_id: row.id,
            object_name: display_name(row.object_type, &row.name),
            owner: row.schema,
            signature: row.name,
            object_type: row.object_type,
            status: row.status,
            created: row.created_at,
            last_ddl_time: row.last_change_at,
            last_operation: row.last_operation,
            native_handle: row.native_handle,
        }
    }
}

pub fn project(rows: Vec<TrackedObject>) -> Vec<ObjectView> {
    let mut views: Vec<ObjectView> = rows.into_iter().map(ObjectView::from).collect();
    views.sort_by(|a, b| {
        a.owner
            .cmp(&b.owner)
            .then_with(|| a.object_name.cmp(&b.object_name))
            .then_with(|| a.object_type.as_str().cmp(b.object_type.as_str()))
    });
    views
}

/// SQL function used by the `all_objects` view
#[pg_extern(immutable, parallel_safe, name = "display_name")]
fn display_name_sql(object_type: &str, object_name: &str) -> String {
    display_name(ObjectType::parse(object_type), object_name)
}

fn projection_json() -> TrackerResult<JsonB> {
    let rows = SpiStore.enumerate()?;
    Ok(JsonB(serde_json::to_value(project(rows))?))
}

/// SQL function: the whole projection as a jsonb array
#[pg_extern]
fn objects_json() -> JsonB {
    match projection_json() {
        Ok(json) => json,
        Err(e) => error!("obj_tracker: failed to export tracked objects: {}", e),
    }
}
