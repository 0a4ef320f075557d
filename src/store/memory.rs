//! In-process store with the same contract as the SPI-backed one.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::{DropPattern, ObjectStatus, ObjectStore, ObjectWrite, TrackedObject, UpsertOutcome};
use crate::error::TrackerResult;
use crate::identity::ObjectKey;

/// Clock that never hands out the same instant twice
#[derive(Debug, Default)]
struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Vec<TrackedObject>,
    by_key: HashMap<ObjectKey, usize>,
    next_id: i64,
    clock: MonotonicClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&TrackedObject> {
        self.by_key.get(key).and_then(|&idx| self.rows.get(idx))
    }

    fn insert(&mut self, write: &ObjectWrite<'_>) -> i64 {
        let now = self.clock.tick();
        self.next_id += 1;
        let id = self.next_id;

        self.by_key.insert(write.key.clone(), self.rows.len());
        self.rows.push(TrackedObject {
            id,
            schema: write.key.schema.clone(),
            name: write.key.name.clone(),
            object_type: write.key.object_type,
            status: ObjectStatus::Valid,
            created_at: now,
            last_change_at: now,
            last_operation: write.operation.to_string(),
            native_handle: write.native_handle,
        });
        id
    }
}

impl ObjectStore for MemoryStore {
    fn upsert(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<UpsertOutcome> {
        let Some(&idx) = self.by_key.get(write.key) else {
            return Ok(UpsertOutcome::Inserted { id: self.insert(write) });
        };

        let now = self.clock.tick();
        let creation = write.is_creation();
        let row = self
            .rows
            .get_mut(idx)
            .ok_or_else(|| crate::internal_error!("key index points past row {}", idx))?;

        row.last_change_at = now;
        row.last_operation = write.operation.to_string();
        if write.native_handle.is_some() {
            row.native_handle = write.native_handle;
        }
        if creation {
            row.status = ObjectStatus::Valid;
            row.created_at = now;
        }

        Ok(UpsertOutcome::Merged { id: row.id })
    }

    fn insert_if_absent(&mut self, write: &ObjectWrite<'_>) -> TrackerResult<bool> {
        if self.by_key.contains_key(write.key) {
            return Ok(false);
        }
        self.insert(write);
        Ok(true)
    }

    fn mark_dropped(&mut self, pattern: &DropPattern, operation: &str) -> TrackerResult<Vec<i64>> {
        let now = self.clock.tick();
        let mut affected = Vec::new();

        for row in self.rows.iter_mut().filter(|r| pattern.matches(r)) {
            row.status = ObjectStatus::Invalid;
            row.last_change_at = now;
            row.last_operation = operation.to_string();
            affected.push(row.id);
        }

        Ok(affected)
    }

    fn enumerate(&self) -> TrackerResult<Vec<TrackedObject>> {
        Ok(self.rows.clone())
    }

    fn clear(&mut self) -> TrackerResult<usize> {
        let removed = self.rows.len();
        self.rows.clear();
        self.by_key.clear();
        Ok(removed)
    }
}
