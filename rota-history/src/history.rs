use ahash::AHashMap;
use chrono::{DateTime, TimeDelta, Utc};
use moka::sync::Cache;
use rota_model::{Entity, EntityId};
use std::sync::Arc;

use crate::entry::HistoryEntry;
use crate::error::HistoryError;

pub const DEFAULT_MEMO_CAPACITY: u64 = 4096;

type MemoKey = (EntityId, i64);

pub struct EntityHistory {
    entries: AHashMap<EntityId, Vec<HistoryEntry>>,
    /// Decoded entities keyed by (id, timestamp millis).
    materialized: Cache<MemoKey, Arc<Entity>>,
    retention: TimeDelta,
}

impl EntityHistory {
    pub fn new(retention: TimeDelta, memo_capacity: u64) -> Self {
        Self {
            entries: AHashMap::new(),
            materialized: Cache::builder().max_capacity(memo_capacity.max(1)).build(),
            retention,
        }
    }

    pub fn retention(&self) -> TimeDelta {
        self.retention
    }

    pub fn add_entity(
        &mut self,
        entity: &Entity,
        timestamp: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        let payload: Arc<str> = serde_json::to_string(entity)?.into();
        self.insert(HistoryEntry::changed(entity.id.clone(), timestamp, payload));
        Ok(())
    }

    pub fn add_serialized(&mut self, id: EntityId, timestamp: DateTime<Utc>, payload: Arc<str>) {
        self.insert(HistoryEntry::changed(id, timestamp, payload));
    }

    pub fn add_delete(&mut self, id: EntityId, timestamp: DateTime<Utc>) {
        self.insert(HistoryEntry::deleted(id, timestamp));
    }

    fn insert(&mut self, entry: HistoryEntry) {
        let list = self.entries.entry(entry.id().clone()).or_default();
        let ts = entry.timestamp();
        let end = list.partition_point(|e| e.timestamp() <= ts);
        let start = list[..end].partition_point(|e| e.timestamp() < ts);
        if list[start..end].iter().any(|e| *e == entry) {
            return;
        }
        if start < end {
            // A different payload at the same instant supersedes the memoized one.
            self.materialized
                .invalidate(&(entry.id().clone(), ts.timestamp_millis()));
        }
        list.insert(end, entry);
    }

    /// Newest entry for `id` whose timestamp is not after `timestamp`.
    ///
    /// `None` means the entity is unknown at that point in time.
    pub fn get_last_changed_until(
        &self,
        id: &EntityId,
        timestamp: DateTime<Utc>,
    ) -> Option<&HistoryEntry> {
        let list = self.entries.get(id)?;
        let idx = list.partition_point(|e| e.timestamp() <= timestamp);
        idx.checked_sub(1).map(|i| &list[i])
    }

    pub fn latest(&self, id: &EntityId) -> Option<&HistoryEntry> {
        self.entries.get(id).and_then(|list| list.last())
    }

    /// Decodes the entity recorded by a non-delete entry.
    pub fn get_entity(&self, entry: &HistoryEntry) -> Result<Arc<Entity>, HistoryError> {
        let payload = entry
            .payload()
            .ok_or_else(|| HistoryError::Deleted(entry.id().clone()))?;
        let key = (entry.id().clone(), entry.timestamp().timestamp_millis());
        if let Some(hit) = self.materialized.get(&key) {
            return Ok(hit);
        }

        let entity: Entity =
            serde_json::from_str(payload).map_err(|source| HistoryError::Decode {
                id: entry.id().clone(),
                source,
            })?;
        if entity.id != *entry.id() {
            return Err(HistoryError::IdMismatch {
                id: entry.id().clone(),
                found: entity.id,
            });
        }
        let entity = Arc::new(entity);
        self.materialized.insert(key, entity.clone());
        Ok(entity)
    }

    /// Oldest timestamp for which lookups are guaranteed to be answerable.
    pub fn valid_start(&self, last_updated: DateTime<Utc>) -> DateTime<Utc> {
        last_updated
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Drops entries that fell out of the retention window relative to `now`.
    ///
    /// The newest entry before the cutoff survives as the baseline for lookups
    /// at the window start, unless it is a deletion.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = self.valid_start(now);
        let mut removed = 0;
        self.entries.retain(|_, list| {
            let older = list.partition_point(|e| e.timestamp() < cutoff);
            if older == 0 {
                return true;
            }
            let baseline_is_delete = list[older - 1].is_delete();
            let drop = if baseline_is_delete && older == list.len() {
                older
            } else {
                older - 1
            };
            removed += drop;
            list.drain(..drop);
            !list.is_empty()
        });
        if removed > 0 {
            self.materialized.run_pending_tasks();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.materialized.invalidate_all();
    }

    /// Number of ids with at least one entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EntityHistory {
    fn default() -> Self {
        Self::new(TimeDelta::hours(1), DEFAULT_MEMO_CAPACITY)
    }
}
