use chrono::{DateTime, Utc};
use rota_history::{DEFAULT_MEMO_CAPACITY, EntityHistory};
use rota_model::{
    Entity, EntityBody, EntityId, PreferencePatch, Preferences, UpdateEvent, timestamp_from_millis,
};
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::cache::{EntityStore, LocalCache, migrate_templates};
use crate::config::StoreConfig;
use crate::db::{Datasource, LegacyMigration, LockManager, WriteScope, io, patch, schema};
use crate::error::StoreError;
use crate::operator::observer::{LockObserver, LockScope};
use crate::operator::tasks::{Cancellation, MaintenanceTasks, spawn_periodic};
use crate::snapshot::Snapshot;

/// Keeps a [`LocalCache`] in sync with a store shared by several writers.
///
/// Cloning is cheap; clones share one connection state. Reads go through the
/// published cache snapshot and never wait for writers.
#[derive(Clone)]
pub struct SyncOperator {
    inner: Arc<Inner>,
}

struct Inner {
    config: StoreConfig,
    datasource: Datasource,
    locks: LockManager,
    observer: Option<Arc<dyn LockObserver>>,
    cache: RwLock<Arc<LocalCache>>,
    /// Serializes every operation that changes the cache or the store.
    write: AsyncMutex<WriteState>,
    /// Mirror of `WriteState::last_updated` in epoch millis.
    last_updated: AtomicI64,
    connected: AtomicBool,
    tasks: Mutex<Option<MaintenanceTasks>>,
}

struct WriteState {
    history: EntityHistory,
    /// Commit time of the newest change reflected in the cache.
    last_updated: DateTime<Utc>,
}

/// What a single locked write puts into the store.
enum Write<'a> {
    Batch {
        event: &'a UpdateEvent,
        removals: &'a [EntityId],
        user: Option<&'a EntityId>,
    },
    Migration(&'a [Entity]),
    Password {
        user: &'a Entity,
        hash: Option<&'a str>,
    },
    /// Replaces the whole content, leaving the store empty for `None`.
    Replace(Option<&'a Snapshot>),
}

impl SyncOperator {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        Self::build(config, None)
    }

    pub fn with_observer(
        config: StoreConfig,
        observer: Arc<dyn LockObserver>,
    ) -> Result<Self, StoreError> {
        Self::build(config, Some(observer))
    }

    fn build(
        config: StoreConfig,
        observer: Option<Arc<dyn LockObserver>>,
    ) -> Result<Self, StoreError> {
        let datasource = Datasource::new(&config)?;
        let locks = LockManager::new(
            datasource.pool().clone(),
            config.lock_poll_interval(),
            config.stale_lock_after(),
        );
        let history = EntityHistory::new(config.history_duration(), DEFAULT_MEMO_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                datasource,
                locks,
                observer,
                cache: RwLock::new(Arc::new(LocalCache::new())),
                write: AsyncMutex::new(WriteState {
                    history,
                    last_updated: DateTime::UNIX_EPOCH,
                }),
                last_updated: AtomicI64::new(0),
                connected: AtomicBool::new(false),
                tasks: Mutex::new(None),
            }),
        })
    }

    /// Prepares the schema, loads everything and starts the refresh and
    /// stale-lock cleanup tasks. Does nothing when already connected.
    pub async fn connect(&self) -> Result<(), StoreError> {
        {
            let mut state = self.inner.write.lock().await;
            if self.is_connected() {
                return Ok(());
            }
            self.inner.load_locked(&mut state).await?;
            self.inner.connected.store(true, Ordering::Release);
        }
        self.start_tasks();
        info!(
            database = %self.connection_name(),
            entities = self.snapshot().len(),
            last_updated = %self.last_updated(),
            "Connected"
        );
        Ok(())
    }

    /// Stops the background tasks and forgets all cached state. Calling it
    /// again is harmless.
    pub async fn disconnect(&self) {
        // Tasks are awaited before taking the write lock: a refresh iteration
        // may be waiting for it.
        let tasks = self.inner.take_tasks();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        let mut state = self.inner.write.lock().await;
        let was_connected = self.inner.connected.swap(false, Ordering::AcqRel);
        self.inner.reset(&mut state);
        if was_connected {
            info!(database = %self.connection_name(), "Disconnected");
        }
    }

    /// Disconnects and closes the connection pool. The operator can not
    /// connect again afterwards.
    pub async fn close(&self) {
        self.disconnect().await;
        self.inner.datasource.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn start_tasks(&self) {
        let (mut tasks, cancel) = MaintenanceTasks::new();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tasks.push(spawn_periodic(
            "refresh",
            self.inner.config.refresh_interval(),
            cancel.clone(),
            move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.refresh().await;
                    }
                }
            },
        ));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tasks.push(spawn_periodic(
            "lock-cleanup",
            self.inner.config.cleanup_interval(),
            cancel,
            move |cancel| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.cleanup(&cancel).await;
                    }
                }
            },
        ));

        let previous = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tasks);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Applies one batch atomically: everything or nothing reaches the store.
    ///
    /// An empty batch returns immediately without locking or advancing the
    /// store timestamp. Removals of ids the cache does not know are ignored.
    pub async fn dispatch(&self, event: UpdateEvent) -> Result<(), StoreError> {
        if event.is_empty() {
            return Ok(());
        }
        event.validate()?;

        let mut state = self.inner.write.lock().await;
        self.inner.ensure_connected()?;

        let cache = self.snapshot();
        cache.check_dependencies(&event)?;
        if let Some(user_id) = &event.user_id {
            cache
                .get(user_id)
                .filter(|e| e.as_user().is_some())
                .ok_or_else(|| StoreError::EntityNotFound(user_id.clone()))?;
        }
        let removals: Vec<EntityId> = event
            .remove
            .iter()
            .filter(|id| cache.contains(id))
            .cloned()
            .collect();

        let scope = lock_scope(&event);
        let write = Write::Batch {
            event: &event,
            removals: &removals,
            user: event.user_id.as_ref(),
        };
        let timestamp = self.inner.execute(&mut state, &scope, write).await?;
        debug!(
            stored = event.store.len(),
            removed = removals.len(),
            patches = event.patches.len(),
            %timestamp,
            "Dispatched batch"
        );

        self.inner.refresh_or_log(&mut state).await;
        Ok(())
    }

    /// Pulls changes committed by any writer since the last refresh. Failures
    /// are logged and retried by the next refresh.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Reloads the complete cache from the store.
    pub async fn load_data(&self) -> Result<(), StoreError> {
        let mut state = self.inner.write.lock().await;
        self.inner.ensure_connected()?;
        self.inner.load_locked(&mut state).await
    }

    /// Deletes every persisted entity.
    pub async fn remove_all(&self) -> Result<(), StoreError> {
        let mut state = self.inner.write.lock().await;
        self.inner.ensure_schema().await?;
        self.inner
            .execute(&mut state, &LockScope::Global, Write::Replace(None))
            .await?;
        warn!(database = %self.connection_name(), "Removed all data");
        if self.is_connected() {
            self.inner.refresh_or_log(&mut state).await;
        }
        Ok(())
    }

    /// Replaces the store content with the persistent part of `cache`.
    pub async fn save_data(&self, cache: &LocalCache, format_version: &str) -> Result<(), StoreError> {
        Snapshot::check_version(format_version)?;
        let snapshot = cache.snapshot();

        let mut state = self.inner.write.lock().await;
        self.inner.ensure_schema().await?;
        self.inner
            .execute(&mut state, &LockScope::Global, Write::Replace(Some(&snapshot)))
            .await?;
        info!(
            count = snapshot.entities.len(),
            format_version,
            "Saved data"
        );
        if self.is_connected() {
            self.inner.refresh_or_log(&mut state).await;
        }
        Ok(())
    }

    /// Sets (or with `None` clears) the password hash of a user.
    pub async fn set_password(
        &self,
        user_id: &EntityId,
        hash: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write.lock().await;
        self.inner.ensure_connected()?;

        let user = self
            .snapshot()
            .get(user_id)
            .filter(|e| e.as_user().is_some())
            .cloned()
            .ok_or_else(|| StoreError::EntityNotFound(user_id.clone()))?;
        let scope = LockScope::Rows(BTreeSet::from([user_id.to_string()]));
        self.inner
            .execute(&mut state, &scope, Write::Password { user: &user, hash })
            .await?;
        info!(id = %user_id, "Password changed");

        self.inner.refresh_or_log(&mut state).await;
        Ok(())
    }

    /// Writes the current cache content as a JSON snapshot.
    pub async fn export_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = self.snapshot().snapshot();
        snapshot.write(path).await?;
        info!(
            path = %path.display(),
            count = snapshot.entities.len(),
            "Exported snapshot"
        );
        Ok(())
    }

    /// The currently published cache.
    pub fn snapshot(&self) -> Arc<LocalCache> {
        self.inner.current_cache()
    }

    pub fn resolve(&self, id: &EntityId) -> Result<Arc<Entity>, StoreError> {
        self.try_resolve(id)
            .ok_or_else(|| StoreError::EntityNotFound(id.clone()))
    }

    pub fn try_resolve(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.snapshot().get(id).cloned()
    }

    /// All users, ordered by username.
    pub fn users(&self) -> Vec<Arc<Entity>> {
        self.snapshot().users()
    }

    pub fn password(&self, user_id: &EntityId) -> Option<String> {
        self.snapshot().password(user_id).map(str::to_string)
    }

    /// Commit time of the newest change reflected in the cache.
    pub fn last_updated(&self) -> DateTime<Utc> {
        timestamp_from_millis(self.inner.last_updated.load(Ordering::Acquire))
    }

    /// Oldest instant [`Self::history_as_of`] can answer for.
    pub async fn history_valid_start(&self) -> DateTime<Utc> {
        let state = self.inner.write.lock().await;
        state.history.valid_start(state.last_updated)
    }

    /// The entity as it was at `timestamp`, as far as refreshes have seen it.
    /// `None` if it did not exist then or no change of it was observed.
    pub async fn history_as_of(
        &self,
        id: &EntityId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Arc<Entity>>, StoreError> {
        let state = self.inner.write.lock().await;
        match state.history.get_last_changed_until(id, timestamp) {
            Some(entry) if !entry.is_delete() => Ok(Some(state.history.get_entity(entry)?)),
            _ => Ok(None),
        }
    }

    pub fn connection_name(&self) -> &str {
        self.inner.datasource.name()
    }
}

impl Inner {
    fn current_cache(&self) -> Arc<LocalCache> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: &mut WriteState, cache: LocalCache, last_updated: DateTime<Utc>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(cache);
        state.last_updated = last_updated;
        self.last_updated
            .store(last_updated.timestamp_millis(), Ordering::Release);
    }

    fn reset(&self, state: &mut WriteState) {
        state.history.clear();
        self.publish(state, LocalCache::new(), DateTime::UNIX_EPOCH);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn take_tasks(&self) -> Option<MaintenanceTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Drops the connection after a write that may have been partially
    /// applied. Runs under the write lock, so tasks are only signalled.
    fn force_disconnect(&self, state: &mut WriteState) {
        if let Some(tasks) = self.take_tasks() {
            tasks.cancel();
        }
        self.connected.store(false, Ordering::Release);
        self.reset(state);
        error!(
            database = %self.datasource.name(),
            "Store may hold a partial write; disconnected"
        );
    }

    async fn refresh(&self) {
        let mut state = self.write.lock().await;
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        self.refresh_or_log(&mut state).await;
    }

    async fn refresh_or_log(&self, state: &mut WriteState) {
        if let Err(e) = self.refresh_locked(state).await {
            error!(
                error = %e,
                last_success = %state.last_updated,
                "Refresh failed"
            );
        }
    }

    async fn refresh_locked(&self, state: &mut WriteState) -> Result<(), StoreError> {
        let mut conn = self.datasource.connection().await?;
        let connection_time = io::get_last_updated(&mut conn).await?;
        if connection_time <= state.last_updated {
            return Ok(());
        }
        if state.last_updated < state.history.valid_start(connection_time) {
            info!(
                last_updated = %state.last_updated,
                now = %connection_time,
                "Cache fell behind the history window, reloading"
            );
            drop(conn);
            return self.load_locked(state).await;
        }

        let since = state.last_updated;
        let changes = io::update(&mut conn, since, connection_time).await?;
        let patches = patch::get_patches(&mut conn, since, connection_time).await?;

        let mut changed = BTreeSet::new();
        for change in changes {
            let id = EntityId::parse(change.entity_id)?;
            let at = timestamp_from_millis(change.changed_at);
            match change.data {
                Some(data) if !change.is_delete => {
                    state.history.add_serialized(id.clone(), at, data.into());
                }
                _ => state.history.add_delete(id.clone(), at),
            }
            changed.insert(id);
        }

        let mut cache = (*self.current_cache()).clone();
        let mut removed = 0usize;
        for id in &changed {
            match state.history.get_last_changed_until(id, connection_time) {
                Some(entry) if !entry.is_delete() => {
                    let entity = state.history.get_entity(entry)?;
                    if entity.as_user().is_some() {
                        match io::load_password(&mut conn, id).await? {
                            Some(hash) => cache.put_password(id.clone(), hash),
                            None => cache.remove_password(id),
                        }
                    }
                    cache.put(entity.edit());
                }
                // a miss means the change is older than anything we can vouch for
                _ => {
                    if cache.remove(id).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        drop(conn);

        let merged = merge_patches(&mut cache, &patches)?;
        state.history.prune(connection_time);
        debug!(
            changed = changed.len(),
            removed,
            patches = merged,
            last_updated = %connection_time,
            "Refreshed"
        );
        self.publish(state, cache, connection_time);
        Ok(())
    }

    async fn load_locked(&self, state: &mut WriteState) -> Result<(), StoreError> {
        let banner = self.datasource.banner().await?;
        info!(database = %self.datasource.name(), version = %banner, "Loading data");

        let mut conn = self.datasource.connection().await?;
        if self.upgrade_database(&mut conn).await? {
            // data moved underneath this connection
            drop(conn);
            conn = self.datasource.connection().await?;
        }
        let connection_time = io::get_last_updated(&mut conn).await?;
        let rows = io::load_all(&mut conn).await?;
        let passwords = io::load_passwords(&mut conn).await?;
        drop(conn);

        let base = LocalCache::seeded();
        let mut staged = EntityStore::new(&base);
        for entity in rows {
            staged.put(entity);
        }
        for (id, hash) in passwords {
            staged.put_password(id, hash);
        }
        for (id, why) in staged.remove_inconsistent() {
            warn!(id = %id, reason = %why, "Dropping inconsistent entity");
        }
        let mut cache = staged.into_cache();
        state.history.clear();

        let migrated = migrate_templates(&cache);
        if !migrated.is_empty() {
            let scope = LockScope::Rows(migrated.iter().map(|e| e.id.to_string()).collect());
            let timestamp = self
                .execute(state, &scope, Write::Migration(&migrated))
                .await?;
            // the next refresh replays these from the change log
            for entity in stamp(&migrated, timestamp, None) {
                cache.put(entity);
            }
            info!(count = migrated.len(), "Migrated reservation templates");
        }

        info!(
            entities = cache.len(),
            last_updated = %connection_time,
            "Data loaded"
        );
        self.publish(state, cache, connection_time);
        Ok(())
    }

    /// Migrates the schema and imports initial data. Returns whether data was
    /// moved, in which case the connection must be reopened.
    async fn upgrade_database(&self, conn: &mut SqliteConnection) -> Result<bool, StoreError> {
        let tables = schema::load_db_schema(conn).await?;
        if LegacyMigration::detect(&tables) {
            LegacyMigration::new(&self.config.legacy_export_path)
                .run(conn, &tables)
                .await?;
            return Ok(true);
        }
        schema::create_or_update_if_necessary(conn, &tables).await?;

        let Some(path) = &self.config.import_path else {
            return Ok(false);
        };
        if !io::is_empty(conn).await? {
            return Ok(false);
        }
        let snapshot = Snapshot::read(path).await?;
        let mut tx = conn.begin().await?;
        io::claim_write_slot(&mut tx).await?;
        let timestamp = io::get_database_timestamp(&mut tx).await?;
        io::create_all(&mut tx, &snapshot.entities, &snapshot.passwords, timestamp).await?;
        tx.commit().await?;
        info!(
            path = %path.display(),
            count = snapshot.entities.len(),
            "Imported initial data into empty store"
        );
        Ok(true)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.datasource.connection().await?;
        let tables = schema::load_db_schema(&mut conn).await?;
        schema::create_or_update_if_necessary(&mut conn, &tables).await?;
        Ok(())
    }

    async fn cleanup(&self, cancel: &Cancellation) {
        if let Err(e) = self.locks.cleanup_old_locks().await {
            warn!(error = %e, "Stale lock cleanup failed");
        }
        if cancel.is_cancelled() {
            return;
        }

        let retention = self.config.log_retention();
        let pruned = async {
            let mut conn = self.datasource.connection().await?;
            let changes = io::prune_change_log(&mut conn, retention).await?;
            let patches = patch::prune_patches(&mut conn, retention).await?;
            Ok::<_, StoreError>((changes, patches))
        };
        match pruned.await {
            Ok((0, 0)) => {}
            Ok((changes, patches)) => debug!(changes, patches, "Pruned change logs"),
            Err(e) => warn!(error = %e, "Change log pruning failed"),
        }
    }

    /// Runs one write under its database locks. Locks are released on every
    /// path; a write that could not be undone disconnects the operator.
    async fn execute(
        &self,
        state: &mut WriteState,
        scope: &LockScope,
        write: Write<'_>,
    ) -> Result<DateTime<Utc>, StoreError> {
        // Autocommit writes claim their commit time before their rows land;
        // only the global lock keeps those times in commit order.
        let global = LockScope::Global;
        let scope = if self.datasource.supports_transactions() {
            scope
        } else {
            &global
        };

        match scope {
            LockScope::Global => self.locks.get_global_lock().await?,
            LockScope::Rows(ids) => self.locks.get_locks(ids).await?,
        }

        let result = self.write_locked(scope, &write).await;

        let released = match scope {
            LockScope::Global => self.locks.remove_global_lock().await,
            LockScope::Rows(ids) => self.locks.remove_locks(ids).await,
        };
        if let Err(e) = released {
            warn!(error = %e, "Could not release write locks; stale lock cleanup will remove them");
        }

        if let Err(StoreError::NoRollback(_)) = &result {
            self.force_disconnect(state);
        }
        result
    }

    async fn write_locked(
        &self,
        scope: &LockScope,
        write: &Write<'_>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut pooled = self.datasource.connection().await?;
        let mut unit = WriteScope::begin(&mut pooled, self.datasource.supports_transactions()).await?;
        let result = self.apply(unit.conn(), scope, write).await;
        unit.finish(result).await
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        scope: &LockScope,
        write: &Write<'_>,
    ) -> Result<DateTime<Utc>, StoreError> {
        io::claim_write_slot(conn).await?;
        let timestamp = io::get_database_timestamp(conn).await?;

        match write {
            Write::Batch {
                event,
                removals,
                user,
            } => {
                io::remove(conn, removals, timestamp).await?;
                io::store(conn, &stamp(&event.store, timestamp, *user), timestamp).await?;
                patch::store_patches(conn, &event.patches, timestamp).await?;
            }
            Write::Migration(entities) => {
                io::store(conn, &stamp(entities, timestamp, None), timestamp).await?;
            }
            Write::Password { user, hash } => {
                if !io::set_password(conn, &user.id, *hash).await? {
                    return Err(StoreError::EntityNotFound(user.id.clone()));
                }
                let stamped = stamp(std::slice::from_ref(*user), timestamp, Some(&user.id));
                io::store(conn, &stamped, timestamp).await?;
            }
            Write::Replace(snapshot) => {
                let removed = io::remove_all(conn, timestamp).await?;
                debug!(removed, "Cleared store");
                if let Some(snapshot) = snapshot {
                    io::create_all(conn, &snapshot.entities, &snapshot.passwords, timestamp)
                        .await?;
                }
            }
        }

        io::touch_last_updated(conn, timestamp).await?;
        if let Some(observer) = &self.observer {
            observer.before_commit(scope).await?;
        }
        Ok(timestamp)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tasks) = tasks {
            tasks.cancel();
        }
    }
}

/// Type definitions are guarded by the global lock; everything else by row
/// locks on the touched ids and the owners of patched preferences.
fn lock_scope(event: &UpdateEvent) -> LockScope {
    if event.touches_type_definition() {
        return LockScope::Global;
    }
    let mut ids: BTreeSet<String> = event
        .touched_ids()
        .into_iter()
        .map(EntityId::into_string)
        .collect();
    for patch in &event.patches {
        ids.insert(patch.lock_id());
        // also taken by a full store of the same preferences
        ids.insert(patch.preferences_id().into_string());
    }
    LockScope::Rows(ids)
}

/// Writable copies of `entities`, with change metadata set on those that
/// carry it.
fn stamp(entities: &[Entity], timestamp: DateTime<Utc>, user: Option<&EntityId>) -> Vec<Entity> {
    entities
        .iter()
        .map(|entity| {
            let mut entity = entity.edit();
            if entity.is_timestamped() {
                entity.last_changed = Some(timestamp);
                entity.last_changed_by = user.cloned();
            }
            entity
        })
        .collect()
}

/// Applies patches read back from the store. A patch is skipped when the
/// cached preferences were written after its commit time; patches of the same
/// commit are reapplied, which is harmless since merging is idempotent.
fn merge_patches(cache: &mut LocalCache, patches: &[PreferencePatch]) -> Result<usize, StoreError> {
    let mut merged = 0;
    for patch in patches {
        let id = patch.preferences_id();
        let mut entity = match cache.get(&id) {
            Some(current) => {
                let superseded = matches!(
                    (current.last_changed, patch.changed_at),
                    (Some(written), Some(at)) if written > at
                );
                if superseded {
                    continue;
                }
                current.edit()
            }
            None => Entity::new(
                id.clone(),
                EntityBody::Preferences(Preferences::for_owner(patch.user_id.as_ref())?),
            )?,
        };
        if let EntityBody::Preferences(prefs) = &mut entity.body {
            patch.apply_to(prefs);
        }
        entity.last_changed = patch.changed_at;
        entity.last_changed_by.clone_from(&patch.user_id);
        cache.put(entity);
        merged += 1;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rota_model::{Category, Classification, DynamicType, EntityKind};
    use serde_json::json;

    fn category() -> Entity {
        Entity::create(EntityBody::Category(Category {
            key: "room".into(),
            name: "Room".into(),
            parent: None,
        }))
    }

    #[test]
    fn type_definitions_take_the_global_lock() {
        let event = UpdateEvent::default().store(Entity::create(EntityBody::DynamicType(
            DynamicType {
                key: "room".into(),
                name: "Room".into(),
                classification: Classification::Resource,
                attributes: Vec::new(),
            },
        )));
        assert_eq!(lock_scope(&event), LockScope::Global);
    }

    #[test]
    fn row_locks_cover_patch_owners() {
        let stored = category();
        let user = EntityId::new(EntityKind::User, 4);
        let event = UpdateEvent::default()
            .store(stored.clone())
            .patch(PreferencePatch::for_user(Some(user.clone())).put("a", json!(1)))
            .patch(PreferencePatch::for_user(None).put("b", json!(2)));

        let LockScope::Rows(ids) = lock_scope(&event) else {
            panic!("expected row locks");
        };
        assert_eq!(
            ids,
            BTreeSet::from([
                stored.id.to_string(),
                user.to_string(),
                "preferences_4".to_string(),
                "preferences_0".to_string()
            ])
        );
    }

    #[test]
    fn stamping_skips_categories() {
        let ts = timestamp_from_millis(5_000);
        let user = EntityId::new(EntityKind::User, 1);
        let prefs = Entity::new(
            Preferences::id_for(None),
            EntityBody::Preferences(Preferences::for_owner(None).unwrap()),
        )
        .unwrap();

        let stamped = stamp(&[category(), prefs], ts, Some(&user));
        assert_eq!(stamped[0].last_changed, None);
        assert_eq!(stamped[1].last_changed, Some(ts));
        assert_eq!(stamped[1].last_changed_by.as_ref(), Some(&user));
    }

    #[test]
    fn older_patches_do_not_override_newer_preferences() {
        let mut cache = LocalCache::seeded();
        let written = timestamp_from_millis(10_000);
        let mut prefs = Entity::new(
            Preferences::id_for(None),
            EntityBody::Preferences(Preferences::for_owner(None).unwrap()),
        )
        .unwrap();
        prefs.last_changed = Some(written);
        cache.put(prefs);

        let mut stale = PreferencePatch::for_user(None).put("theme", json!("dark"));
        stale.changed_at = Some(written - TimeDelta::seconds(1));
        let mut fresh = PreferencePatch::for_user(None).put("lang", json!("de"));
        fresh.changed_at = Some(written + TimeDelta::seconds(1));

        assert_eq!(merge_patches(&mut cache, &[stale, fresh]).unwrap(), 1);
        let merged = cache.get(&Preferences::id_for(None)).unwrap();
        let entries = &merged.as_preferences().unwrap().entries;
        assert!(!entries.contains_key("theme"));
        assert_eq!(entries["lang"], json!("de"));
    }
}
