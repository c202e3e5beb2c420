mod common;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use common::{TestStore, category, connect_with, lock_rows, marker, renamed, resource_type};
use rota::db::{GLOBAL_LOCK_ID, LockManager};
use rota::{LockObserver, LockScope, StoreError, SyncOperator};
use rota_model::UpdateEvent;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

async fn insert_lock(pool: &SqlitePool, lock_id: &str, acquired_at: i64) {
    sqlx::query("INSERT INTO rota_write_lock (lock_id, acquired_at) VALUES (?, ?)")
        .bind(lock_id)
        .bind(acquired_at)
        .execute(pool)
        .await
        .unwrap();
}

async fn delete_lock(pool: &SqlitePool, lock_id: &str) {
    sqlx::query("DELETE FROM rota_write_lock WHERE lock_id = ?")
        .bind(lock_id)
        .execute(pool)
        .await
        .unwrap();
}

#[derive(Default)]
struct FaultInjector {
    fail: AtomicBool,
    seen: Mutex<Vec<LockScope>>,
}

#[async_trait]
impl LockObserver for FaultInjector {
    async fn before_commit(&self, scope: &LockScope) -> Result<(), StoreError> {
        self.seen.lock().unwrap().push(scope.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Observer("injected".into()));
        }
        Ok(())
    }
}

/// Holds a type-definition write open until released.
#[derive(Default)]
struct GlobalGate {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl LockObserver for GlobalGate {
    async fn before_commit(&self, scope: &LockScope) -> Result<(), StoreError> {
        if *scope == LockScope::Global {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn row_lock_held_elsewhere_blocks_dispatch() {
    let store = TestStore::new();
    let op = store.connect().await;
    let raw = store.raw().await;
    let room = category("room");
    insert_lock(&raw, room.id.as_str(), Utc::now().timestamp_millis()).await;

    let writer = op.clone();
    let event = UpdateEvent::by(None).store(room.clone());
    let handle = tokio::spawn(async move { writer.dispatch(event).await });

    sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished(), "dispatch must wait for the row lock");

    delete_lock(&raw, room.id.as_str()).await;
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch finishes once the lock is gone")
        .unwrap()
        .unwrap();
    assert!(op.try_resolve(&room.id).is_some());
    assert!(lock_rows(&raw).await.is_empty());
}

#[tokio::test]
async fn global_lock_blocks_row_writers() {
    let store = TestStore::new();
    let op = store.connect().await;
    let raw = store.raw().await;
    insert_lock(&raw, GLOBAL_LOCK_ID, Utc::now().timestamp_millis()).await;

    let writer = op.clone();
    let handle =
        tokio::spawn(async move { writer.dispatch(UpdateEvent::by(None).store(category("a"))).await });

    sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished(), "row writers must wait for the global lock");
    // the waiting writer keeps no row lock of its own
    assert_eq!(lock_rows(&raw).await, vec![GLOBAL_LOCK_ID.to_string()]);

    delete_lock(&raw, GLOBAL_LOCK_ID).await;
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch finishes once the global lock is gone")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn type_changes_wait_for_row_locks_to_drain() {
    let store = TestStore::new();
    let op = store.connect().await;
    let raw = store.raw().await;
    insert_lock(&raw, "category_busy", Utc::now().timestamp_millis()).await;

    let writer = op.clone();
    let rooms = resource_type("rooms");
    let event = UpdateEvent::by(None).store(rooms.clone());
    let handle = tokio::spawn(async move { writer.dispatch(event).await });

    sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished(), "the global lock waits for row locks");
    // the token is claimed while waiting, so no new row lock can start
    assert_eq!(
        lock_rows(&raw).await,
        vec![GLOBAL_LOCK_ID.to_string(), "category_busy".to_string()]
    );

    delete_lock(&raw, "category_busy").await;
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch finishes once row locks drained")
        .unwrap()
        .unwrap();
    assert!(op.try_resolve(&rooms.id).is_some());
    assert!(lock_rows(&raw).await.is_empty());
}

#[tokio::test]
async fn stale_locks_are_removed() {
    let store = TestStore::new();
    let _op = store.connect().await;
    let raw = store.raw().await;
    let now = Utc::now().timestamp_millis();
    insert_lock(&raw, "category_stale", now - 600_000).await;
    insert_lock(&raw, "category_fresh", now).await;

    let locks = LockManager::new(
        raw.clone(),
        Duration::from_millis(10),
        TimeDelta::seconds(60),
    );
    assert_eq!(locks.cleanup_old_locks().await.unwrap(), 1);
    let held: Vec<String> = locks
        .held_locks()
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.lock_id)
        .collect();
    assert_eq!(held, vec!["category_fresh".to_string()]);
}

#[tokio::test]
async fn cleanup_task_unblocks_writers_waiting_on_stale_locks() {
    let store = TestStore::new();
    let mut config = store.config();
    config.cleanup_interval_secs = 1;
    config.stale_lock_secs = 60;
    let op = connect_with(config).await;
    let raw = store.raw().await;
    let room = category("room");
    insert_lock(
        &raw,
        room.id.as_str(),
        Utc::now().timestamp_millis() - 600_000,
    )
    .await;

    timeout(
        Duration::from_secs(10),
        op.dispatch(UpdateEvent::by(None).store(room.clone())),
    )
    .await
    .expect("cleanup removes the orphaned lock")
    .unwrap();
    assert!(op.try_resolve(&room.id).is_some());
    op.disconnect().await;
}

#[tokio::test]
async fn failed_write_is_rolled_back_and_unlocked() {
    let store = TestStore::new();
    let observer = Arc::new(FaultInjector::default());
    let op = SyncOperator::with_observer(store.config(), observer.clone()).unwrap();
    op.connect().await.unwrap();
    let raw = store.raw().await;

    let kept = category("kept");
    op.dispatch(UpdateEvent::by(None).store(kept.clone()))
        .await
        .unwrap();
    let before = marker(&raw).await;

    observer.fail.store(true, Ordering::SeqCst);
    let added = category("added");
    let err = op
        .dispatch(
            UpdateEvent::by(None)
                .remove(kept.id.clone())
                .store(added.clone()),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Rollback(ref inner) if matches!(**inner, StoreError::Observer(_))
    ));

    let LockScope::Rows(ids) = observer.seen.lock().unwrap().last().cloned().unwrap() else {
        panic!("expected row locks");
    };
    assert!(ids.contains(kept.id.as_str()) && ids.contains(added.id.as_str()));

    assert!(op.is_connected());
    assert!(op.try_resolve(&kept.id).is_some());
    assert!(op.try_resolve(&added.id).is_none());
    assert!(lock_rows(&raw).await.is_empty());
    assert_eq!(marker(&raw).await, before);

    // nothing of the failed batch reached the store
    let other = store.connect().await;
    assert!(other.try_resolve(&kept.id).is_some());
    assert!(other.try_resolve(&added.id).is_none());
}

#[tokio::test]
async fn failed_write_without_transactions_disconnects() {
    let store = TestStore::new();
    let observer = Arc::new(FaultInjector::default());
    let mut config = store.config();
    config.use_transactions = false;
    let op = SyncOperator::with_observer(config, observer.clone()).unwrap();
    op.connect().await.unwrap();
    let raw = store.raw().await;

    observer.fail.store(true, Ordering::SeqCst);
    let room = category("room");
    let err = op
        .dispatch(UpdateEvent::by(None).store(room.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::NoRollback(ref inner) if matches!(**inner, StoreError::Observer(_))
    ));
    assert!(!op.is_connected());
    assert!(op.snapshot().is_empty());
    assert!(lock_rows(&raw).await.is_empty());

    let err = op
        .dispatch(UpdateEvent::by(None).store(category("next")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotConnected));

    // the partial write is what a reconnect finds
    observer.fail.store(false, Ordering::SeqCst);
    op.connect().await.unwrap();
    assert!(op.try_resolve(&room.id).is_some());
}

#[tokio::test]
async fn autocommit_writes_take_the_global_lock() {
    let store = TestStore::new();
    let observer = Arc::new(FaultInjector::default());
    let mut config = store.config();
    config.use_transactions = false;
    let op = SyncOperator::with_observer(config, observer.clone()).unwrap();
    op.connect().await.unwrap();
    let raw = store.raw().await;
    insert_lock(&raw, "category_busy", Utc::now().timestamp_millis()).await;

    let writer = op.clone();
    let room = category("room");
    let event = UpdateEvent::by(None).store(room.clone());
    let handle = tokio::spawn(async move { writer.dispatch(event).await });

    sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished(), "an unrelated row lock holds back autocommit writes");
    assert_eq!(
        lock_rows(&raw).await,
        vec![GLOBAL_LOCK_ID.to_string(), "category_busy".to_string()]
    );

    delete_lock(&raw, "category_busy").await;
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch finishes once row locks drained")
        .unwrap()
        .unwrap();
    assert_eq!(observer.seen.lock().unwrap().last(), Some(&LockScope::Global));
    assert!(op.try_resolve(&room.id).is_some());
    assert!(lock_rows(&raw).await.is_empty());
}

#[tokio::test]
async fn row_dispatch_waits_for_an_in_flight_type_change() {
    let store = TestStore::new();
    let gate = Arc::new(GlobalGate::default());
    let a = SyncOperator::with_observer(store.config(), gate.clone()).unwrap();
    a.connect().await.unwrap();
    let b = store.connect().await;

    let rooms = resource_type("rooms");
    let type_writer = a.clone();
    let event = UpdateEvent::by(None).store(rooms.clone());
    let type_change = tokio::spawn(async move { type_writer.dispatch(event).await });
    timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .expect("type change reaches its commit");

    let room = category("room");
    let row_writer = b.clone();
    let event = UpdateEvent::by(None).store(room.clone());
    let row_change = tokio::spawn(async move { row_writer.dispatch(event).await });

    sleep(Duration::from_millis(300)).await;
    assert!(!row_change.is_finished(), "row writers wait for the global lock");
    assert!(b.try_resolve(&room.id).is_none());

    gate.release.notify_one();
    for handle in [type_change, row_change] {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("both writes finish")
            .unwrap()
            .unwrap();
    }

    a.refresh().await;
    b.refresh().await;
    for op in [&a, &b] {
        assert!(op.try_resolve(&rooms.id).is_some());
        assert!(op.try_resolve(&room.id).is_some());
    }
}

#[tokio::test]
async fn concurrent_operators_converge() {
    let store = TestStore::new();
    let a = store.connect().await;
    let b = store.connect().await;
    let shared = category("shared");
    a.dispatch(UpdateEvent::by(None).store(shared.clone()))
        .await
        .unwrap();
    b.refresh().await;

    let run = |op: SyncOperator, tag: &'static str| {
        let shared = shared.clone();
        async move {
            for i in 0..10 {
                let own = category(&format!("{tag}{i}"));
                let event = UpdateEvent::by(None)
                    .store(own)
                    .store(renamed(&shared, &format!("{tag}-{i}")));
                op.dispatch(event).await.unwrap();
            }
        }
    };
    timeout(
        Duration::from_secs(30),
        async { tokio::join!(run(a.clone(), "a"), run(b.clone(), "b")) },
    )
    .await
    .expect("writers on overlapping ids make progress");

    a.refresh().await;
    b.refresh().await;
    let c = store.connect().await;
    assert_eq!(c.snapshot().persistent().count(), 21);
    let winner = c.resolve(&shared.id).unwrap();
    for op in [&a, &b] {
        assert_eq!(op.snapshot().persistent().count(), 21);
        assert_eq!(op.resolve(&shared.id).unwrap().body, winner.body);
        assert_eq!(op.last_updated(), c.last_updated());
    }
    assert!(lock_rows(&store.raw().await).await.is_empty());
}
