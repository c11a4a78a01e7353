//! Offline Operation Queue
//!
//! Writes issued while the conductor is unreachable are kept here, persisted
//! through the [`KeyValueStore`], and replayed in enqueue order once a
//! connection exists.
//!
//! ```text
//! enqueue ──► [A, B, C] ──sync_all──► call(A) ok   → removed
//!                                     call(B) fail → retry timer (base * 2^retry_count)
//!                                     call(C) ok   → removed
//! ```
//!
//! Each operation has at most one retry timer. A timer that fires while
//! offline (or while a sync pass is running) reschedules itself without
//! counting an attempt. Once `retry_count` reaches `max_retries` no timer is
//! scheduled, but the operation stays queued for manual retry or dismissal.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{ZomeCall, ZomeCaller};
use crate::config::OfflineQueueConfig;
use crate::error::{ConnectError, Result};
use crate::observable::{ListenerId, Observable};
use crate::store::{KeyValueStore, OFFLINE_QUEUE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ZomeCall,
    Write,
    Create,
    Update,
    Delete,
}

/// A queued remote call awaiting a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: OperationKind,
    /// The call to replay; the payload travels inside it
    pub target: ZomeCall,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl OfflineOperation {
    /// No further automatic retries will be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Input to [`OfflineQueue::enqueue`]; id, timestamp and retry count are assigned.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub target: ZomeCall,
    pub max_retries: Option<u32>,
    pub description: Option<String>,
}

impl NewOperation {
    pub fn new(kind: OperationKind, target: ZomeCall) -> Self {
        Self {
            kind,
            target,
            max_retries: None,
            description: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub total_retries: u32,
    /// Rounded to one decimal
    pub average_retries: f64,
    /// Age of the oldest queued operation
    pub oldest_operation_secs: Option<u64>,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SyncEvent {
    report: SyncReport,
    at: DateTime<Utc>,
}

/// Held for the duration of a sync pass or a timer-fired retry.
struct SyncFlag<'a>(&'a AtomicBool);

impl<'a> SyncFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(flag))
    }
}

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    caller: Arc<dyn ZomeCaller>,
    store: Arc<dyn KeyValueStore>,
    config: OfflineQueueConfig,
    queue: Observable<Vec<OfflineOperation>>,
    last_sync: Observable<Option<SyncEvent>>,
    syncing: AtomicBool,
    retry_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
    weak_self: Weak<Self>,
}

impl OfflineQueue {
    /// Create the queue, restoring anything persisted by a previous run.
    pub fn new(
        caller: Arc<dyn ZomeCaller>,
        store: Arc<dyn KeyValueStore>,
        config: OfflineQueueConfig,
    ) -> Arc<Self> {
        let restored = match load(store.as_ref()) {
            Ok(ops) => ops,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable offline queue");
                Vec::new()
            }
        };
        if !restored.is_empty() {
            info!(count = restored.len(), "Restored offline operations");
        }

        Arc::new_cyclic(|weak_self| Self {
            caller,
            store,
            config,
            queue: Observable::new(restored),
            last_sync: Observable::new(None),
            syncing: AtomicBool::new(false),
            retry_timers: Mutex::new(HashMap::new()),
            auto_sync: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    // =========================================================================
    // Queue contents
    // =========================================================================

    /// Append an operation. Returns its id.
    pub fn enqueue(&self, op: NewOperation) -> String {
        let operation = OfflineOperation {
            id: self.next_id(),
            created_at: Utc::now(),
            kind: op.kind,
            target: op.target,
            retry_count: 0,
            max_retries: op.max_retries.unwrap_or(self.config.default_max_retries),
            description: op.description,
        };
        let id = operation.id.clone();

        debug!(
            op_id = %id,
            kind = ?operation.kind,
            zome = %operation.target.zome_name,
            function = %operation.target.fn_name,
            "Queued offline operation"
        );
        self.queue.update(|ops| ops.push(operation));
        self.persist();
        id
    }

    /// Remove by id. Unknown ids are ignored.
    pub fn dequeue(&self, id: &str) {
        self.cancel_retry(id);
        let removed = self.queue.update(|ops| {
            let before = ops.len();
            ops.retain(|o| o.id != id);
            before != ops.len()
        });
        if removed {
            debug!(op_id = %id, "Removed offline operation");
            self.persist();
        }
    }

    /// Drop an operation the user gave up on.
    pub fn dismiss_operation(&self, id: &str) {
        self.dequeue(id);
    }

    /// Snapshot of queued operations in enqueue order.
    pub fn operations(&self) -> Vec<OfflineOperation> {
        self.queue.get()
    }

    pub fn len(&self) -> usize {
        self.queue.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything and cancel all retries.
    pub fn clear(&self) {
        for (_, timer) in lock(&self.retry_timers).drain() {
            timer.abort();
        }
        self.queue.set(Vec::new());
        self.persist();
        info!("Cleared offline queue");
    }

    pub fn get_stats(&self) -> QueueStats {
        let last_sync = self.last_sync.with(|e| e.as_ref().map(|e| e.at));
        self.queue.with(|ops| {
            let size = ops.len();
            let total_retries: u32 = ops.iter().map(|o| o.retry_count).sum();
            let average_retries = if size == 0 {
                0.0
            } else {
                (total_retries as f64 / size as f64 * 10.0).round() / 10.0
            };
            let oldest_operation_secs = ops
                .iter()
                .map(|o| o.created_at)
                .min()
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64);

            QueueStats {
                size,
                total_retries,
                average_retries,
                oldest_operation_secs,
                last_sync,
            }
        })
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Called with the full queue after every change.
    pub fn on_queue_changed(
        &self,
        listener: impl Fn(&[OfflineOperation]) + Send + Sync + 'static,
    ) -> ListenerId {
        self.queue.on_change(move |ops| listener(ops))
    }

    /// Called with the counts at the end of every sync pass that ran.
    pub fn on_sync_complete(
        &self,
        listener: impl Fn(SyncReport) + Send + Sync + 'static,
    ) -> ListenerId {
        self.last_sync.on_change(move |event| {
            if let Some(event) = event {
                listener(event.report);
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<OfflineOperation>> {
        self.queue.subscribe()
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Attempt every queued operation once, in enqueue order.
    ///
    /// Returns zero counts without doing anything while offline or while
    /// another pass is running. Operations past their retry bound are
    /// attempted too; this is the manual retry path.
    pub async fn sync_all(&self) -> SyncReport {
        self.sync_pass(true).await
    }

    async fn sync_pass(&self, include_exhausted: bool) -> SyncReport {
        let Some(_flag) = SyncFlag::acquire(&self.syncing) else {
            debug!("Sync already in progress");
            return SyncReport::default();
        };
        if !self.caller.is_connected() {
            debug!("Not connected, deferring offline sync");
            return SyncReport::default();
        }

        let snapshot = self.queue.get();
        if snapshot.is_empty() {
            return SyncReport::default();
        }
        info!(pending = snapshot.len(), "Syncing offline operations");

        let mut report = SyncReport::default();
        for op in snapshot {
            if !include_exhausted && op.is_exhausted() {
                continue;
            }
            // Dismissed while an earlier operation was in flight
            if !self.contains(&op.id) {
                continue;
            }
            if self.attempt(&op).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
                self.schedule_retry(&op.id);
            }
        }

        info!(succeeded = report.succeeded, failed = report.failed, "Offline sync complete");
        self.last_sync.set(Some(SyncEvent {
            report,
            at: Utc::now(),
        }));
        report
    }

    /// Attempt a single operation now. `false` for unknown ids or failure.
    pub async fn sync_operation(&self, id: &str) -> bool {
        let Some(op) = self.find(id) else {
            return false;
        };
        let Some(_flag) = SyncFlag::acquire(&self.syncing) else {
            debug!(op_id = %id, "Sync in progress, skipping manual retry");
            return false;
        };
        if self.attempt(&op).await {
            true
        } else {
            self.schedule_retry(id);
            false
        }
    }

    /// Run `call` for `op`; on success the operation leaves the queue.
    async fn attempt(&self, op: &OfflineOperation) -> bool {
        let outcome = self.caller.call(&op.target).await;
        if outcome.success {
            self.cancel_retry(&op.id);
            self.queue.update(|ops| ops.retain(|o| o.id != op.id));
            self.persist();
            debug!(op_id = %op.id, "Offline operation synced");
            true
        } else {
            warn!(
                op_id = %op.id,
                retry_count = op.retry_count,
                error = outcome.error.as_deref().unwrap_or("unknown error"),
                "Offline operation failed"
            );
            false
        }
    }

    /// Sync whenever `connectivity` turns true, skipping exhausted operations.
    pub fn start_auto_sync(&self, mut connectivity: watch::Receiver<bool>) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let connected = *connectivity.borrow_and_update();
                if connected {
                    let Some(queue) = weak.upgrade() else { return };
                    queue.sync_pass(false).await;
                }
                if connectivity.changed().await.is_err() {
                    return;
                }
            }
        });
        if let Some(previous) = lock(&self.auto_sync).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = lock(&self.auto_sync).take() {
            task.abort();
        }
    }

    // =========================================================================
    // Retry timers
    // =========================================================================

    fn retry_delay(&self, retry_count: u32) -> Duration {
        self.config
            .base_retry_delay()
            .saturating_mul(1u32 << retry_count.min(20))
    }

    fn schedule_retry(&self, id: &str) {
        let Some(op) = self.find(id) else { return };
        if op.is_exhausted() {
            info!(op_id = %id, retries = op.retry_count, "Retries exhausted, leaving operation queued");
            return;
        }

        let mut timers = lock(&self.retry_timers);
        if timers.contains_key(id) {
            return;
        }

        let delay = self.retry_delay(op.retry_count);
        debug!(op_id = %id, retry_count = op.retry_count, delay_ms = delay.as_millis() as u64, "Scheduled retry");

        let weak = self.weak_self.clone();
        let timer_id = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = weak.upgrade() {
                queue.fire_retry(&timer_id).await;
            }
        });
        timers.insert(id.to_string(), handle);
    }

    /// Cancel a pending retry. The operation stays queued.
    pub fn cancel_retry(&self, id: &str) {
        if let Some(timer) = lock(&self.retry_timers).remove(id) {
            timer.abort();
            debug!(op_id = %id, "Cancelled retry");
        }
    }

    pub fn has_pending_retry(&self, id: &str) -> bool {
        lock(&self.retry_timers).contains_key(id)
    }

    async fn fire_retry(&self, id: &str) {
        lock(&self.retry_timers).remove(id);

        let Some(op) = self.find(id) else {
            debug!(op_id = %id, "Retry fired for removed operation");
            return;
        };

        let flag = if self.caller.is_connected() {
            SyncFlag::acquire(&self.syncing)
        } else {
            None
        };
        let Some(_flag) = flag else {
            debug!(op_id = %id, "Deferring retry");
            self.schedule_retry(id);
            return;
        };

        if self.attempt(&op).await {
            return;
        }

        let bumped = self.queue.update(|ops| {
            ops.iter_mut()
                .find(|o| o.id == id)
                .map(|o| {
                    o.retry_count += 1;
                    o.retry_count
                })
                .is_some()
        });
        if bumped {
            self.persist();
            self.schedule_retry(id);
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn find(&self, id: &str) -> Option<OfflineOperation> {
        self.queue.with(|ops| ops.iter().find(|o| o.id == id).cloned())
    }

    fn contains(&self, id: &str) -> bool {
        self.queue.with(|ops| ops.iter().any(|o| o.id == id))
    }

    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        format!("op-{}-{}{}", Utc::now().timestamp_millis(), seq, suffix.to_lowercase())
    }

    fn persist(&self) {
        let result = self
            .queue
            .with(serde_json::to_string)
            .map_err(ConnectError::from)
            .and_then(|json| self.store.set(OFFLINE_QUEUE_KEY, &json));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist offline queue");
        }
    }
}

impl Drop for OfflineQueue {
    fn drop(&mut self) {
        let timers = self.retry_timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        if let Some(task) = self.auto_sync.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

fn load(store: &dyn KeyValueStore) -> Result<Vec<OfflineOperation>> {
    match store.get(OFFLINE_QUEUE_KEY)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallOutcome;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl ZomeCaller for Offline {
        async fn call(&self, _call: &ZomeCall) -> CallOutcome {
            ConnectError::NotConnected.into()
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    fn queue(store: Arc<dyn KeyValueStore>) -> Arc<OfflineQueue> {
        OfflineQueue::new(Arc::new(Offline), store, OfflineQueueConfig::default())
    }

    fn write(id: &str) -> NewOperation {
        NewOperation::new(
            OperationKind::Create,
            ZomeCall::new("lamad", "content_store", "create_content", json!({"id": id})),
        )
    }

    #[tokio::test]
    async fn test_enqueue_assigns_defaults() {
        let q = queue(Arc::new(MemoryStore::new()));
        let a = q.enqueue(write("a"));
        let b = q.enqueue(write("b").with_max_retries(7).with_description("second"));

        assert_ne!(a, b);
        let ops = q.operations();
        assert_eq!(ops[0].max_retries, 3);
        assert_eq!(ops[0].retry_count, 0);
        assert_eq!(ops[1].max_retries, 7);
        assert_eq!(ops[1].description.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_dequeue_unknown_is_noop() {
        let q = queue(Arc::new(MemoryStore::new()));
        q.enqueue(write("a"));
        q.dequeue("op-missing");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_defers_while_offline() {
        let q = queue(Arc::new(MemoryStore::new()));
        q.enqueue(write("a"));
        assert_eq!(q.sync_all().await, SyncReport::default());
        assert_eq!(q.len(), 1);
        assert!(q.get_stats().last_sync.is_none());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let id = queue(Arc::clone(&store)).enqueue(write("a"));

        let reopened = queue(store);
        assert_eq!(reopened.operations()[0].id, id);
    }

    #[tokio::test]
    async fn test_stats_average_rounding() {
        let q = queue(Arc::new(MemoryStore::new()));
        for id in ["a", "b", "c"] {
            q.enqueue(write(id));
        }
        q.queue.update(|ops| ops[0].retry_count = 1);

        let stats = q.get_stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.average_retries, 0.3);
        assert!(stats.oldest_operation_secs.is_some());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let q = OfflineQueue {
            caller: Arc::new(Offline),
            store: Arc::new(MemoryStore::new()),
            config: OfflineQueueConfig::default(),
            queue: Observable::new(Vec::new()),
            last_sync: Observable::new(None),
            syncing: AtomicBool::new(false),
            retry_timers: Mutex::new(HashMap::new()),
            auto_sync: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            weak_self: Weak::new(),
        };
        assert_eq!(q.retry_delay(0), Duration::from_millis(1000));
        assert_eq!(q.retry_delay(2), Duration::from_millis(4000));
    }
}
