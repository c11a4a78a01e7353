//! Buffered Writer - flushes a write buffer through the conductor
//!
//! Wraps a [`WriteQueue`] and a [`ZomeCaller`]. Batches go out either as
//! one batch call (when a batch function is configured) or as one call per
//! operation, and the per-operation outcome is reported back to the buffer:
//!
//! | Outcome                 | Buffer call              |
//! |-------------------------|--------------------------|
//! | every op succeeded      | `mark_batch_committed`   |
//! | every op failed         | `mark_batch_failed`      |
//! | some ops failed         | `mark_operations_failed` |
//!
//! Write ids follow `"{doc_type}:{id}"` (e.g. `content:manifesto`), which
//! is how the write input names the document.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let writer = Arc::new(BufferedWriter::from_section(caller, store, &config.write_buffer));
//! writer.restore_persisted().await?;
//! writer.start_auto_flush();
//!
//! writer.queue_write("content:manifesto", WriteOpType::CreateEntry, &json, WritePriority::Bulk).await;
//!
//! // on shutdown
//! writer.stop_auto_flush();
//! writer.flush_all().await;
//! writer.persist_pending().await?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::call::{ZomeCall, ZomeCaller};
use crate::config::WriteBufferSection;
use crate::error::Result;
use crate::store::{KeyValueStore, WRITE_BUFFER_KEY};
use crate::write_buffer::{
    WriteBatch, WriteBuffer, WriteBufferConfig, WriteBufferStats, WriteOpType, WriteOperation,
    WritePriority, WriteQueue,
};

// =============================================================================
// Flush Result
// =============================================================================

/// Result of a flush operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushResult {
    /// Number of operations committed
    pub committed: u64,
    /// Number of operations requeued
    pub failed: u64,
    /// Number of batches processed
    pub batches: u64,
    /// Duration in milliseconds
    pub duration_ms: f64,
}

// =============================================================================
// Write input - what the zome receives
// =============================================================================

/// Input for a single write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// "create", "update", "delete", "create_link", "delete_link"
    pub op_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

impl From<&WriteOperation> for WriteInput {
    fn from(op: &WriteOperation) -> Self {
        let (doc_type, id) = match op.op_id.split_once(':') {
            Some((doc_type, id)) => (Some(doc_type.to_string()), id.to_string()),
            None => (None, op.op_id.clone()),
        };

        let op_type = match op.op_type {
            WriteOpType::CreateEntry => "create",
            WriteOpType::UpdateEntry => "update",
            WriteOpType::DeleteEntry => "delete",
            WriteOpType::CreateLink => "create_link",
            WriteOpType::DeleteLink => "delete_link",
        };

        // Deletes carry no data; non-JSON payloads travel as a string
        let data = match op.op_type {
            WriteOpType::DeleteEntry | WriteOpType::DeleteLink => None,
            _ => Some(
                serde_json::from_str(&op.payload)
                    .unwrap_or_else(|_| serde_json::Value::String(op.payload.clone())),
            ),
        };

        Self {
            doc_type,
            op_type: op_type.to_string(),
            id,
            data,
            entry_hash: op.dedup_key.clone(),
        }
    }
}

/// Input for a batch write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInput {
    pub operations: Vec<WriteInput>,
}

/// Where buffered writes are sent.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub role_name: String,
    pub zome_name: String,
    pub write_fn_name: String,
    /// Unset = one call per operation
    pub batch_fn_name: Option<String>,
}

impl From<&WriteBufferSection> for WriteTarget {
    fn from(section: &WriteBufferSection) -> Self {
        Self {
            role_name: section.role_name.clone(),
            zome_name: section.zome_name.clone(),
            write_fn_name: section.write_fn_name.clone(),
            batch_fn_name: section.batch_fn_name.clone(),
        }
    }
}

/// Which ops of a dispatched batch failed.
enum Dispatch {
    Committed,
    Failed(String),
    Partial(Vec<String>),
}

// =============================================================================
// Buffered Writer
// =============================================================================

pub struct BufferedWriter {
    buffer: RwLock<Box<dyn WriteQueue>>,
    caller: Arc<dyn ZomeCaller>,
    store: Arc<dyn KeyValueStore>,
    target: WriteTarget,
    flush_interval: Duration,
    auto_flush: Mutex<Option<AutoFlushTask>>,
}

/// A running flush loop and the stop flag only that loop reads.
struct AutoFlushTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl BufferedWriter {
    pub fn new(
        queue: Box<dyn WriteQueue>,
        caller: Arc<dyn ZomeCaller>,
        store: Arc<dyn KeyValueStore>,
        target: WriteTarget,
        flush_interval: Duration,
    ) -> Self {
        info!(
            role = %target.role_name,
            zome = %target.zome_name,
            batched = target.batch_fn_name.is_some(),
            flush_interval_ms = flush_interval.as_millis() as u64,
            "Buffered writer initialized"
        );
        Self {
            buffer: RwLock::new(queue),
            caller,
            store,
            target,
            flush_interval,
            auto_flush: Mutex::new(None),
        }
    }

    /// [`WriteBuffer`] sized and targeted from configuration.
    pub fn from_section(
        caller: Arc<dyn ZomeCaller>,
        store: Arc<dyn KeyValueStore>,
        section: &WriteBufferSection,
    ) -> Self {
        Self::new(
            Box::new(WriteBuffer::new(WriteBufferConfig::from(section))),
            caller,
            store,
            WriteTarget::from(section),
            Duration::from_millis(section.flush_interval_ms.max(1)),
        )
    }

    // =========================================================================
    // Queuing Operations
    // =========================================================================

    /// Queue a write. `false` means the buffer is full; shed or retry later.
    pub async fn queue_write(
        &self,
        op_id: &str,
        op_type: WriteOpType,
        payload: &str,
        priority: WritePriority,
    ) -> bool {
        self.queue_write_with_dedup(op_id, op_type, payload, priority, None)
            .await
    }

    pub async fn queue_write_with_dedup(
        &self,
        op_id: &str,
        op_type: WriteOpType,
        payload: &str,
        priority: WritePriority,
        dedup_key: Option<&str>,
    ) -> bool {
        let queued = self
            .buffer
            .write()
            .await
            .queue_write_with_dedup(op_id, op_type, payload, priority, dedup_key);
        if !queued {
            warn!(op_id, "Write rejected due to backpressure");
        }
        queued
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    pub async fn should_flush(&self) -> bool {
        self.buffer.read().await.should_flush()
    }

    /// Flush a single batch. `None` when nothing is queued.
    pub async fn flush_batch(&self) -> Option<FlushResult> {
        let start = Instant::now();

        let batch = self.buffer.write().await.get_pending_batch().batch?;

        debug!(
            batch_id = %batch.batch_id,
            op_count = batch.operations.len(),
            "Flushing batch to conductor"
        );

        let total = batch.operations.len() as u64;
        let dispatch = self.send_batch(&batch).await;

        let failed = {
            let mut buffer = self.buffer.write().await;
            match &dispatch {
                Dispatch::Committed => {
                    buffer.mark_batch_committed(&batch.batch_id);
                    0
                }
                Dispatch::Failed(reason) => {
                    buffer.mark_batch_failed(&batch.batch_id, reason);
                    total
                }
                Dispatch::Partial(failed_ids) => {
                    buffer.mark_operations_failed(&batch.batch_id, failed_ids);
                    failed_ids.len() as u64
                }
            }
        };

        match &dispatch {
            Dispatch::Failed(reason) => {
                error!(batch_id = %batch.batch_id, error = %reason, "Batch flush failed")
            }
            Dispatch::Partial(failed_ids) => {
                warn!(batch_id = %batch.batch_id, failed = ?failed_ids, "Batch partially failed")
            }
            Dispatch::Committed => {}
        }

        Some(FlushResult {
            committed: total - failed,
            failed,
            batches: 1,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Flush until the buffer is empty or a batch fails.
    pub async fn flush_all(&self) -> FlushResult {
        let start = Instant::now();
        let mut total = FlushResult::default();

        while let Some(result) = self.flush_batch().await {
            total.committed += result.committed;
            total.failed += result.failed;
            total.batches += 1;

            // Failed ops are back at the head of the queue
            if result.failed > 0 {
                break;
            }

            // Small delay between batches
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        total.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            committed = total.committed,
            failed = total.failed,
            batches = total.batches,
            duration_ms = total.duration_ms,
            "Flush all completed"
        );
        total
    }

    async fn send_batch(&self, batch: &WriteBatch) -> Dispatch {
        match &self.target.batch_fn_name {
            Some(batch_fn) => self.send_as_batch(batch, batch_fn).await,
            None => self.send_individually(batch).await,
        }
    }

    async fn send_as_batch(&self, batch: &WriteBatch, batch_fn: &str) -> Dispatch {
        let input = BatchInput {
            operations: batch.operations.iter().map(WriteInput::from).collect(),
        };
        let payload = match serde_json::to_value(&input) {
            Ok(payload) => payload,
            Err(e) => return Dispatch::Failed(format!("Failed to serialize batch: {}", e)),
        };

        let call = ZomeCall::new(
            &self.target.role_name,
            &self.target.zome_name,
            batch_fn,
            payload,
        );
        let outcome = self.caller.call(&call).await;
        if !outcome.success {
            return Dispatch::Failed(outcome.error.unwrap_or_else(|| "batch call failed".into()));
        }

        let results = outcome.data.as_ref().and_then(per_operation_results);
        let failed: Vec<String> = match results {
            Some(results) => batch
                .operations
                .iter()
                .zip(results.iter().map(op_succeeded).chain(std::iter::repeat(false)))
                .filter(|(_, ok)| !ok)
                .map(|(op, _)| op.op_id.clone())
                .collect(),
            // No per-op verdicts: the call's success covers the whole batch
            None => Vec::new(),
        };
        classify(failed, batch.operations.len())
    }

    async fn send_individually(&self, batch: &WriteBatch) -> Dispatch {
        let mut failed = Vec::new();
        let mut ops = batch.operations.iter();

        for op in ops.by_ref() {
            let payload = match serde_json::to_value(WriteInput::from(op)) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(op_id = %op.op_id, error = %e, "Failed to serialize write");
                    failed.push(op.op_id.clone());
                    continue;
                }
            };

            let call = ZomeCall::new(
                &self.target.role_name,
                &self.target.zome_name,
                &self.target.write_fn_name,
                payload,
            );
            let outcome = self.caller.call(&call).await;
            if outcome.success {
                debug!(op_id = %op.op_id, "Operation committed");
                continue;
            }

            error!(op_id = %op.op_id, error = ?outcome.error, "Operation failed");
            failed.push(op.op_id.clone());

            // No point sending the rest into a dead channel
            if !self.caller.is_connected() {
                break;
            }
        }
        failed.extend(ops.map(|op| op.op_id.clone()));

        classify(failed, batch.operations.len())
    }

    // =========================================================================
    // Auto-Flush Background Task
    // =========================================================================

    /// Periodically flush while connected.
    pub fn start_auto_flush(self: &Arc<Self>) {
        let mut slot = lock(&self.auto_flush);
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            warn!("Auto-flush already running");
            return;
        }

        let writer = Arc::downgrade(self);
        let interval = self.flush_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Auto-flush task started");

            loop {
                tokio::time::sleep(interval).await;

                if stopped.load(Ordering::SeqCst) {
                    info!("Auto-flush task stopping");
                    break;
                }
                let Some(this) = writer.upgrade() else { break };
                if !this.caller.is_connected() {
                    continue;
                }

                if this.should_flush().await {
                    if let Some(result) = this.flush_batch().await {
                        debug!(
                            committed = result.committed,
                            failed = result.failed,
                            "Auto-flush batch completed"
                        );
                    }
                }
            }
        });
        *slot = Some(AutoFlushTask { stop, handle });
    }

    /// Stop the flush loop. A batch already being flushed runs to completion.
    pub fn stop_auto_flush(&self) {
        if let Some(task) = lock(&self.auto_flush).take() {
            task.stop.store(true, Ordering::SeqCst);
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn total_queued(&self) -> usize {
        self.buffer.read().await.total_queued()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.buffer.read().await.in_flight_count()
    }

    pub async fn backpressure(&self) -> f64 {
        self.buffer.read().await.backpressure()
    }

    pub async fn is_backpressured(&self) -> bool {
        self.buffer.read().await.is_backpressured()
    }

    pub async fn get_stats(&self) -> WriteBufferStats {
        self.buffer.read().await.get_stats()
    }

    pub async fn clear(&self) {
        self.buffer.write().await.clear();
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Drain everything queued into the store. Returns the number persisted.
    pub async fn persist_pending(&self) -> Result<usize> {
        let ops = self.buffer.write().await.drain_all();
        let json = serde_json::to_string(&ops)?;
        if let Err(e) = self.store.set(WRITE_BUFFER_KEY, &json) {
            // Keep the writes rather than lose them
            self.buffer.write().await.restore(ops);
            return Err(e);
        }
        info!(count = ops.len(), "Persisted pending writes");
        Ok(ops.len())
    }

    /// Re-queue writes persisted by a previous run. Returns the number restored.
    pub async fn restore_persisted(&self) -> Result<usize> {
        let Some(json) = self.store.get(WRITE_BUFFER_KEY)? else {
            return Ok(0);
        };
        let ops: Vec<WriteOperation> = serde_json::from_str(&json)?;
        let count = ops.len();
        self.buffer.write().await.restore(ops);
        self.store.remove(WRITE_BUFFER_KEY)?;
        if count > 0 {
            info!(count, "Restored pending writes");
        }
        Ok(count)
    }

    /// Stop flushing and drop everything, queued and in flight.
    pub async fn dispose(&self) {
        self.stop_auto_flush();
        self.buffer.write().await.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-op verdicts from a batch response: a bare array or `{results: [...]}`.
fn per_operation_results(data: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    match data {
        serde_json::Value::Array(results) => Some(results),
        serde_json::Value::Object(map) => map.get("results").and_then(|r| r.as_array()),
        _ => None,
    }
}

fn op_succeeded(result: &serde_json::Value) -> bool {
    match result {
        serde_json::Value::Bool(ok) => *ok,
        serde_json::Value::Object(map) => map
            .get("success")
            .and_then(|s| s.as_bool())
            .unwrap_or_else(|| !map.contains_key("error")),
        _ => false,
    }
}

fn classify(failed: Vec<String>, total: usize) -> Dispatch {
    if failed.is_empty() {
        Dispatch::Committed
    } else if failed.len() == total {
        Dispatch::Failed(format!("all {} operations failed", total))
    } else {
        Dispatch::Partial(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(op_id: &str, op_type: WriteOpType, payload: &str) -> WriteOperation {
        WriteOperation {
            op_id: op_id.into(),
            op_type,
            payload: payload.into(),
            priority: WritePriority::Normal,
            queued_at: 0,
            retry_count: 0,
            dedup_key: None,
        }
    }

    #[test]
    fn test_write_input_splits_doc_type() {
        let input = WriteInput::from(&op("content:manifesto", WriteOpType::CreateEntry, r#"{"title":"M"}"#));
        assert_eq!(input.doc_type.as_deref(), Some("content"));
        assert_eq!(input.id, "manifesto");
        assert_eq!(input.op_type, "create");
        assert_eq!(input.data, Some(json!({"title": "M"})));
    }

    #[test]
    fn test_delete_carries_no_data() {
        let input = WriteInput::from(&op("plain-id", WriteOpType::DeleteEntry, "{}"));
        assert!(input.doc_type.is_none());
        assert!(input.data.is_none());
        assert_eq!(input.op_type, "delete");
    }

    #[test]
    fn test_per_operation_results() {
        let bare = json!([true, {"success": false}, {"error": "x"}, {"hash": "uhC"}]);
        let verdicts: Vec<bool> = per_operation_results(&bare)
            .unwrap()
            .iter()
            .map(op_succeeded)
            .collect();
        assert_eq!(verdicts, vec![true, false, false, true]);

        let wrapped = json!({"results": [true]});
        assert_eq!(per_operation_results(&wrapped).unwrap().len(), 1);
        assert!(per_operation_results(&json!(null)).is_none());
    }

    #[test]
    fn test_classify() {
        assert!(matches!(classify(vec![], 3), Dispatch::Committed));
        assert!(matches!(classify(vec!["a".into()], 1), Dispatch::Failed(_)));
        assert!(matches!(classify(vec!["op-2".into()], 3), Dispatch::Partial(ids) if ids == vec!["op-2"]));
    }
}
