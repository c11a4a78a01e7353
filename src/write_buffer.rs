//! Write Buffer - Batched write operations with priority queues
//!
//! Protects the conductor from heavy write loads during seeding, sync,
//! and recovery operations. Provides backpressure signaling and
//! caller-driven retry.
//!
//! # Priority Levels
//!
//! 1. **High** - Identity, authentication, critical state (flushed immediately)
//! 2. **Normal** - Regular content updates (batched)
//! 3. **Bulk** - Seeding, imports, recovery sync (heavily batched, throttled)
//!
//! # Example
//!
//! ```rust,ignore
//! let mut buffer = WriteBuffer::for_seeding();
//!
//! buffer.queue_write("content-123", WriteOpType::CreateEntry, r#"{"id":"content-123"}"#, WritePriority::Bulk);
//!
//! if buffer.should_flush() {
//!     if let Some(batch) = buffer.get_pending_batch().batch {
//!         // send batch to conductor...
//!         buffer.mark_batch_committed(&batch.batch_id);
//!         // or: buffer.mark_operations_failed(&batch.batch_id, &["op-2".into()]);
//!     }
//! }
//! ```
//!
//! The buffer is a plain data structure with no I/O. [`BufferedWriter`]
//! drives it against the conductor.
//!
//! [`BufferedWriter`]: crate::buffered_writer::BufferedWriter

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::WriteBufferSection;

// =============================================================================
// Write Priority - Determines queue and flush behavior
// =============================================================================

/// Priority level for write operations.
///
/// Higher priority = flushed sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum WritePriority {
    /// Critical writes: identity, auth, consent - flush immediately
    High,
    /// Normal content updates - batch moderately
    #[default]
    Normal,
    /// Bulk operations: seeding, sync, recovery - batch aggressively
    Bulk,
}

// =============================================================================
// Write Operation Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOpType {
    CreateEntry,
    UpdateEntry,
    DeleteEntry,
    CreateLink,
    DeleteLink,
}

// =============================================================================
// Write Operation - Single queued write
// =============================================================================

/// A single write operation waiting to be flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOperation {
    /// Unique operation ID (for tracking and partial-failure reporting)
    pub op_id: String,
    pub op_type: WriteOpType,
    /// Serialized payload (entry data, link data, etc.)
    pub payload: String,
    pub priority: WritePriority,
    /// When this operation was queued (unix ms)
    pub queued_at: u64,
    /// Times this operation came back from a failed batch
    pub retry_count: u32,
    /// Deduplication key (e.g., entry hash for updates)
    pub dedup_key: Option<String>,
}

// =============================================================================
// Batch - Group of operations to flush together
// =============================================================================

/// A batch of write operations ready to send to conductor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub batch_id: String,
    pub operations: Vec<WriteOperation>,
    pub created_at: u64,
    /// Highest priority of contained ops
    pub priority: WritePriority,
}

/// Result of taking a pending batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub has_batch: bool,
    pub batch: Option<WriteBatch>,
    /// Operations still queued after this batch was taken
    pub remaining_count: usize,
}

// =============================================================================
// Buffer Statistics
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBufferStats {
    pub high_queue_count: usize,
    pub normal_queue_count: usize,
    pub bulk_queue_count: usize,
    pub in_flight_batches: usize,
    pub in_flight_ops: usize,
    pub batches_flushed: u64,
    pub ops_committed: u64,
    /// Operations requeued after a failed batch
    pub ops_retried: u64,
    /// Operations collapsed by dedup key
    pub ops_deduplicated: u64,
    /// Writes refused at capacity
    pub ops_rejected: u64,
    /// Queue occupancy vs capacity
    pub backpressure: f64,
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBufferConfig {
    /// Max operations per batch
    pub batch_size: usize,
    /// Oldest queued op may wait this long before a flush is due
    pub max_latency: Duration,
    /// Hard bound for Normal and Bulk writes
    pub max_queue_size: usize,
    /// Occupancy ratio reported as backpressure
    pub backpressure_threshold: f64,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self::from(&WriteBufferSection::default())
    }
}

impl From<&WriteBufferSection> for WriteBufferConfig {
    fn from(section: &WriteBufferSection) -> Self {
        Self {
            batch_size: (section.batch_size as usize).max(1),
            max_latency: Duration::from_millis(section.max_latency_ms),
            max_queue_size: (section.max_queue_size as usize).max(1),
            backpressure_threshold: section.backpressure_threshold,
        }
    }
}

impl WriteBufferConfig {
    /// Config optimized for seeding (large batches, fast flush)
    pub fn seeding() -> Self {
        Self {
            batch_size: 100,
            max_latency: Duration::from_millis(50),
            max_queue_size: 10_000,
            backpressure_threshold: 0.8,
        }
    }

    /// Config optimized for interactive use (small batches, responsive)
    pub fn interactive() -> Self {
        Self {
            batch_size: 20,
            max_latency: Duration::from_millis(100),
            max_queue_size: 1_000,
            backpressure_threshold: 0.8,
        }
    }

    /// Config optimized for recovery (very large batches)
    pub fn recovery() -> Self {
        Self {
            batch_size: 200,
            max_latency: Duration::from_millis(25),
            max_queue_size: 50_000,
            backpressure_threshold: 0.8,
        }
    }
}

// =============================================================================
// WriteQueue - the buffer contract
// =============================================================================

/// Priority write queue with caller-reported batch outcomes.
///
/// Invariant: an operation is either queued or in flight, never both.
pub trait WriteQueue: Send + Sync {
    /// `false` when the hard capacity bound is reached (High is never refused).
    fn queue_write(
        &mut self,
        op_id: &str,
        op_type: WriteOpType,
        payload: &str,
        priority: WritePriority,
    ) -> bool {
        self.queue_write_with_dedup(op_id, op_type, payload, priority, None)
    }

    /// Replace any queued (not in-flight) operation with the same key, last write wins.
    fn queue_write_with_dedup(
        &mut self,
        op_id: &str,
        op_type: WriteOpType,
        payload: &str,
        priority: WritePriority,
        dedup_key: Option<&str>,
    ) -> bool;

    fn should_flush(&self) -> bool;

    /// Move up to one batch from queued to in-flight.
    fn get_pending_batch(&mut self) -> BatchResult;

    fn mark_batch_committed(&mut self, batch_id: &str);

    /// Requeue every operation in the batch.
    fn mark_batch_failed(&mut self, batch_id: &str, reason: &str);

    /// Requeue the named operations and commit the rest.
    fn mark_operations_failed(&mut self, batch_id: &str, failed_op_ids: &[String]);

    fn total_queued(&self) -> usize;

    /// Batches taken and not yet reported.
    fn in_flight_count(&self) -> usize;

    /// Occupancy ratio; may exceed 1.0 since High writes bypass the bound.
    fn backpressure(&self) -> f64;

    fn is_backpressured(&self) -> bool;

    fn get_stats(&self) -> WriteBufferStats;

    /// Zero the counters, keep the operations.
    fn reset_stats(&mut self);

    fn set_max_queue_size(&mut self, size: usize);

    /// Drop everything queued. In-flight batches are left for their outcome.
    fn clear(&mut self);

    /// Take everything queued, for persisting across a restart.
    fn drain_all(&mut self) -> Vec<WriteOperation>;

    /// Re-queue previously drained operations.
    fn restore(&mut self, operations: Vec<WriteOperation>);

    /// Drop all state. Later writes are refused.
    fn dispose(&mut self);
}

// =============================================================================
// Write Buffer - Main buffering engine
// =============================================================================

/// Write buffer with priority queues and batching.
///
/// Protects conductor from heavy write loads by:
/// - Batching operations together
/// - Priority-based flushing (critical writes go first)
/// - Deduplication within batch window
/// - Backpressure signaling
#[derive(Debug)]
pub struct WriteBuffer {
    config: WriteBufferConfig,

    // Priority queues
    high_queue: VecDeque<WriteOperation>,
    normal_queue: VecDeque<WriteOperation>,
    bulk_queue: VecDeque<WriteOperation>,

    // Deduplication map: dedup_key -> op_id of the queued holder
    dedup_index: HashMap<String, String>,

    // In-flight batches: batch_id -> batch
    in_flight: HashMap<String, WriteBatch>,

    // Statistics
    batches_flushed: u64,
    ops_committed: u64,
    ops_retried: u64,
    ops_deduplicated: u64,
    ops_rejected: u64,

    next_batch_id: u64,
    disposed: bool,
}

impl WriteBuffer {
    pub fn new(config: WriteBufferConfig) -> Self {
        Self {
            config,
            high_queue: VecDeque::new(),
            normal_queue: VecDeque::new(),
            bulk_queue: VecDeque::new(),
            dedup_index: HashMap::new(),
            in_flight: HashMap::new(),
            batches_flushed: 0,
            ops_committed: 0,
            ops_retried: 0,
            ops_deduplicated: 0,
            ops_rejected: 0,
            next_batch_id: 0,
            disposed: false,
        }
    }

    pub fn for_seeding() -> Self {
        Self::new(WriteBufferConfig::seeding())
    }

    pub fn for_interactive() -> Self {
        Self::new(WriteBufferConfig::interactive())
    }

    pub fn for_recovery() -> Self {
        Self::new(WriteBufferConfig::recovery())
    }

    pub fn config(&self) -> &WriteBufferConfig {
        &self.config
    }

    fn queue_mut(&mut self, priority: WritePriority) -> &mut VecDeque<WriteOperation> {
        match priority {
            WritePriority::High => &mut self.high_queue,
            WritePriority::Normal => &mut self.normal_queue,
            WritePriority::Bulk => &mut self.bulk_queue,
        }
    }

    fn queues(&self) -> [&VecDeque<WriteOperation>; 3] {
        [&self.high_queue, &self.normal_queue, &self.bulk_queue]
    }

    /// Remove an operation from queues (for deduplication).
    fn remove_from_queues(&mut self, op_id: &str) {
        self.high_queue.retain(|op| op.op_id != op_id);
        self.normal_queue.retain(|op| op.op_id != op_id);
        self.bulk_queue.retain(|op| op.op_id != op_id);
    }

    /// Put failed operations back at the head of their queues, in batch order.
    fn requeue(&mut self, operations: Vec<WriteOperation>) {
        for mut op in operations.into_iter().rev() {
            if let Some(key) = &op.dedup_key {
                // A newer write for the same key arrived while this one was in flight
                if self.dedup_index.contains_key(key) {
                    self.ops_deduplicated += 1;
                    continue;
                }
                self.dedup_index.insert(key.clone(), op.op_id.clone());
            }
            op.retry_count += 1;
            self.ops_retried += 1;
            self.queue_mut(op.priority).push_front(op);
        }
    }

    fn oldest_queued_at(&self) -> Option<u64> {
        self.queues()
            .iter()
            .flat_map(|q| q.iter().map(|op| op.queued_at))
            .min()
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new(WriteBufferConfig::default())
    }
}

impl WriteQueue for WriteBuffer {
    fn queue_write_with_dedup(
        &mut self,
        op_id: &str,
        op_type: WriteOpType,
        payload: &str,
        priority: WritePriority,
        dedup_key: Option<&str>,
    ) -> bool {
        if self.disposed {
            return false;
        }

        // The index only holds queued operations, so a hit is a replacement
        let replaces = dedup_key.and_then(|key| self.dedup_index.get(key).cloned());

        // Check capacity (but always allow high priority and replacements)
        if replaces.is_none()
            && priority != WritePriority::High
            && self.total_queued() >= self.config.max_queue_size
        {
            self.ops_rejected += 1;
            return false;
        }

        if let Some(old_op_id) = replaces {
            self.remove_from_queues(&old_op_id);
            self.ops_deduplicated += 1;
        }
        if let Some(key) = dedup_key {
            self.dedup_index.insert(key.to_string(), op_id.to_string());
        }

        let op = WriteOperation {
            op_id: op_id.to_string(),
            op_type,
            payload: payload.to_string(),
            priority,
            queued_at: now_ms(),
            retry_count: 0,
            dedup_key: dedup_key.map(str::to_string),
        };
        self.queue_mut(priority).push_back(op);
        true
    }

    /// True when:
    /// - High priority queue has any items
    /// - Queued operations fill a batch
    /// - The oldest queued operation has waited past max latency
    fn should_flush(&self) -> bool {
        if !self.high_queue.is_empty() {
            return true;
        }
        if self.total_queued() >= self.config.batch_size {
            return true;
        }
        match self.oldest_queued_at() {
            Some(oldest) => {
                now_ms().saturating_sub(oldest) >= self.config.max_latency.as_millis() as u64
            }
            None => false,
        }
    }

    /// Priority order: High → Normal → Bulk, FIFO within each.
    fn get_pending_batch(&mut self) -> BatchResult {
        let batch_size = self.config.batch_size;
        let mut operations = Vec::with_capacity(batch_size.min(self.total_queued()));

        for priority in [WritePriority::High, WritePriority::Normal, WritePriority::Bulk] {
            let room = batch_size - operations.len();
            if room == 0 {
                break;
            }
            let queue = self.queue_mut(priority);
            let take = room.min(queue.len());
            operations.extend(queue.drain(..take));
        }

        if operations.is_empty() {
            return BatchResult {
                has_batch: false,
                batch: None,
                remaining_count: 0,
            };
        }

        // In-flight operations no longer absorb dedup writes
        for op in &operations {
            if let Some(key) = &op.dedup_key {
                if self.dedup_index.get(key) == Some(&op.op_id) {
                    self.dedup_index.remove(key);
                }
            }
        }

        let batch_id = format!("batch-{}", self.next_batch_id);
        self.next_batch_id += 1;

        let batch = WriteBatch {
            batch_id: batch_id.clone(),
            priority: operations[0].priority,
            operations,
            created_at: now_ms(),
        };

        self.in_flight.insert(batch_id, batch.clone());
        self.batches_flushed += 1;

        BatchResult {
            has_batch: true,
            batch: Some(batch),
            remaining_count: self.total_queued(),
        }
    }

    fn mark_batch_committed(&mut self, batch_id: &str) {
        if let Some(batch) = self.in_flight.remove(batch_id) {
            self.ops_committed += batch.operations.len() as u64;
        }
    }

    fn mark_batch_failed(&mut self, batch_id: &str, _reason: &str) {
        if let Some(batch) = self.in_flight.remove(batch_id) {
            self.requeue(batch.operations);
        }
    }

    fn mark_operations_failed(&mut self, batch_id: &str, failed_op_ids: &[String]) {
        if let Some(batch) = self.in_flight.remove(batch_id) {
            let (failed, committed): (Vec<_>, Vec<_>) = batch
                .operations
                .into_iter()
                .partition(|op| failed_op_ids.contains(&op.op_id));
            self.ops_committed += committed.len() as u64;
            self.requeue(failed);
        }
    }

    fn total_queued(&self) -> usize {
        self.high_queue.len() + self.normal_queue.len() + self.bulk_queue.len()
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn backpressure(&self) -> f64 {
        self.total_queued() as f64 / self.config.max_queue_size as f64
    }

    fn is_backpressured(&self) -> bool {
        self.backpressure() >= self.config.backpressure_threshold
    }

    fn get_stats(&self) -> WriteBufferStats {
        WriteBufferStats {
            high_queue_count: self.high_queue.len(),
            normal_queue_count: self.normal_queue.len(),
            bulk_queue_count: self.bulk_queue.len(),
            in_flight_batches: self.in_flight.len(),
            in_flight_ops: self.in_flight.values().map(|b| b.operations.len()).sum(),
            batches_flushed: self.batches_flushed,
            ops_committed: self.ops_committed,
            ops_retried: self.ops_retried,
            ops_deduplicated: self.ops_deduplicated,
            ops_rejected: self.ops_rejected,
            backpressure: self.backpressure(),
        }
    }

    fn reset_stats(&mut self) {
        self.batches_flushed = 0;
        self.ops_committed = 0;
        self.ops_retried = 0;
        self.ops_deduplicated = 0;
        self.ops_rejected = 0;
    }

    fn set_max_queue_size(&mut self, size: usize) {
        self.config.max_queue_size = size.max(1);
    }

    fn clear(&mut self) {
        self.high_queue.clear();
        self.normal_queue.clear();
        self.bulk_queue.clear();
        self.dedup_index.clear();
    }

    fn drain_all(&mut self) -> Vec<WriteOperation> {
        let mut all_ops = Vec::with_capacity(self.total_queued());
        all_ops.extend(self.high_queue.drain(..));
        all_ops.extend(self.normal_queue.drain(..));
        all_ops.extend(self.bulk_queue.drain(..));
        self.dedup_index.clear();
        all_ops
    }

    fn restore(&mut self, operations: Vec<WriteOperation>) {
        if self.disposed {
            return;
        }
        for op in operations {
            if let Some(key) = &op.dedup_key {
                if let Some(old_op_id) = self.dedup_index.get(key).cloned() {
                    self.remove_from_queues(&old_op_id);
                    self.ops_deduplicated += 1;
                }
                self.dedup_index.insert(key.clone(), op.op_id.clone());
            }
            self.queue_mut(op.priority).push_back(op);
        }
    }

    fn dispose(&mut self) {
        self.clear();
        self.in_flight.clear();
        self.disposed = true;
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// Tests
// =============================================================================
