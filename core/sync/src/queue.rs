//! Pending operation queue.
//!
//! Durable, ordered log of mutations applied locally but not yet confirmed
//! by the backend. The log lives in the [`LocalStore`]; this type adds
//! sequence numbering, per-record coalescing and in-flight tracking.
//!
//! Callers that combine several queue and store calls into one
//! read-modify-write must hold the shared write gate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use larder_common::{merge_fields, Error, RecordKey, Result};
use larder_storage::{LocalStore, MutationOp, OpKind};

/// What happened to an op handed to [`PendingQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new op.
    Queued(Uuid),
    /// Folded into an earlier pending op of the same record.
    Merged(Uuid),
    /// A delete cancelled a create the server never saw; nothing to send.
    Cancelled,
}

/// Ordered, durable mutation log.
pub struct PendingQueue {
    store: Arc<dyn LocalStore>,
    next_seq: AtomicU64,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl PendingQueue {
    /// Open the queue over a store, continuing the stored sequence.
    pub async fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let ops = store.list_queue().await?;
        let next_seq = ops.iter().map(|op| op.created_seq).max().map_or(1, |max| max + 1);
        debug!("Opened queue with {} pending ops, next seq {}", ops.len(), next_seq);

        Ok(Self {
            store,
            next_seq: AtomicU64::new(next_seq),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    fn in_flight(&self) -> Result<MutexGuard<'_, HashSet<Uuid>>> {
        self.in_flight
            .lock()
            .map_err(|_| Error::Sync("In-flight set poisoned".to_string()))
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Add an op, coalescing it with the record's pending ops where allowed.
    ///
    /// The queue stamps `created_seq`. Only the newest pending op of a record
    /// that is neither in flight nor previously attempted absorbs new
    /// changes; an attempted op's idempotency key may already be recorded
    /// server-side.
    pub async fn enqueue(&self, mut op: MutationOp) -> Result<EnqueueOutcome> {
        let key = op.key();
        let pending = self.ops_for(&key).await?;
        let in_flight = self.in_flight()?.clone();
        let open = |candidate: &MutationOp| {
            !in_flight.contains(&candidate.op_id) && !candidate.was_attempted()
        };

        match op.kind {
            OpKind::Update => {
                if let Some(last) = pending.last().filter(|last| open(*last)) {
                    let mut merged = last.clone();
                    match last.kind {
                        OpKind::Update => {
                            merge_fields(&mut merged.changed_fields, &op.changed_fields);
                            merged.created_seq = self.next_seq();
                        }
                        OpKind::Create => {
                            merge_fields(&mut merged.changed_fields, &op.changed_fields);
                        }
                        OpKind::Delete => return self.append(op).await,
                    }
                    self.store.enqueue(&merged).await?;
                    debug!("Merged {} into {} for {}", op.kind, merged.op_id, key);
                    return Ok(EnqueueOutcome::Merged(merged.op_id));
                }
                self.append(op).await
            }
            OpKind::Delete => {
                let mut cancelled_create = false;
                let mut remaining = 0usize;
                for pending_op in &pending {
                    let removable = open(pending_op) && pending_op.kind != OpKind::Delete;
                    if removable {
                        cancelled_create |= pending_op.kind == OpKind::Create;
                        self.store.dequeue(&pending_op.op_id).await?;
                    } else {
                        remaining += 1;
                    }
                }

                if cancelled_create && remaining == 0 {
                    debug!("Delete of {} cancelled an unsent create", key);
                    return Ok(EnqueueOutcome::Cancelled);
                }
                op.changed_fields.clear();
                self.append(op).await
            }
            OpKind::Create => self.append(op).await,
        }
    }

    async fn append(&self, mut op: MutationOp) -> Result<EnqueueOutcome> {
        op.created_seq = self.next_seq();
        self.store.enqueue(&op).await?;
        debug!("Queued {} {} for {} (seq {})", op.kind, op.op_id, op.key(), op.created_seq);
        Ok(EnqueueOutcome::Queued(op.op_id))
    }

    /// Oldest ops in queue order, at most one per record.
    ///
    /// A record whose oldest op is in flight, or that is in `held`,
    /// contributes nothing.
    pub async fn peek_batch(
        &self,
        limit: usize,
        held: &HashSet<RecordKey>,
    ) -> Result<Vec<MutationOp>> {
        let ops = self.store.list_queue().await?;
        let in_flight = self.in_flight()?.clone();
        let mut seen: HashSet<RecordKey> = HashSet::new();
        let mut batch = Vec::new();

        for op in ops {
            if batch.len() >= limit {
                break;
            }
            let key = op.key();
            if held.contains(&key) || !seen.insert(key) {
                continue;
            }
            if in_flight.contains(&op.op_id) {
                continue;
            }
            batch.push(op);
        }
        Ok(batch)
    }

    /// Peek a batch and mark it in flight.
    pub async fn claim_batch(
        &self,
        limit: usize,
        held: &HashSet<RecordKey>,
    ) -> Result<Vec<MutationOp>> {
        let batch = self.peek_batch(limit, held).await?;
        let mut in_flight = self.in_flight()?;
        for op in &batch {
            in_flight.insert(op.op_id);
        }
        Ok(batch)
    }

    /// Clear the in-flight mark of an op.
    pub fn release(&self, op_id: &Uuid) -> Result<()> {
        self.in_flight()?.remove(op_id);
        Ok(())
    }

    pub fn is_in_flight(&self, op_id: &Uuid) -> Result<bool> {
        Ok(self.in_flight()?.contains(op_id))
    }

    /// Remove a confirmed (or discarded) op.
    pub async fn remove(&self, op_id: &Uuid) -> Result<()> {
        self.store.dequeue(op_id).await?;
        self.release(op_id)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.list_queue().await?.len())
    }

    /// Every pending op in queue order.
    pub async fn all(&self) -> Result<Vec<MutationOp>> {
        self.store.list_queue().await
    }

    /// Pending ops of one record in queue order.
    pub async fn ops_for(&self, key: &RecordKey) -> Result<Vec<MutationOp>> {
        Ok(self
            .store
            .list_queue()
            .await?
            .into_iter()
            .filter(|op| op.collection == key.collection && op.record_id == key.id)
            .collect())
    }

    /// Note a transport failure: bump `attempts`, keep the op.
    pub async fn record_failure(&self, op_id: &Uuid, error: &str) -> Result<()> {
        let ops = self.store.list_queue().await?;
        if let Some(mut op) = ops.into_iter().find(|op| op.op_id == *op_id) {
            op.attempts += 1;
            op.last_error = Some(error.to_string());
            self.store.enqueue(&op).await?;
        }
        self.release(op_id)
    }

    /// Drop every pending op of a record, returning what was dropped.
    pub async fn drop_record(&self, key: &RecordKey) -> Result<Vec<MutationOp>> {
        let ops = self.ops_for(key).await?;
        for op in &ops {
            self.store.dequeue(&op.op_id).await?;
            self.release(&op.op_id)?;
        }
        Ok(ops)
    }

    /// Point every pending op of a record at a newer server version.
    pub async fn rebase(&self, key: &RecordKey, server_version: u64) -> Result<()> {
        for mut op in self.ops_for(key).await? {
            if op.base_version != Some(server_version) {
                op.base_version = Some(server_version);
                self.store.enqueue(&op).await?;
            }
        }
        Ok(())
    }

    /// Move every pending op of a record to a new id.
    pub async fn remap_record(&self, key: &RecordKey, new_id: &str) -> Result<()> {
        for mut op in self.ops_for(key).await? {
            op.record_id = new_id.to_string();
            self.store.enqueue(&op).await?;
        }
        Ok(())
    }

    /// Forget in-flight marks. Used when the store is purged.
    pub fn reset(&self) -> Result<()> {
        self.in_flight()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_common::{Collection, Payload};
    use larder_storage::MemoryStore;
    use serde_json::json;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(Collection::new("ingredients").unwrap(), id)
    }

    fn fields(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn op(id: &str, kind: OpKind, value: serde_json::Value, base: Option<u64>) -> MutationOp {
        MutationOp::new(&key(id), kind, fields(value), base, 0)
    }

    async fn queue() -> PendingQueue {
        PendingQueue::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_updates_coalesce() {
        let queue = queue().await;
        queue.enqueue(op("42", OpKind::Update, json!({"price": 10}), Some(3))).await.unwrap();
        queue.enqueue(op("42", OpKind::Update, json!({"price": 12}), Some(3))).await.unwrap();
        queue.enqueue(op("42", OpKind::Update, json!({"name": "X"}), Some(3))).await.unwrap();

        let ops = queue.all().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].changed_fields, fields(json!({"price": 12, "name": "X"})));
        assert_eq!(ops[0].base_version, Some(3));
    }

    #[tokio::test]
    async fn test_merged_op_takes_newer_sequence() {
        let queue = queue().await;
        queue.enqueue(op("1", OpKind::Update, json!({"a": 1}), Some(1))).await.unwrap();
        queue.enqueue(op("2", OpKind::Update, json!({"b": 1}), Some(1))).await.unwrap();
        queue.enqueue(op("1", OpKind::Update, json!({"a": 2}), Some(1))).await.unwrap();

        let ops = queue.all().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].record_id, "2");
        assert_eq!(ops[1].record_id, "1");
    }

    #[tokio::test]
    async fn test_update_folds_into_create() {
        let queue = queue().await;
        queue.enqueue(op("tmp-1", OpKind::Create, json!({"name": "Salt", "price": 1}), None)).await.unwrap();
        let outcome = queue.enqueue(op("tmp-1", OpKind::Update, json!({"price": 2}), None)).await.unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Merged(_)));
        let ops = queue.all().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Create);
        assert_eq!(ops[0].changed_fields, fields(json!({"name": "Salt", "price": 2})));
    }

    #[tokio::test]
    async fn test_no_coalescing_into_in_flight_op() {
        let queue = queue().await;
        queue.enqueue(op("42", OpKind::Update, json!({"price": 10}), Some(1))).await.unwrap();
        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        assert_eq!(batch.len(), 1);

        queue.enqueue(op("42", OpKind::Update, json!({"price": 12}), Some(1))).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_no_coalescing_into_attempted_op() {
        let queue = queue().await;
        queue.enqueue(op("42", OpKind::Update, json!({"price": 10}), Some(1))).await.unwrap();
        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        queue.record_failure(&batch[0].op_id, "timeout").await.unwrap();

        queue.enqueue(op("42", OpKind::Update, json!({"price": 12}), Some(1))).await.unwrap();
        let ops = queue.all().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].attempts, 1);
        assert_eq!(ops[0].changed_fields, fields(json!({"price": 10})));
    }

    #[tokio::test]
    async fn test_delete_cancels_unsent_create() {
        let queue = queue().await;
        queue.enqueue(op("tmp-1", OpKind::Create, json!({"name": "Salt"}), None)).await.unwrap();
        queue.enqueue(op("tmp-1", OpKind::Update, json!({"name": "Sea salt"}), None)).await.unwrap();

        let outcome = queue.enqueue(op("tmp-1", OpKind::Delete, json!({}), None)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_keeps_attempted_create() {
        let queue = queue().await;
        queue.enqueue(op("tmp-1", OpKind::Create, json!({"name": "Salt"}), None)).await.unwrap();
        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        queue.record_failure(&batch[0].op_id, "reset").await.unwrap();

        let outcome = queue.enqueue(op("tmp-1", OpKind::Delete, json!({}), None)).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));

        let kinds: Vec<OpKind> = queue.all().await.unwrap().iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OpKind::Create, OpKind::Delete]);
    }

    #[tokio::test]
    async fn test_delete_replaces_pending_updates() {
        let queue = queue().await;
        queue.enqueue(op("42", OpKind::Update, json!({"price": 10}), Some(2))).await.unwrap();
        let outcome = queue.enqueue(op("42", OpKind::Delete, json!({}), Some(2))).await.unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        let ops = queue.all().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Delete);
    }

    #[tokio::test]
    async fn test_peek_batch_takes_oldest_op_per_record() {
        let queue = queue().await;
        queue.enqueue(op("tmp-1", OpKind::Create, json!({"name": "Salt"}), None)).await.unwrap();
        queue.enqueue(op("7", OpKind::Update, json!({"price": 1}), Some(1))).await.unwrap();
        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        queue.record_failure(&batch[0].op_id, "reset").await.unwrap();
        queue.record_failure(&batch[1].op_id, "reset").await.unwrap();
        queue.enqueue(op("tmp-1", OpKind::Update, json!({"price": 3}), None)).await.unwrap();

        let batch = queue.peek_batch(10, &HashSet::new()).await.unwrap();
        let picked: Vec<(String, OpKind)> =
            batch.iter().map(|o| (o.record_id.clone(), o.kind)).collect();
        assert_eq!(
            picked,
            vec![("tmp-1".to_string(), OpKind::Create), ("7".to_string(), OpKind::Update)]
        );

        assert_eq!(queue.peek_batch(1, &HashSet::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_record_contributes_nothing() {
        let queue = queue().await;
        queue.enqueue(op("7", OpKind::Update, json!({"price": 1}), Some(1))).await.unwrap();
        queue.claim_batch(10, &HashSet::new()).await.unwrap();

        assert!(queue.peek_batch(10, &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_record_is_skipped() {
        let queue = queue().await;
        queue.enqueue(op("7", OpKind::Update, json!({"price": 1}), Some(1))).await.unwrap();
        queue.enqueue(op("8", OpKind::Update, json!({"price": 2}), Some(1))).await.unwrap();
        let held: HashSet<RecordKey> = [key("7")].into_iter().collect();

        let batch = queue.claim_batch(10, &held).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record_id, "8");

        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record_id, "7");
    }

    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let queue = PendingQueue::open(store.clone()).await.unwrap();
        queue.enqueue(op("1", OpKind::Update, json!({"a": 1}), Some(1))).await.unwrap();
        queue.enqueue(op("2", OpKind::Update, json!({"a": 1}), Some(1))).await.unwrap();

        let reopened = PendingQueue::open(store).await.unwrap();
        reopened.enqueue(op("3", OpKind::Update, json!({"a": 1}), Some(1))).await.unwrap();

        let seqs: Vec<u64> = reopened.all().await.unwrap().iter().map(|o| o.created_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rebase_remap_and_drop() {
        let queue = queue().await;
        queue.enqueue(op("tmp-1", OpKind::Create, json!({"name": "Salt"}), None)).await.unwrap();
        let batch = queue.claim_batch(10, &HashSet::new()).await.unwrap();
        queue.enqueue(op("tmp-1", OpKind::Update, json!({"price": 3}), None)).await.unwrap();
        queue.remove(&batch[0].op_id).await.unwrap();

        queue.remap_record(&key("tmp-1"), "99").await.unwrap();
        queue.rebase(&key("99"), 1).await.unwrap();

        let ops = queue.ops_for(&key("99")).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].base_version, Some(1));
        assert!(queue.ops_for(&key("tmp-1")).await.unwrap().is_empty());

        let dropped = queue.drop_record(&key("99")).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
