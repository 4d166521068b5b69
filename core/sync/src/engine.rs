//! Core sync engine that drains the pending queue against the backend.
//!
//! A batch holds at most one op per record, so ops of one record are never
//! sent concurrently or out of order. The ops of a batch are sent
//! concurrently; their outcomes are applied in queue order under the write
//! gate once every call has returned.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use larder_common::{merge_fields, Collection, RecordKey, RemoteRecord, Result};
use larder_remote::{RemoteError, RemoteResult};
use larder_storage::{CachedRecord, MutationOp, OpKind};

use crate::conflict::{ConflictInfo, ConflictResolver, ResolutionResult};
use crate::context::SyncContext;
use crate::events::RecordEvent;

/// Outcome counts of one or more drained batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub batches: usize,
    pub sent: usize,
    pub succeeded: usize,
    pub conflicts: usize,
    pub rejected: usize,
    /// Ops kept for retry after a transport failure.
    pub failed: usize,
    /// Ops still queued afterwards.
    pub remaining: usize,
}

impl DrainReport {
    fn absorb(&mut self, batch: &DrainReport) {
        self.batches += batch.batches;
        self.sent += batch.sent;
        self.succeeded += batch.succeeded;
        self.conflicts += batch.conflicts;
        self.rejected += batch.rejected;
        self.failed += batch.failed;
        self.remaining = batch.remaining;
    }

    /// Every sent op was accepted.
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0 && self.rejected == 0 && self.failed == 0
    }
}

/// Queue drainer.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    resolver: ConflictResolver,
    batch_size: usize,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(ctx: Arc<SyncContext>, batch_size: usize) -> Self {
        Self {
            ctx,
            resolver: ConflictResolver::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Drain batches until the queue is empty, a transport failure occurs,
    /// or `halt` is raised. A batch that started always finishes.
    pub async fn drain(&self, halt: &AtomicBool) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let batch = self.drain_batch().await?;
            let exhausted = batch.sent == 0 || batch.failed > 0;
            total.absorb(&batch);
            if exhausted || halt.load(Ordering::SeqCst) {
                break;
            }
        }

        if total.remaining == 0 {
            self.ctx.state.mark_synced(total.is_clean());
        }
        if total.sent > 0 {
            info!(
                "Drain finished: {} succeeded, {} conflicts, {} rejected, {} failed, {} remaining",
                total.succeeded, total.conflicts, total.rejected, total.failed, total.remaining
            );
        }
        Ok(total)
    }

    /// Send one batch and apply its outcomes.
    pub async fn drain_batch(&self) -> Result<DrainReport> {
        let batch = {
            let _gate = self.ctx.gate.lock().await;
            let held = self.ctx.holds.held()?;
            self.ctx.queue.claim_batch(self.batch_size, &held).await?
        };

        let mut report = DrainReport::default();
        if batch.is_empty() {
            report.remaining = self.ctx.publish_pending().await?;
            return Ok(report);
        }
        report.batches = 1;
        report.sent = batch.len();
        debug!("Sending batch of {} ops", batch.len());

        let outcomes = join_all(batch.iter().map(|op| self.dispatch(op))).await;

        let mut rejected = Vec::new();
        {
            let _gate = self.ctx.gate.lock().await;
            let claimed: Vec<_> = batch.iter().map(|op| op.op_id).collect();
            let applied = self.apply_all(batch, outcomes, &mut report, &mut rejected).await;
            for op_id in &claimed {
                self.ctx.queue.release(op_id)?;
            }
            applied?;
        }
        if !rejected.is_empty() {
            self.restore_server_copies(&rejected).await?;
        }

        report.remaining = self.ctx.publish_pending().await?;
        Ok(report)
    }

    async fn dispatch(&self, op: &MutationOp) -> RemoteResult<Option<RemoteRecord>> {
        let backend = &self.ctx.backend;
        match op.kind {
            OpKind::Create => backend
                .create_record(&op.collection, &op.changed_fields, op.op_id)
                .await
                .map(Some),
            OpKind::Update => backend
                .update_record(
                    &op.collection,
                    &op.record_id,
                    &op.changed_fields,
                    op.base_version,
                    op.op_id,
                )
                .await
                .map(Some),
            OpKind::Delete => backend
                .delete_record(&op.collection, &op.record_id, op.base_version, op.op_id)
                .await
                .map(|()| None),
        }
    }

    async fn apply_all(
        &self,
        batch: Vec<MutationOp>,
        outcomes: Vec<RemoteResult<Option<RemoteRecord>>>,
        report: &mut DrainReport,
        rejected: &mut Vec<RecordKey>,
    ) -> Result<()> {
        for (op, outcome) in batch.into_iter().zip(outcomes) {
            match outcome {
                Ok(server) => {
                    self.apply_success(op, server).await?;
                    report.succeeded += 1;
                }
                Err(RemoteError::Conflict { current }) => {
                    self.apply_conflict(op, current).await?;
                    report.conflicts += 1;
                }
                Err(RemoteError::Rejected(reason)) => {
                    if op.kind != OpKind::Create {
                        rejected.push(op.key());
                    }
                    self.apply_rejection(op, reason).await?;
                    report.rejected += 1;
                }
                Err(RemoteError::Transport(reason)) => {
                    warn!("Transport failure on {} {}: {}", op.kind, op.key(), reason);
                    self.ctx.queue.record_failure(&op.op_id, &reason).await?;
                    self.ctx.state.record_error(reason);
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn apply_success(&self, op: MutationOp, server: Option<RemoteRecord>) -> Result<()> {
        let key = op.key();
        self.ctx.queue.remove(&op.op_id).await?;
        debug!("{} of {} confirmed", op.kind, key);

        match (op.kind, server) {
            (OpKind::Delete, _) => {
                self.ctx.store.delete(&key).await?;
                self.ctx.emit(RecordEvent::Removed(key));
            }
            (kind, Some(server)) => {
                let key = if kind == OpKind::Create && server.id != key.id {
                    self.adopt_server_id(&key, &server.id).await?
                } else {
                    key
                };
                self.merge_confirmed(&key, &server).await?;
            }
            (kind, None) => {
                warn!("Backend confirmed {} of {} without a record", kind, key);
            }
        }
        Ok(())
    }

    /// Move a locally created record to the id the server assigned.
    async fn adopt_server_id(&self, temp: &RecordKey, server_id: &str) -> Result<RecordKey> {
        let key = temp.with_id(server_id);

        if let Some(mut record) = self.ctx.store.get(temp).await? {
            self.ctx.store.delete(temp).await?;
            record.id = server_id.to_string();
            self.ctx.store.put(&record).await?;
        }
        self.ctx.queue.remap_record(temp, server_id).await?;
        self.ctx.holds.remap(temp, server_id)?;
        self.ctx.aliases.insert(temp, server_id);

        info!("Record {} is now {}", temp, key);
        self.ctx.emit(RecordEvent::IdRemapped {
            collection: temp.collection.clone(),
            temp_id: temp.id.clone(),
            server_id: server_id.to_string(),
        });
        Ok(key)
    }

    /// Write the server's copy, overlaid with intentions still pending.
    async fn merge_confirmed(&self, key: &RecordKey, server: &RemoteRecord) -> Result<()> {
        self.ctx.queue.rebase(key, server.server_version).await?;
        let remaining = self.ctx.queue.ops_for(key).await?;
        let local = self.ctx.store.get(key).await?;

        if local.is_none() && remaining.is_empty() {
            debug!("{} was dropped locally, not restoring it", key);
            return Ok(());
        }

        let mut payload = server.payload.clone();
        for pending in &remaining {
            merge_fields(&mut payload, &pending.changed_fields);
        }

        let deleted = local.as_ref().is_some_and(|r| r.deleted);
        let record = CachedRecord {
            collection: key.collection.clone(),
            id: key.id.clone(),
            payload,
            server_version: Some(server.server_version),
            local_dirty: !remaining.is_empty(),
            deleted,
            last_error: None,
        };
        self.ctx.store.put(&record).await?;
        if !deleted {
            self.ctx.emit(RecordEvent::Changed(key.clone()));
        }
        Ok(())
    }

    async fn apply_conflict(&self, op: MutationOp, current: Option<RemoteRecord>) -> Result<()> {
        let conflict = ConflictInfo::from_op(&op, current);
        let message = conflict.describe();
        if op.kind == OpKind::Create {
            // A create has no base version to be stale against.
            return self.apply_rejection(op, message).await;
        }

        warn!("Conflict: {}", message);
        let dropped = self.ctx.queue.drop_record(&conflict.key).await?;
        self.ctx.holds.discard(&conflict.key)?;
        debug!("Dropped {} pending ops of {}", dropped.len(), conflict.key);

        match self.resolver.resolve(&conflict) {
            ResolutionResult::UsedRemote(record) => {
                self.ctx.store.put(&record).await?;
                self.ctx.emit(RecordEvent::Changed(conflict.key.clone()));
            }
            ResolutionResult::Purged => {
                self.ctx.store.delete(&conflict.key).await?;
                self.ctx.emit(RecordEvent::Removed(conflict.key.clone()));
            }
        }

        self.ctx.state.record_error(message);
        Ok(())
    }

    async fn apply_rejection(&self, op: MutationOp, reason: String) -> Result<()> {
        let key = op.key();
        warn!("Backend rejected {} of {}: {}", op.kind, key, reason);

        if op.kind == OpKind::Create {
            // Nothing after a failed create can succeed.
            self.ctx.queue.drop_record(&key).await?;
            self.ctx.holds.discard(&key)?;
        } else {
            self.ctx.queue.remove(&op.op_id).await?;
        }

        if let Some(mut record) = self.ctx.store.get(&key).await? {
            record.last_error = Some(reason.clone());
            if op.kind != OpKind::Create {
                record.local_dirty = !self.ctx.queue.ops_for(&key).await?.is_empty();
            }
            if op.kind == OpKind::Delete {
                record.deleted = false;
            }
            self.ctx.store.put(&record).await?;
            self.ctx.emit(RecordEvent::Changed(key.clone()));
        }

        self.ctx.state.record_error(format!("{}: {}", key, reason));
        Ok(())
    }

    /// Put the server's copy back over values the backend refused.
    ///
    /// Records that gained new ops meanwhile are left to those ops. When the
    /// fetch fails the refused values stay, marked with the rejection, until
    /// the next refresh of the collection.
    async fn restore_server_copies(&self, keys: &[RecordKey]) -> Result<()> {
        let mut by_collection: HashMap<&Collection, Vec<&RecordKey>> = HashMap::new();
        for key in keys {
            by_collection.entry(&key.collection).or_default().push(key);
        }

        for (collection, keys) in by_collection {
            let server = match self.ctx.backend.fetch_all(collection).await {
                Ok(records) => records,
                Err(err) => {
                    warn!("Could not restore rejected records of {}: {}", collection, err);
                    continue;
                }
            };

            let _gate = self.ctx.gate.lock().await;
            for key in keys {
                if !self.ctx.queue.ops_for(key).await?.is_empty() {
                    continue;
                }
                let Some(local) = self.ctx.store.get(key).await? else {
                    continue;
                };
                match server.iter().find(|r| r.id == key.id) {
                    Some(remote) => {
                        let mut record = CachedRecord::confirmed(
                            key,
                            remote.payload.clone(),
                            remote.server_version,
                        );
                        record.last_error = local.last_error;
                        self.ctx.store.put(&record).await?;
                        debug!("Restored server copy of {}", key);
                        self.ctx.emit(RecordEvent::Changed(key.clone()));
                    }
                    None => {
                        self.ctx.store.delete(key).await?;
                        self.ctx.emit(RecordEvent::Removed(key.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}
