//! Data service: the read/write entry point for domain code.
//!
//! Writes land in the local store at once and are queued for the backend;
//! callers never wait for the network. Reads are served from the cache.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use larder_common::{diff_fields, Collection, Error, Payload, RecordKey, Result};
use larder_storage::{CachedRecord, MutationOp, OpKind};

use crate::context::SyncContext;
use crate::events::RecordEvent;
use crate::queue::EnqueueOutcome;
use crate::retry::{RetryConfig, RetryExecutor};

/// Prefix of ids assigned to records created on this device.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Result of a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshOutcome {
    /// The collection now mirrors the server, plus local pending work.
    Fresh { records: usize },
    /// The cache was left as it was.
    Stale { reason: String },
}

/// Read/write façade over the cache and the pending queue.
pub struct DataService {
    ctx: Arc<SyncContext>,
    executor: RetryExecutor,
    hydrated: Mutex<HashSet<Collection>>,
}

impl DataService {
    pub fn new(ctx: Arc<SyncContext>, retry: RetryConfig) -> Self {
        Self {
            ctx,
            executor: RetryExecutor::new(retry),
            hydrated: Mutex::new(HashSet::new()),
        }
    }

    fn key(&self, collection: &Collection, id: &str) -> RecordKey {
        self.ctx
            .aliases
            .resolve(&RecordKey::new(collection.clone(), id))
    }

    /// Current id of a record, following temp-id remaps.
    pub fn resolve_id(&self, collection: &Collection, id: &str) -> String {
        self.key(collection, id).id
    }

    /// Queued ops in send order.
    pub async fn pending_ops(&self) -> Result<Vec<MutationOp>> {
        self.ctx.queue.all().await
    }

    /// Receiver of record change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.ctx.events.subscribe()
    }

    /// Create a record locally and queue it; returns its temp id.
    ///
    /// # Errors
    /// - `Validation` if the payload is empty
    /// - `Storage` if the local write fails
    pub async fn create(&self, collection: &Collection, payload: Payload) -> Result<String> {
        if payload.is_empty() {
            return Err(Error::Validation("Cannot create an empty record".to_string()));
        }
        let key = RecordKey::new(collection.clone(), format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()));

        {
            let _gate = self.ctx.gate.lock().await;
            self.ctx.store.put(&CachedRecord::local(&key, payload.clone())).await?;
            self.ctx
                .queue
                .enqueue(MutationOp::new(&key, OpKind::Create, payload, None, 0))
                .await?;
            self.ctx.publish_pending().await?;
        }

        debug!("Created {}", key);
        self.ctx.emit(RecordEvent::Changed(key.clone()));
        self.ctx.wake.notify_one();
        Ok(key.id)
    }

    /// Apply field changes locally and queue the diff.
    ///
    /// Unchanged fields are never sent. The diff is queued at once, so it
    /// survives a restart; the record is then held back from sending until
    /// the debounce window passes, and rapid edits merge into that one
    /// queued update.
    ///
    /// # Errors
    /// - `NotFound` if the record is absent or removed
    pub async fn update(
        &self,
        collection: &Collection,
        id: &str,
        fields: Payload,
    ) -> Result<CachedRecord> {
        let key = self.key(collection, id);

        let record = {
            let _gate = self.ctx.gate.lock().await;
            let current = self.live_record(&key).await?;

            let diff = diff_fields(&current.payload, &fields);
            if diff.is_empty() {
                return Ok(current);
            }

            let updated = self.ctx.store.patch(&key, &diff).await?;
            self.ctx
                .queue
                .enqueue(MutationOp::new(&key, OpKind::Update, diff, current.server_version, 0))
                .await?;
            self.ctx.holds.hold(&key)?;
            self.ctx.publish_pending().await?;
            updated
        };

        self.ctx.emit(RecordEvent::Changed(key));
        self.ctx.wake.notify_one();
        Ok(record)
    }

    /// Remove a record: tombstone it locally and queue the delete.
    ///
    /// Removing a record the server never saw leaves no trace and sends
    /// nothing.
    ///
    /// # Errors
    /// - `NotFound` if the record is absent or already removed
    pub async fn remove(&self, collection: &Collection, id: &str) -> Result<()> {
        let key = self.key(collection, id);

        let outcome = {
            let _gate = self.ctx.gate.lock().await;
            let mut record = self.live_record(&key).await?;
            self.ctx.holds.discard(&key)?;

            record.deleted = true;
            record.local_dirty = true;
            self.ctx.store.put(&record).await?;

            let outcome = self
                .ctx
                .queue
                .enqueue(MutationOp::new(&key, OpKind::Delete, Payload::new(), record.server_version, 0))
                .await?;
            if outcome == EnqueueOutcome::Cancelled {
                self.ctx.store.delete(&key).await?;
            }
            self.ctx.publish_pending().await?;
            outcome
        };

        debug!("Removed {} ({:?})", key, outcome);
        self.ctx.emit(RecordEvent::Removed(key));
        if outcome != EnqueueOutcome::Cancelled {
            self.ctx.wake.notify_one();
        }
        Ok(())
    }

    /// Cached record, hiding tombstones.
    pub async fn get(&self, collection: &Collection, id: &str) -> Result<Option<CachedRecord>> {
        let key = self.key(collection, id);
        Ok(self.ctx.store.get(&key).await?.filter(|r| !r.deleted))
    }

    /// Cached records of a collection, hiding tombstones.
    ///
    /// An empty collection that was never hydrated is refreshed once when
    /// online.
    pub async fn list(&self, collection: &Collection) -> Result<Vec<CachedRecord>> {
        let mut records = self.ctx.store.load_snapshot(collection).await?;

        if records.is_empty() && !self.is_hydrated(collection)? && self.ctx.network.is_online() {
            if let RefreshOutcome::Fresh { .. } = self.refresh(collection).await? {
                records = self.ctx.store.load_snapshot(collection).await?;
            }
        }

        Ok(records.into_iter().filter(|r| !r.deleted).collect())
    }

    /// Replace the cached collection with the server's copy.
    ///
    /// Records with pending local work are kept as they are. Offline, or
    /// when the fetch keeps failing in transit, the cache is left stale.
    pub async fn refresh(&self, collection: &Collection) -> Result<RefreshOutcome> {
        if !self.ctx.network.is_online() {
            return Ok(RefreshOutcome::Stale {
                reason: "offline".to_string(),
            });
        }

        let backend = self.ctx.backend.as_ref();
        let fetched = self
            .executor
            .execute(&format!("Fetch {}", collection), move || async move {
                backend.fetch_all(collection).await.map_err(Error::from)
            })
            .await;
        let server_records = match fetched {
            Ok(records) => records,
            Err(e) if e.is_transient() => {
                warn!("Refresh of {} failed, keeping cache: {}", collection, e);
                return Ok(RefreshOutcome::Stale {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let _gate = self.ctx.gate.lock().await;
        let pending: HashSet<String> = self
            .ctx
            .queue
            .all()
            .await?
            .into_iter()
            .filter(|op| &op.collection == collection)
            .map(|op| op.record_id)
            .collect();
        let local = self.ctx.store.load_snapshot(collection).await?;

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for record in local {
            if pending.contains(&record.id) {
                kept.push(record);
            } else {
                removed.push(record.key());
            }
        }

        let kept_ids: HashSet<String> = kept.iter().map(|r| r.id.clone()).collect();
        let mut records = kept;
        for server in server_records {
            if kept_ids.contains(&server.id) {
                continue;
            }
            let key = RecordKey::new(collection.clone(), server.id);
            records.push(CachedRecord::confirmed(&key, server.payload, server.server_version));
        }

        let count = records.len();
        let changed: Vec<RecordKey> = records.iter().map(|r| r.key()).collect();
        self.ctx.store.replace_collection(collection, records).await?;
        self.mark_hydrated(collection)?;

        for key in removed.into_iter().filter(|k| !changed.contains(k)) {
            self.ctx.emit(RecordEvent::Removed(key));
        }
        for key in changed {
            self.ctx.emit(RecordEvent::Changed(key));
        }

        info!("Refreshed {}: {} records", collection, count);
        Ok(RefreshOutcome::Fresh { records: count })
    }

    /// Release every held record for sending now.
    pub async fn flush(&self) -> Result<usize> {
        let released = {
            let _gate = self.ctx.gate.lock().await;
            self.ctx.holds.release_all()?
        };
        Ok(self.released(released.len()))
    }

    /// Release held records whose debounce window has elapsed.
    pub async fn flush_due(&self) -> Result<usize> {
        let released = {
            let _gate = self.ctx.gate.lock().await;
            self.ctx.holds.release_due()?
        };
        Ok(self.released(released.len()))
    }

    fn released(&self, count: usize) -> usize {
        if count > 0 {
            debug!("Released {} debounced records", count);
            self.ctx.wake.notify_one();
        }
        count
    }

    /// Forget hydration marks. Used when the store is purged.
    pub fn reset(&self) -> Result<()> {
        self.hydrated
            .lock()
            .map_err(|_| Error::Sync("Hydration set poisoned".to_string()))?
            .clear();
        Ok(())
    }

    async fn live_record(&self, key: &RecordKey) -> Result<CachedRecord> {
        self.ctx
            .store
            .get(key)
            .await?
            .filter(|r| !r.deleted)
            .ok_or_else(|| Error::NotFound(format!("Record {} not found", key)))
    }

    fn is_hydrated(&self, collection: &Collection) -> Result<bool> {
        Ok(self
            .hydrated
            .lock()
            .map_err(|_| Error::Sync("Hydration set poisoned".to_string()))?
            .contains(collection))
    }

    fn mark_hydrated(&self, collection: &Collection) -> Result<()> {
        self.hydrated
            .lock()
            .map_err(|_| Error::Sync("Hydration set poisoned".to_string()))?
            .insert(collection.clone());
        Ok(())
    }
}
