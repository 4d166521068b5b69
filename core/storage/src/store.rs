//! Local store trait definition.

use async_trait::async_trait;
use uuid::Uuid;

use larder_common::{Collection, Payload, RecordKey, Result};

use crate::record::{CachedRecord, MutationOp};

/// Durable on-device store for record snapshots and the mutation log.
///
/// Every call is atomic: two calls touching the same key never interleave at
/// the field level, and calls on one key take effect in call order.
/// Implementations report disk, quota and corruption failures as
/// `Error::Storage`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the engine name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get a record snapshot, including tombstones.
    async fn get(&self, key: &RecordKey) -> Result<Option<CachedRecord>>;

    /// Insert or fully replace a record snapshot.
    async fn put(&self, record: &CachedRecord) -> Result<()>;

    /// Merge `changed_fields` into an existing record and mark it dirty.
    ///
    /// # Errors
    /// - Record not found
    async fn patch(&self, key: &RecordKey, changed_fields: &Payload) -> Result<CachedRecord>;

    /// Remove a record snapshot. Removing an absent record is not an error.
    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// All snapshots of a collection, tombstones included, ordered by id.
    async fn load_snapshot(&self, collection: &Collection) -> Result<Vec<CachedRecord>>;

    /// Atomically replace every snapshot of a collection.
    async fn replace_collection(
        &self,
        collection: &Collection,
        records: Vec<CachedRecord>,
    ) -> Result<()>;

    /// Queued mutations ordered by `created_seq`.
    async fn list_queue(&self) -> Result<Vec<MutationOp>>;

    /// Insert a mutation, or replace the one with the same `op_id`.
    async fn enqueue(&self, op: &MutationOp) -> Result<()>;

    /// Remove a mutation. Removing an absent op is not an error.
    async fn dequeue(&self, op_id: &Uuid) -> Result<()>;

    /// Drop every snapshot and every queued mutation.
    async fn purge(&self) -> Result<()>;
}
