//! In-memory backend for testing and demos.
//!
//! Behaves like the relational backend the sync engine talks to: it assigns
//! ids and versions, enforces optimistic concurrency, deduplicates
//! idempotency keys, and can be told to fail in the ways a real network does.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use larder_common::{merge_fields, Collection, Payload, RemoteRecord};

use crate::backend::{RemoteBackend, RemoteError, RemoteResult};

/// Validation hook: `Err(reason)` rejects the payload.
pub type Validator = Box<dyn Fn(&Collection, &Payload) -> Result<(), String> + Send + Sync>;

/// Kind of a call received by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Ping,
    Create,
    Update,
    Delete,
    FetchAll,
}

/// A call as seen by the backend, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: CallKind,
    pub collection: Option<Collection>,
    pub record_id: Option<String>,
}

/// Outcome stored per idempotency key.
#[derive(Debug, Clone)]
enum Applied {
    Record(RemoteRecord),
    Deleted,
}

struct Inner {
    records: HashMap<Collection, BTreeMap<String, RemoteRecord>>,
    applied: HashMap<Uuid, Applied>,
    next_id: u64,
    calls: Vec<RemoteCall>,
    reachable: bool,
    /// Calls that fail before having any effect.
    fail_next: u32,
    /// Calls that take effect but lose their acknowledgement.
    drop_acks: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            applied: HashMap::new(),
            next_id: 1,
            calls: Vec::new(),
            reachable: true,
            fail_next: 0,
            drop_acks: 0,
        }
    }
}

impl Inner {
    fn log(&mut self, kind: CallKind, collection: Option<&Collection>, record_id: Option<&str>) {
        self.calls.push(RemoteCall {
            kind,
            collection: collection.cloned(),
            record_id: record_id.map(String::from),
        });
    }

    /// Gate applied before a call has any effect.
    fn admit(&mut self) -> RemoteResult<()> {
        if !self.reachable {
            return Err(RemoteError::Transport("backend unreachable".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RemoteError::Transport("injected failure".to_string()));
        }
        Ok(())
    }

    /// Gate applied after a call took effect.
    fn acknowledge<T>(&mut self, value: T) -> RemoteResult<T> {
        if self.drop_acks > 0 {
            self.drop_acks -= 1;
            return Err(RemoteError::Transport("acknowledgement lost".to_string()));
        }
        Ok(value)
    }

    fn current(&self, collection: &Collection, id: &str) -> Option<RemoteRecord> {
        self.records.get(collection).and_then(|c| c.get(id)).cloned()
    }
}

/// In-memory backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    validator: Arc<Mutex<Option<Validator>>>,
}

impl MemoryBackend {
    /// Create an empty, reachable backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RemoteResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| RemoteError::Transport("backend state poisoned".to_string()))
    }

    fn validate(&self, collection: &Collection, payload: &Payload) -> RemoteResult<()> {
        let validator = self
            .validator
            .lock()
            .map_err(|_| RemoteError::Transport("backend state poisoned".to_string()))?;
        match validator.as_ref() {
            Some(check) => check(collection, payload).map_err(RemoteError::Rejected),
            None => Ok(()),
        }
    }

    /// Install a validation hook.
    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&Collection, &Payload) -> Result<(), String> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.validator.lock() {
            *slot = Some(Box::new(validator));
        }
    }

    /// Make every call fail with a transport error (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reachable = reachable;
        }
    }

    /// Fail the next `count` calls before they take effect.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = count;
        }
    }

    /// Apply the next `count` mutating calls but report a transport failure.
    pub fn drop_next_acks(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.drop_acks = count;
        }
    }

    /// Store a record directly, as if written by another client.
    pub fn seed(&self, collection: &Collection, record: RemoteRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .records
                .entry(collection.clone())
                .or_default()
                .insert(record.id.clone(), record);
        }
    }

    /// Edit a record as another client would, bumping its version.
    pub fn edit(&self, collection: &Collection, id: &str, changed_fields: &Payload) -> Option<RemoteRecord> {
        let mut inner = self.inner.lock().ok()?;
        let record = inner.records.get_mut(collection)?.get_mut(id)?;
        merge_fields(&mut record.payload, changed_fields);
        record.server_version += 1;
        Some(record.clone())
    }

    /// Current server copy of a record.
    pub fn record(&self, collection: &Collection, id: &str) -> Option<RemoteRecord> {
        self.inner.lock().ok()?.current(collection, id)
    }

    /// Every server record of a collection, ordered by id.
    pub fn records(&self, collection: &Collection) -> Vec<RemoteRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(collection).cloned())
            .map(|c| c.into_values().collect())
            .unwrap_or_default()
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Calls that targeted one record (creates are logged under the id they produced).
    pub fn calls_for(&self, collection: &Collection, id: &str) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.collection.as_ref() == Some(collection) && c.record_id.as_deref() == Some(id))
            .collect()
    }

    /// Number of mutating calls received (create, update, delete).
    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c.kind, CallKind::Create | CallKind::Update | CallKind::Delete))
            .count()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> RemoteResult<()> {
        let mut inner = self.lock()?;
        inner.log(CallKind::Ping, None, None);
        if inner.reachable {
            Ok(())
        } else {
            Err(RemoteError::Transport("backend unreachable".to_string()))
        }
    }

    async fn create_record(
        &self,
        collection: &Collection,
        payload: &Payload,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord> {
        let mut inner = self.lock()?;

        if let Some(Applied::Record(record)) = inner.applied.get(&idempotency_key).cloned() {
            inner.log(CallKind::Create, Some(collection), Some(&record.id));
            inner.admit()?;
            debug!("Replayed create {} -> {}", idempotency_key, record.id);
            return Ok(record);
        }

        inner.log(CallKind::Create, Some(collection), None);
        inner.admit()?;
        self.validate(collection, payload)?;

        let id = inner.next_id.to_string();
        inner.next_id += 1;
        let record = RemoteRecord {
            id: id.clone(),
            server_version: 1,
            payload: payload.clone(),
        };

        inner
            .records
            .entry(collection.clone())
            .or_default()
            .insert(id.clone(), record.clone());
        inner
            .applied
            .insert(idempotency_key, Applied::Record(record.clone()));
        if let Some(last) = inner.calls.last_mut() {
            last.record_id = Some(id);
        }

        inner.acknowledge(record)
    }

    async fn update_record(
        &self,
        collection: &Collection,
        id: &str,
        changed_fields: &Payload,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord> {
        let mut inner = self.lock()?;
        inner.log(CallKind::Update, Some(collection), Some(id));
        inner.admit()?;

        if let Some(Applied::Record(record)) = inner.applied.get(&idempotency_key).cloned() {
            debug!("Replayed update {} on {}", idempotency_key, id);
            return Ok(record);
        }

        let current = inner.current(collection, id);
        let Some(mut record) = current else {
            return Err(RemoteError::Conflict { current: None });
        };
        if base_version.is_some_and(|base| base != record.server_version) {
            return Err(RemoteError::Conflict {
                current: Some(record),
            });
        }

        merge_fields(&mut record.payload, changed_fields);
        self.validate(collection, &record.payload)?;
        record.server_version += 1;

        inner
            .records
            .entry(collection.clone())
            .or_default()
            .insert(id.to_string(), record.clone());
        inner
            .applied
            .insert(idempotency_key, Applied::Record(record.clone()));

        inner.acknowledge(record)
    }

    async fn delete_record(
        &self,
        collection: &Collection,
        id: &str,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        let mut inner = self.lock()?;
        inner.log(CallKind::Delete, Some(collection), Some(id));
        inner.admit()?;

        if let Some(Applied::Deleted) = inner.applied.get(&idempotency_key) {
            debug!("Replayed delete {} on {}", idempotency_key, id);
            return Ok(());
        }

        if let Some(record) = inner.current(collection, id) {
            if base_version.is_some_and(|base| base != record.server_version) {
                return Err(RemoteError::Conflict {
                    current: Some(record),
                });
            }
            if let Some(records) = inner.records.get_mut(collection) {
                records.remove(id);
            }
        }
        inner.applied.insert(idempotency_key, Applied::Deleted);

        inner.acknowledge(())
    }

    async fn fetch_all(&self, collection: &Collection) -> RemoteResult<Vec<RemoteRecord>> {
        let mut inner = self.lock()?;
        inner.log(CallKind::FetchAll, Some(collection), None);
        inner.admit()?;

        Ok(inner
            .records
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
