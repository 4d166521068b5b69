//! In-memory local store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use larder_common::{merge_fields, Collection, Error, Payload, RecordKey, Result};

use crate::record::{CachedRecord, MutationOp};
use crate::store::LocalStore;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, CachedRecord>,
    queue: HashMap<Uuid, MutationOp>,
}

/// In-memory local store.
///
/// Useful for testing and for sessions that do not need to survive a
/// restart. All data is lost on drop.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<CachedRecord>> {
        Ok(self.read()?.records.get(key).cloned())
    }

    async fn put(&self, record: &CachedRecord) -> Result<()> {
        self.write()?.records.insert(record.key(), record.clone());
        Ok(())
    }

    async fn patch(&self, key: &RecordKey, changed_fields: &Payload) -> Result<CachedRecord> {
        let mut inner = self.write()?;
        let record = inner
            .records
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", key)))?;

        merge_fields(&mut record.payload, changed_fields);
        record.local_dirty = true;
        Ok(record.clone())
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.write()?.records.remove(key);
        Ok(())
    }

    async fn load_snapshot(&self, collection: &Collection) -> Result<Vec<CachedRecord>> {
        Ok(self
            .read()?
            .records
            .values()
            .filter(|r| &r.collection == collection)
            .cloned()
            .collect())
    }

    async fn replace_collection(
        &self,
        collection: &Collection,
        records: Vec<CachedRecord>,
    ) -> Result<()> {
        if let Some(stray) = records.iter().find(|r| &r.collection != collection) {
            return Err(Error::InvalidInput(format!(
                "Record {} does not belong to {}",
                stray.key(),
                collection
            )));
        }

        let mut inner = self.write()?;
        inner.records.retain(|key, _| &key.collection != collection);
        for record in records {
            inner.records.insert(record.key(), record);
        }
        Ok(())
    }

    async fn list_queue(&self) -> Result<Vec<MutationOp>> {
        let mut ops: Vec<MutationOp> = self.read()?.queue.values().cloned().collect();
        ops.sort_by_key(|op| op.created_seq);
        Ok(ops)
    }

    async fn enqueue(&self, op: &MutationOp) -> Result<()> {
        self.write()?.queue.insert(op.op_id, op.clone());
        Ok(())
    }

    async fn dequeue(&self, op_id: &Uuid) -> Result<()> {
        self.write()?.queue.remove(op_id);
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.records.clear();
        inner.queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OpKind;
    use serde_json::json;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(Collection::new("ingredients").unwrap(), id)
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryStore::new();
        let record = CachedRecord::confirmed(&key("1"), payload(json!({"name": "Salt"})), 3);

        store.put(&record).await.unwrap();
        assert_eq!(store.get(&key("1")).await.unwrap(), Some(record));
        assert!(store.get(&key("2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_merges_and_marks_dirty() {
        let store = MemoryStore::new();
        let record =
            CachedRecord::confirmed(&key("1"), payload(json!({"name": "Salt", "price": 2})), 1);
        store.put(&record).await.unwrap();

        let patched = store
            .patch(&key("1"), &payload(json!({"price": 3})))
            .await
            .unwrap();

        assert!(patched.local_dirty);
        assert_eq!(patched.payload, payload(json!({"name": "Salt", "price": 3})));
    }

    #[tokio::test]
    async fn test_patch_missing_record_fails() {
        let store = MemoryStore::new();
        let result = store.patch(&key("9"), &Payload::new()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_is_ordered_by_sequence() {
        let store = MemoryStore::new();
        let late = MutationOp::new(&key("1"), OpKind::Update, Payload::new(), Some(1), 7);
        let early = MutationOp::new(&key("2"), OpKind::Create, Payload::new(), None, 2);

        store.enqueue(&late).await.unwrap();
        store.enqueue(&early).await.unwrap();

        let seqs: Vec<u64> = store
            .list_queue()
            .await
            .unwrap()
            .iter()
            .map(|op| op.created_seq)
            .collect();
        assert_eq!(seqs, vec![2, 7]);

        store.dequeue(&early.op_id).await.unwrap();
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_collection_leaves_others() {
        let store = MemoryStore::new();
        let other = RecordKey::new(Collection::new("recipes").unwrap(), "r1");
        store
            .put(&CachedRecord::confirmed(&other, Payload::new(), 1))
            .await
            .unwrap();
        store
            .put(&CachedRecord::confirmed(&key("old"), Payload::new(), 1))
            .await
            .unwrap();

        store
            .replace_collection(
                &key("x").collection,
                vec![CachedRecord::confirmed(&key("new"), Payload::new(), 5)],
            )
            .await
            .unwrap();

        assert!(store.get(&key("old")).await.unwrap().is_none());
        assert!(store.get(&key("new")).await.unwrap().is_some());
        assert!(store.get(&other).await.unwrap().is_some());
    }
}
