//! SQLite-backed local store for native targets.
//!
//! Keeps two tables: `cache` with the latest snapshot of every record and
//! `sync_queue` with the pending mutation log. Queue order is the
//! `created_seq` column, so it survives a process restart.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use larder_common::{merge_fields, Collection, Error, Payload, RecordKey, Result};

use crate::record::{CachedRecord, MutationOp, OpKind};
use crate::store::LocalStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    payload_blob TEXT NOT NULL,
    server_version INTEGER,
    dirty_flag INTEGER NOT NULL,
    deleted_flag INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS sync_queue (
    op_id TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    record_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    changed_fields_blob TEXT NOT NULL,
    base_version INTEGER,
    created_seq INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_seq ON sync_queue(created_seq);
"#;

const RECORD_COLUMNS: &str =
    "collection, id, payload_blob, server_version, dirty_flag, deleted_flag, last_error";

const OP_COLUMNS: &str = "op_id, collection, record_id, kind, changed_fields_blob, \
     base_version, created_seq, attempts, last_error";

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn to_sql_version(version: Option<u64>) -> Result<Option<i64>> {
    version
        .map(|v| {
            i64::try_from(v)
                .map_err(|_| Error::InvalidInput(format!("Version out of range: {}", v)))
        })
        .transpose()
}

/// Columns of a `cache` row before JSON decoding.
struct RecordRow {
    collection: String,
    id: String,
    payload_blob: String,
    server_version: Option<i64>,
    dirty: bool,
    deleted: bool,
    last_error: Option<String>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            payload_blob: row.get(2)?,
            server_version: row.get(3)?,
            dirty: row.get::<_, i32>(4)? != 0,
            deleted: row.get::<_, i32>(5)? != 0,
            last_error: row.get(6)?,
        })
    }

    fn decode(self) -> Result<CachedRecord> {
        Ok(CachedRecord {
            collection: Collection::new(self.collection)?,
            id: self.id,
            payload: serde_json::from_str(&self.payload_blob)?,
            server_version: self.server_version.map(|v| v as u64),
            local_dirty: self.dirty,
            deleted: self.deleted,
            last_error: self.last_error,
        })
    }
}

/// Columns of a `sync_queue` row before decoding.
struct OpRow {
    op_id: String,
    collection: String,
    record_id: String,
    kind: String,
    changed_fields_blob: String,
    base_version: Option<i64>,
    created_seq: i64,
    attempts: i64,
    last_error: Option<String>,
}

impl OpRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            op_id: row.get(0)?,
            collection: row.get(1)?,
            record_id: row.get(2)?,
            kind: row.get(3)?,
            changed_fields_blob: row.get(4)?,
            base_version: row.get(5)?,
            created_seq: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn decode(self) -> Result<MutationOp> {
        Ok(MutationOp {
            op_id: Uuid::parse_str(&self.op_id)
                .map_err(|e| Error::Serialization(format!("Bad op id {}: {}", self.op_id, e)))?,
            collection: Collection::new(self.collection)?,
            record_id: self.record_id,
            kind: self.kind.parse::<OpKind>()?,
            changed_fields: serde_json::from_str(&self.changed_fields_blob)?,
            base_version: self.base_version.map(|v| v as u64),
            created_seq: self.created_seq as u64,
            attempts: self.attempts as u32,
            last_error: self.last_error,
        })
    }
}

fn insert_record(conn: &Connection, record: &CachedRecord) -> Result<()> {
    let payload_blob = serde_json::to_string(&record.payload)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO cache
        (collection, id, payload_blob, server_version, dirty_flag, deleted_flag, last_error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            record.collection.as_str(),
            record.id,
            payload_blob,
            to_sql_version(record.server_version)?,
            record.local_dirty as i32,
            record.deleted as i32,
            record.last_error,
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn select_record(conn: &Connection, key: &RecordKey) -> Result<Option<CachedRecord>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM cache WHERE collection = ?1 AND id = ?2",
                RECORD_COLUMNS
            ),
            params![key.collection.as_str(), key.id],
            RecordRow::from_row,
        )
        .optional()
        .map_err(storage_err)?;

    row.map(RecordRow::decode).transpose()
}

/// Local store using SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        let store = Self::init(conn)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<CachedRecord>> {
        let conn = self.lock()?;
        select_record(&conn, key)
    }

    async fn put(&self, record: &CachedRecord) -> Result<()> {
        debug!("Upserting record: {}", record.key());
        let conn = self.lock()?;
        insert_record(&conn, record)
    }

    async fn patch(&self, key: &RecordKey, changed_fields: &Payload) -> Result<CachedRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let mut record = select_record(&tx, key)?
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", key)))?;
        merge_fields(&mut record.payload, changed_fields);
        record.local_dirty = true;
        insert_record(&tx, &record)?;

        tx.commit().map_err(storage_err)?;
        Ok(record)
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        debug!("Deleting record: {}", key);
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM cache WHERE collection = ?1 AND id = ?2",
            params![key.collection.as_str(), key.id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn load_snapshot(&self, collection: &Collection) -> Result<Vec<CachedRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM cache WHERE collection = ?1 ORDER BY id",
                RECORD_COLUMNS
            ))
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([collection.as_str()], RecordRow::from_row)
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(storage_err)?.decode()?);
        }
        Ok(records)
    }

    async fn replace_collection(
        &self,
        collection: &Collection,
        records: Vec<CachedRecord>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        tx.execute(
            "DELETE FROM cache WHERE collection = ?1",
            [collection.as_str()],
        )
        .map_err(storage_err)?;

        for record in &records {
            if &record.collection != collection {
                return Err(Error::InvalidInput(format!(
                    "Record {} does not belong to {}",
                    record.key(),
                    collection
                )));
            }
            insert_record(&tx, record)?;
        }

        tx.commit().map_err(storage_err)?;
        info!("Replaced {} snapshot with {} records", collection, records.len());
        Ok(())
    }

    async fn list_queue(&self) -> Result<Vec<MutationOp>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_queue ORDER BY created_seq",
                OP_COLUMNS
            ))
            .map_err(storage_err)?;

        let rows = stmt.query_map([], OpRow::from_row).map_err(storage_err)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row.map_err(storage_err)?.decode()?);
        }
        Ok(ops)
    }

    async fn enqueue(&self, op: &MutationOp) -> Result<()> {
        debug!("Persisting {} op {} for {}", op.kind, op.op_id, op.key());
        let changed_fields_blob = serde_json::to_string(&op.changed_fields)?;
        let created_seq = i64::try_from(op.created_seq)
            .map_err(|_| Error::InvalidInput(format!("Sequence out of range: {}", op.created_seq)))?;

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_queue ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                OP_COLUMNS
            ),
            params![
                op.op_id.to_string(),
                op.collection.as_str(),
                op.record_id,
                op.kind.as_str(),
                changed_fields_blob,
                to_sql_version(op.base_version)?,
                created_seq,
                op.attempts as i64,
                op.last_error,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn dequeue(&self, op_id: &Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_queue WHERE op_id = ?1",
            [op_id.to_string()],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        info!("Purging local store");
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM cache; DELETE FROM sync_queue;")
            .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(Collection::new("ingredients").unwrap(), id)
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_record_operations() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = CachedRecord::confirmed(&key("42"), payload(json!({"stockQty": 3})), 2);
        record.last_error = Some("price must be positive".to_string());

        store.put(&record).await.unwrap();
        assert_eq!(store.get(&key("42")).await.unwrap(), Some(record));

        let patched = store
            .patch(&key("42"), &payload(json!({"stockQty": 5})))
            .await
            .unwrap();
        assert!(patched.local_dirty);
        assert_eq!(patched.payload["stockQty"], json!(5));
        assert_eq!(patched.server_version, Some(2));

        store.delete(&key("42")).await.unwrap();
        assert!(store.get(&key("42")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_and_unversioned_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = CachedRecord::local(&key("tmp-1"), payload(json!({"name": "Yeast"})));
        record.deleted = true;

        store.put(&record).await.unwrap();
        let loaded = store.get(&key("tmp-1")).await.unwrap().unwrap();
        assert!(loaded.deleted);
        assert!(loaded.server_version.is_none());
    }

    #[tokio::test]
    async fn test_load_snapshot_filters_collection() {
        let store = SqliteStore::in_memory().unwrap();
        let recipe = RecordKey::new(Collection::new("recipes").unwrap(), "r1");
        store
            .put(&CachedRecord::confirmed(&key("b"), Payload::new(), 1))
            .await
            .unwrap();
        store
            .put(&CachedRecord::confirmed(&key("a"), Payload::new(), 1))
            .await
            .unwrap();
        store
            .put(&CachedRecord::confirmed(&recipe, Payload::new(), 1))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .load_snapshot(&key("a").collection)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_queue_order_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("cache.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            let second = MutationOp::new(
                &key("42"),
                OpKind::Update,
                payload(json!({"stockQty": 5})),
                Some(1),
                11,
            );
            let first = MutationOp::new(&key("7"), OpKind::Delete, Payload::new(), Some(3), 10);
            store.enqueue(&second).await.unwrap();
            store.enqueue(&first).await.unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let ops = store.list_queue().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].record_id, "7");
        assert_eq!(ops[0].kind, OpKind::Delete);
        assert_eq!(ops[1].changed_fields, payload(json!({"stockQty": 5})));
        assert_eq!(ops[1].base_version, Some(1));
    }

    #[tokio::test]
    async fn test_enqueue_replaces_same_op_id() {
        let store = SqliteStore::in_memory().unwrap();
        let mut op = MutationOp::new(&key("1"), OpKind::Update, Payload::new(), Some(1), 1);
        store.enqueue(&op).await.unwrap();

        op.attempts = 2;
        op.last_error = Some("timeout".to_string());
        store.enqueue(&op).await.unwrap();

        let ops = store.list_queue().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].attempts, 2);

        store.dequeue(&op.op_id).await.unwrap();
        assert!(store.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_clears_everything() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put(&CachedRecord::confirmed(&key("1"), Payload::new(), 1))
            .await
            .unwrap();
        store
            .enqueue(&MutationOp::new(&key("1"), OpKind::Delete, Payload::new(), Some(1), 1))
            .await
            .unwrap();

        store.purge().await.unwrap();
        assert!(store.get(&key("1")).await.unwrap().is_none());
        assert!(store.list_queue().await.unwrap().is_empty());
    }
}
