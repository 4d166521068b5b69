//! Records and queued mutations as they are kept on the device.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use larder_common::{Collection, Error, Payload, RecordKey};

/// Latest known snapshot of a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    /// Collection the record belongs to.
    pub collection: Collection,
    /// Record id (server id, or a `tmp-` id until the create is confirmed).
    pub id: String,
    /// Full field map as the user currently sees it.
    pub payload: Payload,
    /// Last confirmed server version, `None` if never confirmed.
    pub server_version: Option<u64>,
    /// Payload differs from the last confirmed server state.
    pub local_dirty: bool,
    /// Tombstone: removed locally, delete not yet confirmed.
    pub deleted: bool,
    /// Last error reported by the backend for this record.
    pub last_error: Option<String>,
}

impl CachedRecord {
    /// A record created on this device and not yet known to the server.
    pub fn local(key: &RecordKey, payload: Payload) -> Self {
        Self {
            collection: key.collection.clone(),
            id: key.id.clone(),
            payload,
            server_version: None,
            local_dirty: true,
            deleted: false,
            last_error: None,
        }
    }

    /// A record matching confirmed server state.
    pub fn confirmed(key: &RecordKey, payload: Payload, server_version: u64) -> Self {
        Self {
            collection: key.collection.clone(),
            id: key.id.clone(),
            payload,
            server_version: Some(server_version),
            local_dirty: false,
            deleted: false,
            last_error: None,
        }
    }

    /// Key of this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.id.clone())
    }
}

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    /// Stable name used in the queue table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(Error::Serialization(format!("Unknown op kind: {}", other))),
        }
    }
}

/// A mutation applied locally but not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOp {
    /// Unique op id, also sent as the idempotency key.
    pub op_id: Uuid,
    pub collection: Collection,
    pub record_id: String,
    pub kind: OpKind,
    /// Fields to send (full payload for creates, empty for deletes).
    pub changed_fields: Payload,
    /// Server version the op was computed against.
    pub base_version: Option<u64>,
    /// Monotonic sequence number; queue order.
    pub created_seq: u64,
    /// Dispatch attempts that ended in a transport failure.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl MutationOp {
    /// Build a fresh op with a new id.
    pub fn new(
        key: &RecordKey,
        kind: OpKind,
        changed_fields: Payload,
        base_version: Option<u64>,
        created_seq: u64,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            collection: key.collection.clone(),
            record_id: key.id.clone(),
            kind,
            changed_fields,
            base_version,
            created_seq,
            attempts: 0,
            last_error: None,
        }
    }

    /// Key of the record this op touches.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.record_id.clone())
    }

    /// Whether this op was ever handed to the backend.
    pub fn was_attempted(&self) -> bool {
        self.attempts > 0
    }
}
