//! Conflict resolution.
//!
//! Resolution is coarse and server-wins per record: the server's current
//! state replaces the local snapshot and every pending intention for that
//! record is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use larder_common::{RecordKey, RemoteRecord};
use larder_storage::{CachedRecord, MutationOp, OpKind};

/// Information about a detected conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Record the rejected op targeted.
    pub key: RecordKey,
    /// Kind of the rejected op.
    pub kind: OpKind,
    /// Version the op was based on.
    pub base_version: Option<u64>,
    /// Server's current record, `None` if it no longer exists.
    pub server: Option<RemoteRecord>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    /// Create conflict info from the rejected op and the server's state.
    pub fn from_op(op: &MutationOp, server: Option<RemoteRecord>) -> Self {
        Self {
            key: op.key(),
            kind: op.kind,
            base_version: op.base_version,
            server,
            detected_at: Utc::now(),
        }
    }

    /// Human-readable description stored as the record's last error.
    pub fn describe(&self) -> String {
        let base = self
            .base_version
            .map_or_else(|| "none".to_string(), |v| v.to_string());
        match &self.server {
            Some(server) => format!(
                "{} of {} based on version {} lost to server version {}",
                self.kind, self.key, base, server.server_version
            ),
            None => format!(
                "{} of {} based on version {} lost: record deleted on server",
                self.kind, self.key, base
            ),
        }
    }
}

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionResult {
    /// Replace the local snapshot with the server's record.
    UsedRemote(CachedRecord),
    /// The server no longer has the record; purge it locally.
    Purged,
}

/// Conflict resolver.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict: the server's state wins.
    pub fn resolve(&self, conflict: &ConflictInfo) -> ResolutionResult {
        match &conflict.server {
            Some(server) => {
                let mut record = CachedRecord::confirmed(
                    &conflict.key,
                    server.payload.clone(),
                    server.server_version,
                );
                record.last_error = Some(conflict.describe());
                ResolutionResult::UsedRemote(record)
            }
            None => ResolutionResult::Purged,
        }
    }
}
