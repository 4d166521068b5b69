//! Remote backend trait definition.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use larder_common::{Collection, Payload, RemoteRecord};

/// Failure modes of a backend call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// Timeout, connection reset, 5xx. The call may be retried.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The record changed server-side since the base version.
    ///
    /// `current` is the server's record, `None` if it no longer exists.
    #[error("Conflict: server holds a newer version")]
    Conflict { current: Option<RemoteRecord> },

    /// Malformed or out-of-range data. Retrying cannot succeed.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

impl From<RemoteError> for larder_common::Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(msg) => larder_common::Error::Transport(msg),
            RemoteError::Conflict { current } => larder_common::Error::Conflict(match current {
                Some(record) => format!(
                    "record {} is at server version {}",
                    record.id, record.server_version
                ),
                None => "record no longer exists on the server".to_string(),
            }),
            RemoteError::Rejected(msg) => larder_common::Error::Validation(msg),
        }
    }
}

/// Result type for backend calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Capability interface of the relational backend.
///
/// Every mutating call carries an idempotency key. Replaying a key returns
/// the outcome of the first application without applying the change again,
/// so a request retried after a lost acknowledgement is harmless.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Get the adapter name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Reachability check against the backend's base endpoint.
    async fn ping(&self) -> RemoteResult<()>;

    /// Create a record; the server assigns its id and first version.
    async fn create_record(
        &self,
        collection: &Collection,
        payload: &Payload,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord>;

    /// Apply changed fields to a record.
    ///
    /// # Errors
    /// - `Conflict` if `base_version` is set and differs from the server's
    ///   version, or the record no longer exists
    async fn update_record(
        &self,
        collection: &Collection,
        id: &str,
        changed_fields: &Payload,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord>;

    /// Delete a record. Deleting a record the server no longer has succeeds.
    ///
    /// # Errors
    /// - `Conflict` if `base_version` is set and differs from the server's
    ///   version
    async fn delete_record(
        &self,
        collection: &Collection,
        id: &str,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<()>;

    /// Every record of a collection.
    async fn fetch_all(&self, collection: &Collection) -> RemoteResult<Vec<RemoteRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_keeps_taxonomy() {
        let err: larder_common::Error = RemoteError::Transport("reset".to_string()).into();
        assert!(err.is_transient());

        let err: larder_common::Error = RemoteError::Rejected("bad unit".to_string()).into();
        assert!(matches!(err, larder_common::Error::Validation(_)));

        let err: larder_common::Error = RemoteError::Conflict { current: None }.into();
        assert!(matches!(err, larder_common::Error::Conflict(_)));
    }
}
