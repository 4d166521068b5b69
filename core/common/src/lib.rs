//! Common utilities and types shared across Larder modules.
//!
//! This module provides the error taxonomy and the record identity types that
//! the store, the remote adapters and the sync engine all agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{diff_fields, merge_fields, Collection, Payload, RecordKey, RemoteRecord};
