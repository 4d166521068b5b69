//! Local persistent store for Larder.
//!
//! This module provides the on-device cache of domain records and the durable
//! log of mutations that have not been confirmed by the backend yet.
//!
//! # Design Principles
//! - Engine isolation: the sync engine only sees the `LocalStore` trait
//! - Atomic calls: each call is linearizable per `(collection, id)`
//! - Unified error semantics: every engine failure maps to `Error::Storage`

pub mod memory;
pub mod record;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use record::{CachedRecord, MutationOp, OpKind};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::LocalStore;
