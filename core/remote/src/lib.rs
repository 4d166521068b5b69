//! Remote backend adapters for Larder.
//!
//! The sync engine talks to the relational backend only through the
//! `RemoteBackend` trait. Two adapters are provided:
//! - `MemoryBackend`: in-process reference server for tests and demos
//! - `HttpBackend`: JSON over HTTP

pub mod backend;
pub mod http;
pub mod memory;

pub use backend::{RemoteBackend, RemoteError, RemoteResult};
pub use http::HttpBackend;
pub use memory::{CallKind, MemoryBackend, RemoteCall};
