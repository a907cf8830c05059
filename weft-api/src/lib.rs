//! # Weft Framework API
//!
//! Core vocabulary for the weft worker-thread framework: the structured
//! message value tree, the wire envelope of the request/response protocol,
//! worker handler slots, shared-memory handles and the error taxonomy.
//!
//! This crate is deliberately small and synchronous. The runtime (typed
//! addresses, synchronization primitives, the thread driver, the worker
//! dispatcher and the thread pool) lives in the `weft` crate.
//!
//! ## Module Organization
//!
//! - [`value`]: Structured message values and transport semantics
//! - [`memory`]: Shared allocations and element kinds
//! - [`envelope`]: System messages, correlation ids, thread identities
//! - [`handler`]: Worker handler slot table
//! - [`errors`]: Error types and the transported error form
//! - [`types`]: Common type definitions

pub mod envelope;
pub mod errors;
pub mod handler;
pub mod memory;
pub mod types;
pub mod value;

pub use envelope::{Envelope, ShareId, SystemMessage, ThreadId, TransferId, WorkId};
pub use errors::{
    CodecError, ErrorInfo, MemoryError, PoolError, SpawnError, SyncError, ThreadError,
    WorkerOpError,
};
pub use handler::{Handler, HandlerKind, Handlers, ShareNotice};
pub use memory::{ElementKind, Memory};
pub use types::{CloseCallback, ErrorCallback, EventCallback, TransferCallback};
pub use value::{Buffer, HydrateObject, Value};
