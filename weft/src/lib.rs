// Weft Worker-Thread Framework
//
// This crate provides the weft runtime: typed shared-memory addresses and
// the layout allocator, futex-backed synchronization primitives, the
// (de)hydration codec, the parent-side thread driver, the worker-side
// dispatcher, and the thread pool. The shared vocabulary (values, envelope,
// handler slots, errors) lives in `weft-api`.

pub mod codec;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod sync;
pub mod thread;

// Re-export commonly used types
pub use weft_api::{
    Buffer, CloseCallback, CodecError, ElementKind, ErrorCallback, ErrorInfo, EventCallback,
    Handler, HandlerKind, Handlers, HydrateObject, Memory, MemoryError, PoolError, ShareNotice,
    SpawnError, SyncError, ThreadError, ThreadId, TransferCallback, Value, WorkerOpError,
};

pub use codec::{dehydrate, hydrate, register_dehydration, Registration};
pub use memory::{allocate, Address, AnyAddress, LayoutItem, WaitOutcome};
pub use pool::{LeastPending, PoolConfig, PoolMetrics, SchedulerStrategy, Selection, ThreadPool};
pub use sync::{Barrier, ConditionVariable, Mutex, Semaphore, WaitGroup};
pub use thread::{SpawnOptions, Thread};

/// Worker-context helpers, usable only on worker threads.
pub use thread::worker;
