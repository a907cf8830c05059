use thiserror::Error;

use crate::memory::ElementKind;

/// Errors related to shared-memory views and layout packing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("view of {count} x {kind} at element offset {offset} overruns a {len}-byte allocation")]
    OutOfBounds {
        kind: ElementKind,
        offset: usize,
        count: usize,
        len: usize,
    },
    #[error("invalid element layout: {0}")]
    InvalidLayout(String),
    #[error("expected an address of {expected} elements, found {found}")]
    KindMismatch {
        expected: ElementKind,
        found: ElementKind,
    },
    #[error("atomic wait is not supported for {0} elements")]
    WaitNotSupported(ElementKind),
}

/// Errors related to blocking and async waits on synchronization primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A blocking wait was attempted on a thread that drives an async
    /// runtime. Use the `*_async` variant there instead.
    #[error("blocking wait is not allowed on an async runtime thread")]
    BlockingNotAllowed,
    #[error("background wait task failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors related to the (de)hydration registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid dehydration registration: {0}")]
    InvalidRegistration(String),
    #[error("duplicate dehydration key: {0}")]
    DuplicateKey(String),
    #[error("no dehydration entry for key: {0}")]
    UnknownKey(String),
    #[error("malformed {key} value: {reason}")]
    Malformed { key: String, reason: String },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors surfaced by the parent-side thread driver.
#[derive(Error, Debug, Clone)]
pub enum ThreadError {
    /// The API was used after `close()`/`kill()`.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The worker terminated; outstanding requests are rejected with this.
    #[error("thread stopped")]
    Stopped,
    /// The worker acknowledged a graceful close and no longer accepts work.
    #[error("thread is shutting down")]
    ShuttingDown,
    /// A system message matched no expected pattern (e.g. an acknowledgment
    /// with an unknown correlation id).
    #[error("invalid system event: {0}")]
    InvalidSystemEvent(String),
    /// A correlated rejection transported back from the worker.
    #[error("worker error: {0}")]
    Worker(ErrorInfo),
}

/// Errors related to spawning workers.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The worker's init handler failed; the worker has been terminated.
    #[error("worker initialization failed: {0}")]
    InitializationFailed(ErrorInfo),
    #[error("worker exited before completing initialization")]
    WorkerGone,
    #[error("failed to spawn worker thread: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the thread pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("no worker available after {attempts} attempts")]
    SchedulerExhausted { attempts: u32 },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
}

/// Errors from worker-context helpers invoked outside a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerOpError {
    #[error("not running on a weft worker thread")]
    NotInWorker,
}

/// The transported form of an error: what crosses the worker boundary when a
/// handler fails. `name`/`message`/`stack` mirror the origin; `cause` chains
/// one link per source error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// Flatten an `anyhow` chain into a linked cause list.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut chain = err.chain();
        // chain() always yields at least the top-level error
        let top = chain
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string());
        let mut info = ErrorInfo::new("Error", top);
        info.stack = Some(format!("{err:?}"));
        let mut tail = &mut info.cause;
        for source in chain {
            *tail = Some(Box::new(ErrorInfo::new("Error", source.to_string())));
            tail = &mut tail.as_mut().expect("just set").cause;
        }
        info
    }

    /// Recover a message from a panic payload (`&str` or `String`, else a
    /// placeholder).
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker handler panicked".to_string()
        };
        ErrorInfo::new("Panic", message)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<anyhow::Error> for ErrorInfo {
    fn from(err: anyhow::Error) -> Self {
        ErrorInfo::from_anyhow(&err)
    }
}
