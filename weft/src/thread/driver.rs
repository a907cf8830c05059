//! Parent-side thread driver.
//!
//! A [`Thread`] owns the protocol state for one worker: the outbound link,
//! the pending-request map keyed by correlation id, the user callbacks, and
//! the lifecycle flags. A router task drains the inbound link, hydrates
//! every payload, and classifies system messages: acknowledgments resolve
//! their pending entry, unsolicited messages route to the installed
//! callbacks, and anything unclassifiable surfaces through the error
//! callback.
//!
//! Handles are cheap clones over shared state; any clone may send work or
//! close the thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use flume::{Receiver, Sender};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error};

use weft_api::envelope::{Envelope, ShareId, SystemMessage, ThreadId, TransferId, WorkId};
use weft_api::errors::{ErrorInfo, SpawnError, ThreadError};
use weft_api::types::{CloseCallback, ErrorCallback, EventCallback, TransferCallback};
use weft_api::value::Value;

use super::{ident, worker};
use crate::codec::{dehydrate, hydrate};

/// Options accepted by [`Thread::spawn`].
#[derive(Default)]
pub struct SpawnOptions {
    /// Payload handed to the worker's init handler.
    pub init_data: Value,
    /// When set, the worker closes itself after this long without traffic.
    pub close_when_idle: Option<Duration>,
    /// Receives non-system messages and unrouted transfers.
    pub on_event: Option<EventCallback>,
    /// Receives unsolicited transfers pushed by the worker.
    pub on_transfer: Option<TransferCallback>,
    /// Receives uncorrelated worker errors; they are logged when unset.
    pub on_error: Option<ErrorCallback>,
    /// Runs once when the worker stops for any reason.
    pub on_close: Option<CloseCallback>,
}

impl std::fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("init_data", &self.init_data)
            .field("close_when_idle", &self.close_when_idle)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Callbacks {
    on_event: Option<EventCallback>,
    on_transfer: Option<TransferCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

#[derive(Default)]
struct Pending {
    init: Option<oneshot::Sender<Result<(), ErrorInfo>>>,
    work: HashMap<WorkId, oneshot::Sender<Result<Value, ThreadError>>>,
    shares: HashMap<ShareId, oneshot::Sender<Result<(), ThreadError>>>,
    transfers: HashMap<TransferId, oneshot::Sender<Result<(), ThreadError>>>,
}

struct ThreadShared {
    id: ThreadId,
    /// Outbound link; dropped on kill so a parked worker loop disconnects.
    link: StdMutex<Option<Sender<Envelope>>>,
    pending: StdMutex<Pending>,
    /// Outstanding sends plus pool claims.
    pending_count: AtomicUsize,
    /// The user closed or killed this handle; the API rejects further use.
    closed: AtomicBool,
    /// The worker is gone; outstanding and future requests reject.
    stopped: AtomicBool,
    /// The stop was a graceful close announced by the worker.
    graceful: AtomicBool,
    callbacks: StdMutex<Callbacks>,
    /// Wakes `wait_exit` callers once the worker stops.
    exit: Notify,
    os_thread: std::thread::Thread,
}

impl ThreadShared {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to one spawned worker.
#[derive(Clone)]
pub struct Thread {
    shared: Arc<ThreadShared>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.shared.id)
            .field("pending", &self.num_pending_requests())
            .field("stopped", &self.shared.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Thread {
    /// Spawn a worker and resolve once its init handler has completed.
    ///
    /// `script` runs first on the new worker thread with the worker context
    /// installed; it registers handlers via `weft::worker::*`. When the init
    /// handler fails, the worker is terminated and spawn fails with
    /// [`SpawnError::InitializationFailed`].
    pub async fn spawn(
        script: impl FnOnce() + Send + 'static,
        opts: SpawnOptions,
    ) -> Result<Thread, SpawnError> {
        let id = ident::next_child(&ident::current_context());
        let (to_worker_tx, to_worker_rx) = flume::unbounded();
        let (to_parent_tx, to_parent_rx) = flume::unbounded();

        let worker_id = id.clone();
        let script: Box<dyn FnOnce() + Send> = Box::new(script);
        let join = std::thread::Builder::new()
            .name(format!("weft-{id}"))
            .spawn(move || worker::worker_main(worker_id, script, to_parent_tx, to_worker_rx))?;

        let shared = Arc::new(ThreadShared {
            id: id.clone(),
            link: StdMutex::new(Some(to_worker_tx)),
            pending: StdMutex::new(Pending::default()),
            pending_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            callbacks: StdMutex::new(Callbacks {
                on_event: opts.on_event,
                on_transfer: opts.on_transfer,
                on_error: opts.on_error,
                on_close: opts.on_close,
            }),
            exit: Notify::new(),
            os_thread: join.thread().clone(),
        });
        let thread = Thread { shared };

        let (init_tx, init_rx) = oneshot::channel();
        thread.shared.lock_pending().init = Some(init_tx);

        tokio::spawn(router(thread.shared.clone(), to_parent_rx));

        thread
            .post(Envelope::System(SystemMessage::Init {
                thread_id: id,
                init: dehydrate(opts.init_data),
                close_when_idle: opts.close_when_idle,
            }))
            .map_err(|_| SpawnError::WorkerGone)?;

        match init_rx.await {
            Ok(Ok(())) => {
                debug!(thread = %thread.shared.id, "worker initialized");
                Ok(thread)
            }
            Ok(Err(info)) => {
                thread.kill();
                Err(SpawnError::InitializationFailed(info))
            }
            Err(_) => {
                thread.kill();
                Err(SpawnError::WorkerGone)
            }
        }
    }

    /// Hierarchical id of this thread.
    pub fn id(&self) -> &ThreadId {
        &self.shared.id
    }

    /// The underlying OS thread handle.
    pub fn raw(&self) -> &std::thread::Thread {
        &self.shared.os_thread
    }

    /// Outstanding requests plus pool claims; the default pool strategy
    /// reads this as the load signal.
    pub fn num_pending_requests(&self) -> usize {
        self.shared.pending_count.load(Ordering::SeqCst)
    }

    /// Pre-reserve capacity during asynchronous thread selection.
    pub fn pool_claim(&self) {
        self.shared.pending_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pool_release(&self) {
        self.shared.pending_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether the worker has stopped (closed, idled out, or killed).
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the worker has stopped for any reason. Returns
    /// immediately when it already has.
    pub async fn wait_exit(&self) {
        let notified = self.shared.exit.notified();
        tokio::pin!(notified);
        // Register interest before the flag check so a concurrent stop
        // cannot slip between them
        notified.as_mut().enable();
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub fn set_on_event(&self, callback: EventCallback) {
        self.shared.lock_callbacks().on_event = Some(callback);
    }

    pub fn set_on_transfer(&self, callback: TransferCallback) {
        self.shared.lock_callbacks().on_transfer = Some(callback);
    }

    pub fn set_on_error(&self, callback: ErrorCallback) {
        self.shared.lock_callbacks().on_error = Some(callback);
    }

    /// Install the close callback; runs immediately when the worker has
    /// already stopped.
    pub fn set_on_close(&self, callback: CloseCallback) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.shared.lock_callbacks().on_close = Some(callback);
        // The worker may have stopped between the check and the store; the
        // stopping side takes the callback before this re-check observes it
        if self.shared.stopped.load(Ordering::SeqCst) {
            if let Some(callback) = self.shared.lock_callbacks().on_close.take() {
                callback();
            }
        }
    }

    fn ensure_open(&self, op: &'static str) -> Result<(), ThreadError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ThreadError::InvalidOperation(op));
        }
        if self.shared.stopped.load(Ordering::SeqCst) {
            // A graceful close (worker-announced) and a forced stop reject
            // differently; pool dispatch retries on either
            return if self.shared.graceful.load(Ordering::SeqCst) {
                Err(ThreadError::ShuttingDown)
            } else {
                Err(ThreadError::Stopped)
            };
        }
        Ok(())
    }

    fn post(&self, envelope: Envelope) -> Result<(), ThreadError> {
        let link = self.shared.link.lock().unwrap_or_else(|e| e.into_inner());
        match link.as_ref() {
            Some(sender) => sender.send(envelope).map_err(|_| ThreadError::Stopped),
            None => Err(ThreadError::Stopped),
        }
    }

    /// Send a correlated work request and await its result.
    pub async fn send_work(&self, work: Value) -> Result<Value, ThreadError> {
        self.ensure_open("send_work after close")?;
        let id = WorkId::new();
        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().work.insert(id, tx);
        self.shared.pending_count.fetch_add(1, Ordering::SeqCst);

        let result = async {
            // The worker may have stopped between ensure_open and the insert
            // above; close_thread sets `stopped` before draining, so this
            // re-check guarantees the entry cannot be orphaned
            if self.shared.stopped.load(Ordering::SeqCst) {
                if let Some(tx) = self.shared.lock_pending().work.remove(&id) {
                    let _ = tx.send(Err(ThreadError::Stopped));
                }
            } else if let Err(e) = self.post(Envelope::System(SystemMessage::Work {
                id,
                work: dehydrate(work),
            })) {
                self.shared.lock_pending().work.remove(&id);
                return Err(e);
            }
            rx.await.unwrap_or(Err(ThreadError::Stopped))
        }
        .await;

        self.shared.pending_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Post a one-way event; no correlation, no reply.
    pub fn send_event(&self, event: Value) -> Result<(), ThreadError> {
        self.ensure_open("send_event after close")?;
        self.post(Envelope::Event(dehydrate(event)))
    }

    /// Hand `item` to the worker's share handler.
    ///
    /// Resolution is a happens-before barrier: the worker acknowledges only
    /// after its share handler completes, so the item is installed before
    /// any subsequent message that relies on it.
    pub async fn share(&self, item: Value, message: Option<Value>) -> Result<(), ThreadError> {
        self.ensure_open("share after close")?;
        let id = ShareId::new();
        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().shares.insert(id, tx);
        self.shared.pending_count.fetch_add(1, Ordering::SeqCst);

        let result = async {
            if self.shared.stopped.load(Ordering::SeqCst) {
                if let Some(tx) = self.shared.lock_pending().shares.remove(&id) {
                    let _ = tx.send(Err(ThreadError::Stopped));
                }
            } else if let Err(e) = self.post(Envelope::System(SystemMessage::Share {
                id,
                share: dehydrate(item),
                message: message.map(dehydrate),
            })) {
                self.shared.lock_pending().shares.remove(&id);
                return Err(e);
            }
            rx.await.unwrap_or(Err(ThreadError::Stopped))
        }
        .await;

        self.shared.pending_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Move `message` to the worker's transfer handler. Buffers inside the
    /// message travel by move; there is nothing left to detach here.
    pub async fn transfer(&self, message: Value) -> Result<(), ThreadError> {
        self.ensure_open("transfer after close")?;
        let id = TransferId::new();
        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().transfers.insert(id, tx);
        self.shared.pending_count.fetch_add(1, Ordering::SeqCst);

        let result = async {
            if self.shared.stopped.load(Ordering::SeqCst) {
                if let Some(tx) = self.shared.lock_pending().transfers.remove(&id) {
                    let _ = tx.send(Err(ThreadError::Stopped));
                }
            } else if let Err(e) = self.post(Envelope::System(SystemMessage::Transfer {
                id: Some(id),
                message: dehydrate(message),
            })) {
                self.shared.lock_pending().transfers.remove(&id);
                return Err(e);
            }
            rx.await.unwrap_or(Err(ThreadError::Stopped))
        }
        .await;

        self.shared.pending_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Request a graceful close. The handle rejects further API calls; the
    /// close callback runs once the worker confirms.
    pub fn close(&self) -> Result<(), ThreadError> {
        self.ensure_open("close after close")?;
        self.shared.closed.store(true, Ordering::SeqCst);
        self.post(Envelope::System(SystemMessage::Close))
    }

    /// Terminate immediately: reject everything outstanding, drop the link,
    /// run the close callback. A worker parked inside a blocking wait exits
    /// at its next dispatch point.
    pub fn kill(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        close_thread(&self.shared);
    }
}

/// Mark the thread stopped, reject all pending requests, fire the close
/// callback. Idempotent.
fn close_thread(shared: &Arc<ThreadShared>) {
    if shared.stopped.swap(true, Ordering::SeqCst) {
        return;
    }
    let (init, work, shares, transfers) = {
        let mut pending = shared.lock_pending();
        (
            pending.init.take(),
            std::mem::take(&mut pending.work),
            std::mem::take(&mut pending.shares),
            std::mem::take(&mut pending.transfers),
        )
    };
    if let Some(tx) = init {
        let _ = tx.send(Err(ErrorInfo::new(
            "ThreadStopped",
            "worker terminated before initialization completed",
        )));
    }
    for (_, tx) in work {
        let _ = tx.send(Err(ThreadError::Stopped));
    }
    for (_, tx) in shares {
        let _ = tx.send(Err(ThreadError::Stopped));
    }
    for (_, tx) in transfers {
        let _ = tx.send(Err(ThreadError::Stopped));
    }
    let on_close = shared.lock_callbacks().on_close.take();
    if let Some(callback) = on_close {
        callback();
    }
    shared.exit.notify_waiters();
}

fn route_error(shared: &Arc<ThreadShared>, error: ErrorInfo) {
    let callback = shared.lock_callbacks().on_error.clone();
    match callback {
        Some(callback) => callback(error),
        None => error!(thread = %shared.id, %error, "unhandled worker error"),
    }
}

fn invalid_system_event(shared: &Arc<ThreadShared>, context: String) {
    route_error(shared, ErrorInfo::new("InvalidSystemEvent", context));
}

/// Drains the inbound link, hydrates payloads, and classifies messages.
/// Runs until the worker's side of the link is gone.
async fn router(shared: Arc<ThreadShared>, from_worker: Receiver<Envelope>) {
    while let Ok(envelope) = from_worker.recv_async().await {
        match envelope {
            Envelope::Event(raw) => {
                let value = hydrate(raw);
                let callback = shared.lock_callbacks().on_event.clone();
                match callback {
                    Some(callback) => callback(value),
                    None => debug!(thread = %shared.id, "event with no handler installed"),
                }
            }
            Envelope::System(message) => match message {
                SystemMessage::Initd { result } => {
                    match shared.lock_pending().init.take() {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => invalid_system_event(
                            &shared,
                            "unexpected init acknowledgment".to_string(),
                        ),
                    }
                }
                SystemMessage::WorkDone { id, result } => {
                    match shared.lock_pending().work.remove(&id) {
                        Some(tx) => {
                            let _ =
                                tx.send(result.map(hydrate).map_err(ThreadError::Worker));
                        }
                        None => invalid_system_event(
                            &shared,
                            format!("result for unknown work {id}"),
                        ),
                    }
                }
                SystemMessage::Shared { id, result } => {
                    match shared.lock_pending().shares.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(result.map_err(ThreadError::Worker));
                        }
                        None => invalid_system_event(
                            &shared,
                            format!("acknowledgment for unknown share {id}"),
                        ),
                    }
                }
                SystemMessage::Transferred { id, result } => {
                    match shared.lock_pending().transfers.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(result.map_err(ThreadError::Worker));
                        }
                        None => invalid_system_event(
                            &shared,
                            format!("acknowledgment for unknown transfer {id}"),
                        ),
                    }
                }
                SystemMessage::Transfer { id: _, message } => {
                    let value = hydrate(message);
                    let (transfer_cb, event_cb) = {
                        let callbacks = shared.lock_callbacks();
                        (callbacks.on_transfer.clone(), callbacks.on_event.clone())
                    };
                    if let Some(callback) = transfer_cb {
                        callback(value);
                    } else if let Some(callback) = event_cb {
                        callback(value);
                    } else {
                        debug!(thread = %shared.id, "transfer with no handler installed");
                    }
                }
                SystemMessage::Error { error } => route_error(&shared, error),
                SystemMessage::Close => {
                    debug!(thread = %shared.id, "worker announced close");
                    shared.graceful.store(true, Ordering::SeqCst);
                    close_thread(&shared);
                }
                other @ (SystemMessage::Init { .. }
                | SystemMessage::Work { .. }
                | SystemMessage::Share { .. }) => {
                    invalid_system_event(&shared, format!("{other:?} sent by a worker"));
                }
            },
        }
    }
    // Link lost without a close announcement: same as stopped
    close_thread(&shared);
}
