//! Worker-side message dispatcher.
//!
//! Each worker is one OS thread running a sequential dispatch loop over its
//! inbound link. The spawn script runs first, on this thread, with the
//! worker context installed; it registers handlers through the helpers below
//! ([`register_handler`], [`on_work`], ...). Handlers are free to use the
//! blocking synchronization primitives, since a worker thread carries no
//! async runtime.
//!
//! Every inbound payload is hydrated before dispatch and every outbound
//! payload is dehydrated before it is sent, so handlers only ever see live
//! values.
//!
//! ## Close paths
//!
//! - Parent-requested: a `Close` system message runs the graceful close.
//! - Self-requested: a handler calls [`close_worker`]; the close runs after
//!   that handler settles.
//! - Idle: when `close_when_idle` is configured, the loop receives with that
//!   window; a quiet window with nothing in flight runs the close. Any
//!   arriving message re-arms the window by construction.
//! - Kill: the parent drops the link; the loop exits without ceremony.
//!
//! The graceful close announces `Close` to the parent first (so scheduling
//! stops), drains in-flight work with a bounded poll, then runs the close
//! handler.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use weft_api::envelope::{Envelope, SystemMessage, ThreadId};
use weft_api::errors::{ErrorInfo, WorkerOpError};
use weft_api::handler::{Handler, Handlers, ShareNotice};
use weft_api::value::Value;

use crate::codec::{dehydrate, hydrate};

struct WorkerContext {
    id: ThreadId,
    to_parent: Sender<Envelope>,
    processing: Arc<AtomicUsize>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
    static HANDLERS: RefCell<Handlers> = RefCell::new(Handlers::new());
    static CLOSE_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

fn with_context<T>(f: impl FnOnce(&WorkerContext) -> T) -> Result<T, WorkerOpError> {
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .map(f)
            .ok_or(WorkerOpError::NotInWorker)
    })
}

/// Id of the current worker, when called on a worker thread.
pub(crate) fn current_context_id() -> Option<ThreadId> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|c| c.id.clone()))
}

/// The id of the worker this code runs on.
pub fn current_thread() -> Result<ThreadId, WorkerOpError> {
    with_context(|ctx| ctx.id.clone())
}

/// Number of messages currently being processed on this worker.
pub fn num_messages_processing() -> Result<usize, WorkerOpError> {
    with_context(|ctx| ctx.processing.load(Ordering::SeqCst))
}

/// Post a plain event to the parent; delivered to its event handler.
pub fn send_event(message: Value) -> Result<(), WorkerOpError> {
    with_context(|ctx| {
        let _ = ctx.to_parent.send(Envelope::Event(dehydrate(message)));
    })
}

/// Push a transfer to the parent. Buffers in `message` move with it.
pub fn transfer(message: Value) -> Result<(), WorkerOpError> {
    with_context(|ctx| {
        let _ = ctx.to_parent.send(Envelope::System(SystemMessage::Transfer {
            id: None,
            message: dehydrate(message),
        }));
    })
}

/// Report an uncorrelated error to the parent's error handler.
pub fn send_error(error: anyhow::Error) -> Result<(), WorkerOpError> {
    with_context(|ctx| {
        let _ = ctx.to_parent.send(Envelope::System(SystemMessage::Error {
            error: ErrorInfo::from_anyhow(&error),
        }));
    })
}

/// Request a graceful close of this worker; runs once the current handler
/// settles.
pub fn close_worker() -> Result<(), WorkerOpError> {
    with_context(|_| CLOSE_REQUESTED.with(|c| c.set(true)))
}

/// Install a handler into its slot; the most recent registration wins.
pub fn register_handler(handler: Handler) -> Result<(), WorkerOpError> {
    if CONTEXT.with(|ctx| ctx.borrow().is_none()) {
        return Err(WorkerOpError::NotInWorker);
    }
    HANDLERS.with(|h| h.borrow_mut().install(handler));
    Ok(())
}

pub fn on_init(f: impl FnMut(Value) -> anyhow::Result<()> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Init(Box::new(f)))
}

pub fn on_work(f: impl FnMut(Value) -> anyhow::Result<Value> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Work(Box::new(f)))
}

pub fn on_event(f: impl FnMut(Value) -> anyhow::Result<()> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Event(Box::new(f)))
}

pub fn on_share(f: impl FnMut(ShareNotice) -> anyhow::Result<()> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Share(Box::new(f)))
}

pub fn on_transfer(f: impl FnMut(Value) -> anyhow::Result<()> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Transfer(Box::new(f)))
}

pub fn on_close(f: impl FnMut() -> anyhow::Result<()> + 'static) -> Result<(), WorkerOpError> {
    register_handler(Handler::Close(Box::new(f)))
}

enum Flow {
    Continue,
    CloseGracefully,
    Exit,
}

/// Entry point of every worker OS thread.
pub(crate) fn worker_main(
    id: ThreadId,
    script: Box<dyn FnOnce() + Send>,
    to_parent: Sender<Envelope>,
    from_parent: Receiver<Envelope>,
) {
    let processing = Arc::new(AtomicUsize::new(0));
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(WorkerContext {
            id: id.clone(),
            to_parent: to_parent.clone(),
            processing: processing.clone(),
        });
    });
    debug!(thread = %id, "worker started");

    script();

    let mut close_when_idle: Option<Duration> = None;
    loop {
        let envelope = match close_when_idle {
            Some(window) => match from_parent.recv_timeout(window) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => {
                    if processing.load(Ordering::SeqCst) == 0 {
                        debug!(thread = %id, "idle window elapsed, closing");
                        run_close(&to_parent, &processing);
                        break;
                    }
                    continue;
                }
                // Killed: the parent dropped the link
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match from_parent.recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
        };

        processing.fetch_add(1, Ordering::SeqCst);
        let flow = dispatch(envelope, &to_parent, &mut close_when_idle);
        processing.fetch_sub(1, Ordering::SeqCst);

        let self_close = CLOSE_REQUESTED.with(|c| c.replace(false));
        match flow {
            Flow::Continue if self_close => {
                run_close(&to_parent, &processing);
                break;
            }
            Flow::Continue => {}
            Flow::CloseGracefully => {
                run_close(&to_parent, &processing);
                break;
            }
            Flow::Exit => break,
        }
    }

    CONTEXT.with(|ctx| ctx.borrow_mut().take());
    debug!(thread = %id, "worker exited");
}

fn dispatch(
    envelope: Envelope,
    to_parent: &Sender<Envelope>,
    close_when_idle: &mut Option<Duration>,
) -> Flow {
    match envelope {
        Envelope::Event(raw) => {
            // Custom messages never produce a reply; failures surface as
            // uncorrelated errors
            if let Err(error) = run_catch(|| call_event(hydrate(raw))) {
                let _ = to_parent.send(Envelope::System(SystemMessage::Error { error }));
            }
            Flow::Continue
        }
        Envelope::System(message) => dispatch_system(message, to_parent, close_when_idle),
    }
}

fn dispatch_system(
    message: SystemMessage,
    to_parent: &Sender<Envelope>,
    close_when_idle: &mut Option<Duration>,
) -> Flow {
    match message {
        SystemMessage::Init {
            thread_id,
            init,
            close_when_idle: idle,
        } => {
            trace!(thread = %thread_id, "dispatching init");
            *close_when_idle = idle;
            let result = run_catch(|| call_init(hydrate(init)));
            let failed = result.is_err();
            let _ = to_parent.send(Envelope::System(SystemMessage::Initd { result }));
            if failed {
                // The parent terminates an uninitialized worker; exit now
                Flow::Exit
            } else {
                Flow::Continue
            }
        }
        SystemMessage::Work { id, work } => {
            let result = run_catch(|| call_work(hydrate(work))).map(dehydrate);
            let _ = to_parent.send(Envelope::System(SystemMessage::WorkDone { id, result }));
            Flow::Continue
        }
        SystemMessage::Share { id, share, message } => {
            let result = run_catch(|| {
                call_share(ShareNotice {
                    share: hydrate(share),
                    message: message.map(hydrate),
                })
            });
            let _ = to_parent.send(Envelope::System(SystemMessage::Shared { id, result }));
            Flow::Continue
        }
        SystemMessage::Transfer { id, message } => {
            let result = run_catch(|| call_transfer(hydrate(message)));
            match (id, result) {
                (Some(id), result) => {
                    let _ = to_parent
                        .send(Envelope::System(SystemMessage::Transferred { id, result }));
                }
                (None, Err(error)) => {
                    let _ = to_parent.send(Envelope::System(SystemMessage::Error { error }));
                }
                (None, Ok(())) => {}
            }
            Flow::Continue
        }
        SystemMessage::Close => Flow::CloseGracefully,
        other => {
            warn!(?other, "system message not valid for a worker");
            let _ = to_parent.send(Envelope::System(SystemMessage::Error {
                error: ErrorInfo::new("InvalidSystemEvent", format!("{other:?}")),
            }));
            Flow::Continue
        }
    }
}

fn run_close(to_parent: &Sender<Envelope>, processing: &AtomicUsize) {
    // Announce first so the parent stops scheduling onto this worker
    let _ = to_parent.send(Envelope::System(SystemMessage::Close));
    std::thread::sleep(Duration::from_millis(1));

    // Bounded drain of in-flight work
    let mut polls = 10;
    while processing.load(Ordering::SeqCst) > 0 && polls > 0 {
        std::thread::sleep(Duration::from_millis(100));
        polls -= 1;
    }
    if processing.load(Ordering::SeqCst) > 0 {
        warn!("close proceeding with handlers still in flight");
    }

    if let Err(error) = run_catch(call_close) {
        let _ = to_parent.send(Envelope::System(SystemMessage::Error { error }));
    }
}

/// Run a handler body, converting both returned errors and panics into the
/// transported error form.
fn run_catch<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ErrorInfo::from_anyhow(&error)),
        Err(payload) => Err(ErrorInfo::from_panic(payload.as_ref())),
    }
}

fn call_init(init: Value) -> anyhow::Result<()> {
    match HANDLERS.with(|h| h.borrow_mut().take_init()) {
        Some(mut f) => {
            let result = f(init);
            HANDLERS.with(|h| h.borrow_mut().restore_init(f));
            result
        }
        None => Ok(()),
    }
}

fn call_work(work: Value) -> anyhow::Result<Value> {
    match HANDLERS.with(|h| h.borrow_mut().take_work()) {
        Some(mut f) => {
            let result = f(work);
            HANDLERS.with(|h| h.borrow_mut().restore_work(f));
            result
        }
        // No work handler: the event handler sees the payload, the reply
        // carries a null result
        None => call_event(work).map(|_| Value::Null),
    }
}

fn call_event(event: Value) -> anyhow::Result<()> {
    match HANDLERS.with(|h| h.borrow_mut().take_event()) {
        Some(mut f) => {
            let result = f(event);
            HANDLERS.with(|h| h.borrow_mut().restore_event(f));
            result
        }
        None => {
            trace!("no event handler installed, dropping message");
            Ok(())
        }
    }
}

fn call_share(notice: ShareNotice) -> anyhow::Result<()> {
    match HANDLERS.with(|h| h.borrow_mut().take_share()) {
        Some(mut f) => {
            let result = f(notice);
            HANDLERS.with(|h| h.borrow_mut().restore_share(f));
            result
        }
        None => call_event(notice.share),
    }
}

fn call_transfer(message: Value) -> anyhow::Result<()> {
    match HANDLERS.with(|h| h.borrow_mut().take_transfer()) {
        Some(mut f) => {
            let result = f(message);
            HANDLERS.with(|h| h.borrow_mut().restore_transfer(f));
            result
        }
        None => call_event(message),
    }
}

fn call_close() -> anyhow::Result<()> {
    match HANDLERS.with(|h| h.borrow_mut().take_close()) {
        Some(mut f) => {
            let result = f();
            HANDLERS.with(|h| h.borrow_mut().restore_close(f));
            result
        }
        None => Ok(()),
    }
}
