//! Worker-side handler slots.
//!
//! A worker installs up to six named handlers; the dispatcher looks up the
//! slot per incoming message and falls back where the dispatch rules say so
//! (missing work/share/transfer handlers fall back to the event handler).
//!
//! Slots are optional boxed closures rather than trait methods so a handler
//! can re-register slots while running; the dispatcher uses the
//! take/restore pair to make that safe.

use crate::value::Value;

/// Payload passed to the share handler.
#[derive(Debug, Clone)]
pub struct ShareNotice {
    /// The shared item.
    pub share: Value,
    /// Optional message that accompanied it.
    pub message: Option<Value>,
}

// Handlers are created on the worker thread and never leave it (the slot
// table is thread-local), so they may freely capture non-Send state.
pub type InitFn = Box<dyn FnMut(Value) -> anyhow::Result<()>>;
pub type WorkFn = Box<dyn FnMut(Value) -> anyhow::Result<Value>>;
pub type EventFn = Box<dyn FnMut(Value) -> anyhow::Result<()>>;
pub type ShareFn = Box<dyn FnMut(ShareNotice) -> anyhow::Result<()>>;
pub type TransferFn = Box<dyn FnMut(Value) -> anyhow::Result<()>>;
pub type CloseFn = Box<dyn FnMut() -> anyhow::Result<()>>;

/// The six handler slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Init,
    Work,
    Event,
    Share,
    Transfer,
    Close,
}

impl HandlerKind {
    pub const fn name(self) -> &'static str {
        match self {
            HandlerKind::Init => "init",
            HandlerKind::Work => "work",
            HandlerKind::Event => "event",
            HandlerKind::Share => "share",
            HandlerKind::Transfer => "transfer",
            HandlerKind::Close => "close",
        }
    }
}

/// A handler paired with the slot it installs into.
pub enum Handler {
    Init(InitFn),
    Work(WorkFn),
    Event(EventFn),
    Share(ShareFn),
    Transfer(TransferFn),
    Close(CloseFn),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Init(_) => HandlerKind::Init,
            Handler::Work(_) => HandlerKind::Work,
            Handler::Event(_) => HandlerKind::Event,
            Handler::Share(_) => HandlerKind::Share,
            Handler::Transfer(_) => HandlerKind::Transfer,
            Handler::Close(_) => HandlerKind::Close,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// The slot table for one worker.
#[derive(Default)]
pub struct Handlers {
    init: Option<InitFn>,
    work: Option<WorkFn>,
    event: Option<EventFn>,
    share: Option<ShareFn>,
    transfer: Option<TransferFn>,
    close: Option<CloseFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler; the most recent registration wins.
    pub fn install(&mut self, handler: Handler) {
        match handler {
            Handler::Init(f) => self.init = Some(f),
            Handler::Work(f) => self.work = Some(f),
            Handler::Event(f) => self.event = Some(f),
            Handler::Share(f) => self.share = Some(f),
            Handler::Transfer(f) => self.transfer = Some(f),
            Handler::Close(f) => self.close = Some(f),
        }
    }

    pub fn is_installed(&self, kind: HandlerKind) -> bool {
        match kind {
            HandlerKind::Init => self.init.is_some(),
            HandlerKind::Work => self.work.is_some(),
            HandlerKind::Event => self.event.is_some(),
            HandlerKind::Share => self.share.is_some(),
            HandlerKind::Transfer => self.transfer.is_some(),
            HandlerKind::Close => self.close.is_some(),
        }
    }

    // Take/restore pairs. The dispatcher takes the slot, invokes the closure
    // without holding any borrow of the table, then restores it unless the
    // handler installed a replacement meanwhile.

    pub fn take_init(&mut self) -> Option<InitFn> {
        self.init.take()
    }

    pub fn restore_init(&mut self, f: InitFn) {
        self.init.get_or_insert(f);
    }

    pub fn take_work(&mut self) -> Option<WorkFn> {
        self.work.take()
    }

    pub fn restore_work(&mut self, f: WorkFn) {
        self.work.get_or_insert(f);
    }

    pub fn take_event(&mut self) -> Option<EventFn> {
        self.event.take()
    }

    pub fn restore_event(&mut self, f: EventFn) {
        self.event.get_or_insert(f);
    }

    pub fn take_share(&mut self) -> Option<ShareFn> {
        self.share.take()
    }

    pub fn restore_share(&mut self, f: ShareFn) {
        self.share.get_or_insert(f);
    }

    pub fn take_transfer(&mut self) -> Option<TransferFn> {
        self.transfer.take()
    }

    pub fn restore_transfer(&mut self, f: TransferFn) {
        self.transfer.get_or_insert(f);
    }

    pub fn take_close(&mut self) -> Option<CloseFn> {
        self.close.take()
    }

    pub fn restore_close(&mut self, f: CloseFn) {
        self.close.get_or_insert(f);
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed = [
            HandlerKind::Init,
            HandlerKind::Work,
            HandlerKind::Event,
            HandlerKind::Share,
            HandlerKind::Transfer,
            HandlerKind::Close,
        ]
        .into_iter()
        .filter(|k| self.is_installed(*k))
        .map(HandlerKind::name)
        .collect::<Vec<_>>();
        f.debug_struct("Handlers").field("installed", &installed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_take() {
        let mut handlers = Handlers::new();
        assert!(!handlers.is_installed(HandlerKind::Work));

        handlers.install(Handler::Work(Box::new(|v| Ok(v))));
        assert!(handlers.is_installed(HandlerKind::Work));

        let f = handlers.take_work();
        assert!(f.is_some());
        assert!(!handlers.is_installed(HandlerKind::Work));

        handlers.restore_work(f.expect("taken above"));
        assert!(handlers.is_installed(HandlerKind::Work));
    }

    #[test]
    fn restore_keeps_replacement() {
        let mut handlers = Handlers::new();
        handlers.install(Handler::Event(Box::new(|_| Ok(()))));

        let original = handlers.take_event().expect("installed above");
        // A handler registered a replacement while the original was running.
        handlers.install(Handler::Event(Box::new(|_| anyhow::bail!("replaced"))));
        handlers.restore_event(original);

        let mut replacement = handlers.take_event().expect("still installed");
        assert!(replacement(Value::Null).is_err());
    }

    #[test]
    fn latest_registration_wins() {
        let mut handlers = Handlers::new();
        handlers.install(Handler::Work(Box::new(|_| Ok(Value::Int(1)))));
        handlers.install(Handler::Work(Box::new(|_| Ok(Value::Int(2)))));
        let mut f = handlers.take_work().expect("installed");
        assert_eq!(f(Value::Null).ok(), Some(Value::Int(2)));
    }
}
