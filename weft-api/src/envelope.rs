//! Wire protocol between a parent thread and its worker.
//!
//! The raw message-passing layer carries [`Envelope`]s in both directions.
//! [`Envelope::Event`] is a user message delivered verbatim to the event
//! handler; [`Envelope::System`] is consumed by the protocol engine. The
//! system subtypes are disjoint by construction, so classification is a
//! single `match` instead of a field-pattern table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::errors::ErrorInfo;
use crate::value::Value;

macro_rules! correlation_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

correlation_id!(
    /// Correlates a work request with its result.
    WorkId
);
correlation_id!(
    /// Correlates a share with its acknowledgment.
    ShareId
);
correlation_id!(
    /// Correlates a parent-initiated transfer with its acknowledgment.
    TransferId
);

/// Hierarchical thread identity: the root context is `main`, children are
/// `parent→n` with `n` allocated per parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(Arc<str>);

impl ThreadId {
    pub fn root() -> Self {
        Self(Arc::from("main"))
    }

    /// The id of this context's `n`-th child.
    pub fn child(&self, n: u64) -> Self {
        Self(Arc::from(format!("{}→{}", self.0, n)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Control messages consumed by the protocol engine.
#[derive(Debug, Clone)]
pub enum SystemMessage {
    /// Parent → worker, always the first message. The spawn call resolves
    /// only once the matching [`SystemMessage::Initd`] arrives.
    Init {
        thread_id: ThreadId,
        init: Value,
        close_when_idle: Option<Duration>,
    },
    /// Worker → parent: init handler finished (or failed, in which case the
    /// worker is terminated).
    Initd { result: Result<(), ErrorInfo> },
    /// Parent → worker: correlated work request.
    Work { id: WorkId, work: Value },
    /// Worker → parent: result or rejection for a work request.
    WorkDone {
        id: WorkId,
        result: Result<Value, ErrorInfo>,
    },
    /// Parent → worker: hand the worker a resource; acknowledged after the
    /// share handler completes, which makes the acknowledgment a
    /// happens-before barrier for subsequent use of the item.
    Share {
        id: ShareId,
        share: Value,
        message: Option<Value>,
    },
    /// Worker → parent: share acknowledgment.
    Shared {
        id: ShareId,
        result: Result<(), ErrorInfo>,
    },
    /// A transfer. `id: Some(_)` is parent-initiated and acknowledged;
    /// `id: None` is the worker's unsolicited push, routed to the parent's
    /// transfer handler.
    Transfer {
        id: Option<TransferId>,
        message: Value,
    },
    /// Worker → parent: transfer acknowledgment.
    Transferred {
        id: TransferId,
        result: Result<(), ErrorInfo>,
    },
    /// Graceful close. Parent → worker requests it; worker → parent announces
    /// it (also sent when the worker closes itself or idles out).
    Close,
    /// Worker → parent: an error with no correlated request.
    Error { error: ErrorInfo },
}

/// One message on the parent↔worker link.
#[derive(Debug, Clone)]
pub enum Envelope {
    System(SystemMessage),
    Event(Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = WorkId::new();
        let b = WorkId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn thread_ids_nest() {
        let root = ThreadId::root();
        assert_eq!(root.as_str(), "main");
        let child = root.child(1);
        let grandchild = child.child(3);
        assert_eq!(child.as_str(), "main→1");
        assert_eq!(grandchild.as_str(), "main→1→3");
    }
}
