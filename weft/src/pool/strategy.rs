//! Pluggable thread-selection strategies.

use crate::thread::Thread;

/// What the strategy decided for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Route to the live thread at this index.
    Pick(usize),
    /// Spawn a new thread and route to it (honored only while the pool is
    /// below capacity).
    Grow,
    /// Nothing suitable right now; the caller backs off and retries.
    Skip,
}

/// Chooses a thread for each unit of work.
///
/// Implementations see the dense array of live threads and whether the pool
/// may still grow. They are consulted under the pool's slot lock and must
/// not block.
pub trait SchedulerStrategy: Send + Sync {
    fn select(&self, threads: &[Thread], can_grow: bool) -> Selection;
}

/// Default strategy: least pending requests wins; grow when everyone is
/// busy and capacity remains.
#[derive(Debug, Default)]
pub struct LeastPending;

impl SchedulerStrategy for LeastPending {
    fn select(&self, threads: &[Thread], can_grow: bool) -> Selection {
        let Some((index, pending)) = threads
            .iter()
            .enumerate()
            .map(|(index, thread)| (index, thread.num_pending_requests()))
            .min_by_key(|(_, pending)| *pending)
        else {
            return if can_grow { Selection::Grow } else { Selection::Skip };
        };
        if pending > 0 && can_grow {
            Selection::Grow
        } else {
            Selection::Pick(index)
        }
    }
}
