//! Shared-memory synchronization primitives.
//!
//! All five primitives keep their entire state in shared allocations, so any
//! worker holding a hydrated handle observes the same lock word, counter or
//! epoch. Wait-style methods take `timeout: Option<Duration>` (`None` waits
//! forever) and resolve to `true` on success, `false` on timeout. Blocking
//! variants refuse async runtime threads with
//! [`SyncError::BlockingNotAllowed`](weft_api::SyncError::BlockingNotAllowed);
//! the `*_async` variants run the same core on the blocking pool.
//!
//! Ownership bookkeeping (`has_lock`, `has_acquired`) is a per-OS-thread
//! set keyed by lock-word identity. It is local by design and never crosses
//! a worker boundary. The async variants acquire on a blocking-pool thread,
//! so that thread's set is the one that records the hold.

mod barrier;
mod condvar;
mod mutex;
mod semaphore;
mod wait_group;

pub use barrier::Barrier;
pub use condvar::ConditionVariable;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use wait_group::WaitGroup;

pub(crate) use barrier::hydrate_barrier;
pub(crate) use condvar::hydrate_condvar;
pub(crate) use mutex::hydrate_mutex;
pub(crate) use semaphore::hydrate_semaphore;
pub(crate) use wait_group::hydrate_wait_group;

use std::cell::RefCell;
use std::collections::HashSet;

thread_local! {
    /// Lock words this thread currently owns: (allocation id, byte offset).
    static HELD: RefCell<HashSet<(usize, usize)>> = RefCell::new(HashSet::new());
}

pub(crate) fn hold(key: (usize, usize)) {
    HELD.with(|held| held.borrow_mut().insert(key));
}

pub(crate) fn unhold(key: (usize, usize)) {
    HELD.with(|held| held.borrow_mut().remove(&key));
}

pub(crate) fn is_held(key: (usize, usize)) -> bool {
    HELD.with(|held| held.borrow().contains(&key))
}
