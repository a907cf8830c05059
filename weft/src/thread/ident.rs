//! Hierarchical thread-id allocation.
//!
//! Ids form a tree rooted at `main`: each spawn appends `→n` to the
//! spawning context's id. Counters live in a process-wide table because
//! spawns for one parent may run from any runtime thread.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use weft_api::envelope::ThreadId;

static CHILD_COUNTERS: Lazy<Mutex<HashMap<String, u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Allocate the next child id under `parent`.
pub(crate) fn next_child(parent: &ThreadId) -> ThreadId {
    let mut counters = CHILD_COUNTERS.lock().unwrap_or_else(|e| e.into_inner());
    let n = counters.entry(parent.as_str().to_string()).or_insert(0);
    *n += 1;
    parent.child(*n)
}

/// Identity of the calling context: the worker's id on a worker thread,
/// `main` everywhere else.
pub(crate) fn current_context() -> ThreadId {
    super::worker::current_context_id().unwrap_or_else(ThreadId::root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_count_up_per_parent() {
        let parent = ThreadId::root().child(900_001);
        let a = next_child(&parent);
        let b = next_child(&parent);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(parent.as_str()));
        assert!(b.as_str().starts_with(parent.as_str()));

        let other = ThreadId::root().child(900_002);
        let c = next_child(&other);
        assert!(c.as_str().starts_with(other.as_str()));
        assert!(c.as_str().ends_with("→1"));
    }

    #[test]
    fn main_is_the_default_context() {
        assert_eq!(current_context(), ThreadId::root());
    }
}
