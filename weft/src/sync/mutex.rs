use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::memory::ElementKind;
use weft_api::value::{HydrateObject, Value};

use super::{hold, is_held, unhold};
use crate::codec::{self, req_shared};
use crate::memory::{allocate, blocking_allowed, Address, AnyAddress, Budget, LayoutItem};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// A mutual-exclusion lock over one shared 32-bit word.
///
/// Uses the three-state futex protocol: UNLOCKED, LOCKED (no waiters seen),
/// CONTENDED (someone parked or parking). Uncontended lock and unlock are a
/// single compare-exchange / decrement; the futex is only touched once
/// contention is published.
///
/// Fairness is not guaranteed; a releasing thread may re-acquire before any
/// woken waiter runs.
#[derive(Debug, Clone)]
pub struct Mutex {
    word: Address<i32>,
}

impl Mutex {
    pub const HYDRATION_KEY: &'static str = codec::keys::MUTEX;
    pub const ELEMENT_LAYOUT: &'static [LayoutItem] = &[LayoutItem::scalar(ElementKind::I32)];

    /// Allocate a fresh, unlocked mutex.
    pub fn make() -> Result<Self, MemoryError> {
        let mut addrs = allocate(Self::ELEMENT_LAYOUT)?;
        Self::from_address(addrs.remove(0))
    }

    pub(crate) fn from_address(addr: AnyAddress) -> Result<Self, MemoryError> {
        Ok(Self {
            word: addr.typed()?,
        })
    }

    /// A single lock attempt; never blocks.
    pub fn try_lock(&self) -> bool {
        if self.word.compare_exchange(UNLOCKED, LOCKED, 0) == UNLOCKED {
            hold(self.word.cell_key());
            true
        } else {
            false
        }
    }

    /// Block until the lock is acquired or `timeout` elapses.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        blocking_allowed()?;
        Ok(self.lock_raw(timeout))
    }

    pub(crate) fn lock_raw(&self, timeout: Option<Duration>) -> bool {
        if self.word.compare_exchange(UNLOCKED, LOCKED, 0) == UNLOCKED {
            hold(self.word.cell_key());
            return true;
        }
        let budget = Budget::new(timeout);
        loop {
            // Publish contention so unlock knows to wake someone
            let _ = self.word.compare_exchange(LOCKED, CONTENDED, 0);
            if budget.expired() {
                return false;
            }
            let _ = self.word.wait_raw(CONTENDED, budget.remaining(), 0);
            // Re-acquire as CONTENDED: we cannot know whether other waiters
            // remain, so stay conservative
            if self.word.compare_exchange(UNLOCKED, CONTENDED, 0) == UNLOCKED {
                hold(self.word.cell_key());
                return true;
            }
            if budget.expired() {
                return false;
            }
        }
    }

    /// Async lock; the blocking core runs on the runtime's blocking pool.
    pub async fn lock_async(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let mutex = self.clone();
        tokio::task::spawn_blocking(move || mutex.lock_raw(timeout))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }

    /// Release the lock, waking one waiter if contention was published.
    pub fn unlock(&self) {
        let previous = self.word.atomic_sub(1, 0);
        if previous != LOCKED {
            self.word.atomic_store(UNLOCKED, 0);
            self.word.notify_one(0);
        }
        unhold(self.word.cell_key());
    }

    /// Whether this thread holds the lock, per local bookkeeping.
    pub fn has_lock(&self) -> bool {
        is_held(self.word.cell_key())
    }
}

impl HydrateObject for Mutex {
    fn hydration_key(&self) -> &'static str {
        Self::HYDRATION_KEY
    }

    fn dehydrate(&self) -> Value {
        Value::map([("addr", Value::shared(self.word.erase()))])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl From<Mutex> for Value {
    fn from(mutex: Mutex) -> Self {
        Value::shared(mutex)
    }
}

pub(crate) fn hydrate_mutex(value: &Value) -> Result<Mutex, CodecError> {
    let addr: AnyAddress = req_shared(value, "addr", codec::keys::MUTEX)?;
    Ok(Mutex::from_address(addr)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock_cycle() {
        let mutex = Mutex::make().expect("make");
        assert!(!mutex.has_lock());
        assert!(mutex.lock(None).expect("not on a runtime"));
        assert!(mutex.has_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(!mutex.has_lock());
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn lock_times_out_while_held() {
        let mutex = Mutex::make().expect("make");
        assert!(mutex.try_lock());

        let contender = mutex.clone();
        let handle = thread::spawn(move || {
            contender
                .lock(Some(Duration::from_millis(50)))
                .expect("not on a runtime")
        });
        assert!(!handle.join().expect("join"));

        // Zero timeout returns immediately
        let contender = mutex.clone();
        let handle = thread::spawn(move || {
            contender
                .lock(Some(Duration::ZERO))
                .expect("not on a runtime")
        });
        assert!(!handle.join().expect("join"));

        mutex.unlock();
    }

    #[test]
    fn contended_lock_hands_over() {
        let mutex = Mutex::make().expect("make");
        assert!(mutex.try_lock());

        let contender = mutex.clone();
        let waiter = thread::spawn(move || {
            let ok = contender.lock(Some(Duration::from_secs(10))).expect("not on a runtime");
            if ok {
                contender.unlock();
            }
            ok
        });

        // Let the waiter park, then release
        thread::sleep(Duration::from_millis(50));
        mutex.unlock();
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn uncontended_unlock_skips_wake() {
        // An uncontended lock/unlock leaves the word UNLOCKED without ever
        // publishing CONTENDED; exercised via the public surface only.
        let mutex = Mutex::make().expect("make");
        assert!(mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let mutex = Mutex::make().expect("make");
        let cell = Address::<i32>::alloc(1).expect("alloc");
        let threads = 4;
        let rounds = 200;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let mutex = mutex.clone();
                let cell = cell.clone();
                thread::spawn(move || {
                    for _ in 0..rounds {
                        assert!(mutex.lock(None).expect("not on a runtime"));
                        // Plain, non-atomic increment under the lock
                        let v = cell.get(0);
                        cell.set(v + 1, 0);
                        mutex.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(cell.get(0), threads * rounds);
    }

    #[tokio::test]
    async fn blocking_lock_refused_on_runtime() {
        let mutex = Mutex::make().expect("make");
        assert!(matches!(
            mutex.lock(None),
            Err(SyncError::BlockingNotAllowed)
        ));
        // The async variant works from the same context
        assert!(mutex.lock_async(None).await.expect("async lock"));
        mutex.unlock();
    }

    #[test]
    fn hydrated_handle_shares_lock_word() {
        let mutex = Mutex::make().expect("make");
        let other = Arc::new(mutex.clone());
        assert!(mutex.try_lock());
        assert!(!other.try_lock());
        mutex.unlock();
    }
}
