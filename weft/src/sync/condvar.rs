use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::memory::ElementKind;
use weft_api::value::{HydrateObject, Value};

use super::Mutex;
use crate::codec::{self, req_shared};
use crate::memory::{allocate, blocking_allowed, Address, AnyAddress, Budget, LayoutItem, WaitOutcome};

const PREV: usize = 0;
const SEQ: usize = 1;

/// A condition variable over two shared 32-bit cells (`prev`, `seq`).
///
/// Every wait must be paired with an externally held [`Mutex`]: the wait
/// atomically releases it, parks on the sequence cell, and re-acquires it
/// with whatever budget remains after the wakeup.
///
/// Spurious wakeups are possible. Callers must re-check their predicate in a
/// loop.
#[derive(Debug, Clone)]
pub struct ConditionVariable {
    cells: Address<i32>,
}

impl ConditionVariable {
    pub const HYDRATION_KEY: &'static str = codec::keys::CONDVAR;
    pub const ELEMENT_LAYOUT: &'static [LayoutItem] = &[LayoutItem::array(ElementKind::I32, 2)];

    pub fn make() -> Result<Self, MemoryError> {
        let mut addrs = allocate(Self::ELEMENT_LAYOUT)?;
        Self::from_address(addrs.remove(0))
    }

    pub(crate) fn from_address(addr: AnyAddress) -> Result<Self, MemoryError> {
        Ok(Self {
            cells: addr.typed()?,
        })
    }

    /// Release `mutex`, wait for a notify, re-acquire `mutex`.
    ///
    /// Returns `false` on timeout. In that case the mutex is NOT held on
    /// return, whether the park or the re-acquire timed out.
    pub fn wait(&self, mutex: &Mutex, timeout: Option<Duration>) -> Result<bool, SyncError> {
        blocking_allowed()?;
        Ok(self.wait_raw(mutex, timeout))
    }

    pub(crate) fn wait_raw(&self, mutex: &Mutex, timeout: Option<Duration>) -> bool {
        let budget = Budget::new(timeout);
        let seq = self.cells.atomic_load(SEQ);
        self.cells.atomic_store(seq, PREV);
        mutex.unlock();
        let outcome = self.cells.wait_raw(seq, budget.remaining(), SEQ);
        if outcome == WaitOutcome::TimedOut {
            return false;
        }
        mutex.lock_raw(budget.remaining())
    }

    /// Async wait; the park-and-relock core runs on the blocking pool.
    pub async fn wait_async(
        &self,
        mutex: &Mutex,
        timeout: Option<Duration>,
    ) -> Result<bool, SyncError> {
        let condvar = self.clone();
        let mutex = mutex.clone();
        tokio::task::spawn_blocking(move || condvar.wait_raw(&mutex, timeout))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }

    /// Wake up to `count` waiters.
    pub fn notify(&self, count: u32) {
        let prev = self.cells.atomic_load(PREV);
        self.cells.atomic_store(prev + 1, SEQ);
        self.cells.notify(count, SEQ);
    }

    pub fn notify_all(&self) {
        self.notify(u32::MAX);
    }
}

impl HydrateObject for ConditionVariable {
    fn hydration_key(&self) -> &'static str {
        Self::HYDRATION_KEY
    }

    fn dehydrate(&self) -> Value {
        Value::map([("addr", Value::shared(self.cells.erase()))])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl From<ConditionVariable> for Value {
    fn from(condvar: ConditionVariable) -> Self {
        Value::shared(condvar)
    }
}

pub(crate) fn hydrate_condvar(value: &Value) -> Result<ConditionVariable, CodecError> {
    let addr: AnyAddress = req_shared(value, "addr", codec::keys::CONDVAR)?;
    Ok(ConditionVariable::from_address(addr)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_without_notify() {
        let mutex = Mutex::make().expect("make");
        let condvar = ConditionVariable::make().expect("make");

        assert!(mutex.try_lock());
        let woke = condvar
            .wait(&mutex, Some(Duration::from_millis(50)))
            .expect("not on a runtime");
        assert!(!woke);
        // On timeout the mutex is not held; re-acquire for cleanliness
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn notify_wakes_waiter() {
        let mutex = Mutex::make().expect("make");
        let condvar = ConditionVariable::make().expect("make");
        let cell = Address::<i32>::alloc(1).expect("alloc");

        let writer = {
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                assert!(mutex.lock(None).expect("not on a runtime"));
                cell.atomic_store(12, 0);
                condvar.notify(1);
                mutex.unlock();
            })
        };

        assert!(mutex.lock(None).expect("not on a runtime"));
        // Predicate loop: spurious wakeups are allowed
        while cell.atomic_load(0) == 0 {
            assert!(condvar
                .wait(&mutex, Some(Duration::from_secs(10)))
                .expect("not on a runtime"));
        }
        assert_eq!(cell.atomic_load(0), 12);
        mutex.unlock();
        writer.join().expect("join");
    }

    #[test]
    fn notify_all_releases_every_waiter() {
        let mutex = Mutex::make().expect("make");
        let condvar = ConditionVariable::make().expect("make");
        let cell = Address::<i32>::alloc(1).expect("alloc");

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let mutex = mutex.clone();
                let condvar = condvar.clone();
                let cell = cell.clone();
                thread::spawn(move || {
                    assert!(mutex.lock(None).expect("not on a runtime"));
                    while cell.atomic_load(0) == 0 {
                        assert!(condvar
                            .wait(&mutex, Some(Duration::from_secs(10)))
                            .expect("not on a runtime"));
                    }
                    mutex.unlock();
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(mutex.lock(None).expect("not on a runtime"));
        cell.atomic_store(1, 0);
        condvar.notify_all();
        mutex.unlock();

        for waiter in waiters {
            waiter.join().expect("join");
        }
    }
}
