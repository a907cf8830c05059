use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::memory::ElementKind;
use weft_api::value::{HydrateObject, Value};

use crate::codec::{self, req_shared};
use crate::memory::{allocate, blocking_allowed, AnyAddress, Budget, LayoutItem};
use crate::memory::Address;

/// A counter that waiters block on until it returns to zero.
///
/// `add` must happen-before the matching `done`; adding after a wait has
/// started is undefined. Well-formed clients never drive the counter
/// negative.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    counter: Address<i32>,
}

impl WaitGroup {
    pub const HYDRATION_KEY: &'static str = codec::keys::WAITGROUP;
    pub const ELEMENT_LAYOUT: &'static [LayoutItem] = &[LayoutItem::scalar(ElementKind::I32)];

    pub fn make() -> Result<Self, MemoryError> {
        let mut addrs = allocate(Self::ELEMENT_LAYOUT)?;
        Self::from_address(addrs.remove(0))
    }

    pub(crate) fn from_address(addr: AnyAddress) -> Result<Self, MemoryError> {
        Ok(Self {
            counter: addr.typed()?,
        })
    }

    /// Add `n` outstanding tasks.
    pub fn add(&self, n: i32) {
        self.counter.atomic_add(n, 0);
    }

    /// Mark one task complete; wakes all waiters when the counter reaches
    /// zero.
    pub fn done(&self) {
        let previous = self.counter.atomic_sub(1, 0);
        if previous <= 1 {
            self.counter.notify_all(0);
        }
    }

    /// Current counter value.
    pub fn count(&self) -> i32 {
        self.counter.atomic_load(0)
    }

    /// Block until the counter reaches zero or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        blocking_allowed()?;
        Ok(self.wait_raw(timeout))
    }

    pub(crate) fn wait_raw(&self, timeout: Option<Duration>) -> bool {
        let budget = Budget::new(timeout);
        loop {
            let current = self.counter.atomic_load(0);
            if current == 0 {
                return true;
            }
            if budget.expired() {
                return false;
            }
            let _ = self.counter.wait_raw(current, budget.remaining(), 0);
        }
    }

    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let group = self.clone();
        tokio::task::spawn_blocking(move || group.wait_raw(timeout))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }
}

impl HydrateObject for WaitGroup {
    fn hydration_key(&self) -> &'static str {
        Self::HYDRATION_KEY
    }

    fn dehydrate(&self) -> Value {
        Value::map([("addr", Value::shared(self.counter.erase()))])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl From<WaitGroup> for Value {
    fn from(group: WaitGroup) -> Self {
        Value::shared(group)
    }
}

pub(crate) fn hydrate_wait_group(value: &Value) -> Result<WaitGroup, CodecError> {
    let addr: AnyAddress = req_shared(value, "addr", codec::keys::WAITGROUP)?;
    Ok(WaitGroup::from_address(addr)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_on_zero_returns_immediately() {
        let group = WaitGroup::make().expect("make");
        assert!(group.wait(Some(Duration::ZERO)).expect("not on a runtime"));
    }

    #[test]
    fn wait_times_out_with_outstanding_tasks() {
        let group = WaitGroup::make().expect("make");
        group.add(1);
        assert!(!group
            .wait(Some(Duration::from_millis(50)))
            .expect("not on a runtime"));
        assert_eq!(group.count(), 1);
        group.done();
    }

    #[test]
    fn done_releases_waiters() {
        let group = WaitGroup::make().expect("make");
        group.add(3);

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let group = group.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(30));
                    group.done();
                })
            })
            .collect();

        assert!(group
            .wait(Some(Duration::from_secs(10)))
            .expect("not on a runtime"));
        assert_eq!(group.count(), 0);
        for worker in workers {
            worker.join().expect("join");
        }
    }

    #[tokio::test]
    async fn async_wait_converges() {
        let group = WaitGroup::make().expect("make");
        group.add(2);

        let done = group.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            done.done();
            done.done();
        });

        assert!(group
            .wait_async(Some(Duration::from_secs(10)))
            .await
            .expect("async wait"));
    }
}
