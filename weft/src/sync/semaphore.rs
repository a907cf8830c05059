use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::memory::ElementKind;
use weft_api::value::{HydrateObject, Value};

use super::{hold, is_held, unhold};
use crate::codec::{self, req_int, req_shared};
use crate::memory::{allocate, blocking_allowed, Address, AnyAddress, Budget, LayoutItem};

/// A counting semaphore with a fixed capacity.
///
/// The shared counter tracks permits currently HELD, bounded by the constant
/// `value`; acquisition is a compare-exchange race up, release a decrement.
/// When the counter sits at `value` the semaphore is full and acquirers park
/// on that sentinel value.
#[derive(Debug, Clone)]
pub struct Semaphore {
    counter: Address<i32>,
    value: u32,
}

impl Semaphore {
    pub const HYDRATION_KEY: &'static str = codec::keys::SEMAPHORE;
    pub const ELEMENT_LAYOUT: &'static [LayoutItem] = &[LayoutItem::scalar(ElementKind::I32)];

    /// Allocate a fresh semaphore with `value >= 1` permits.
    pub fn make(value: u32) -> Result<Self, MemoryError> {
        if value == 0 {
            return Err(MemoryError::InvalidLayout(
                "semaphore needs at least one permit".into(),
            ));
        }
        let mut addrs = allocate(Self::ELEMENT_LAYOUT)?;
        Self::from_parts(addrs.remove(0), value)
    }

    pub(crate) fn from_parts(addr: AnyAddress, value: u32) -> Result<Self, MemoryError> {
        if value == 0 {
            return Err(MemoryError::InvalidLayout(
                "semaphore needs at least one permit".into(),
            ));
        }
        Ok(Self {
            counter: addr.typed()?,
            value,
        })
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Currently held permits.
    pub fn held(&self) -> i32 {
        self.counter.atomic_load(0)
    }

    /// Block until a permit is acquired or `timeout` elapses.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        blocking_allowed()?;
        Ok(self.acquire_raw(timeout))
    }

    pub(crate) fn acquire_raw(&self, timeout: Option<Duration>) -> bool {
        let budget = Budget::new(timeout);
        loop {
            let current = self.counter.atomic_load(0);
            if (current as u32) < self.value
                && self.counter.compare_exchange(current, current + 1, 0) == current
            {
                hold(self.counter.cell_key());
                return true;
            }
            if budget.expired() {
                return false;
            }
            // Full: park on the capacity sentinel
            let _ = self
                .counter
                .wait_raw(self.value as i32, budget.remaining(), 0);
        }
    }

    pub async fn acquire_async(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let semaphore = self.clone();
        tokio::task::spawn_blocking(move || semaphore.acquire_raw(timeout))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }

    /// Return a permit and wake one parked acquirer.
    pub fn release(&self) {
        self.counter.atomic_sub(1, 0);
        self.counter.notify_one(0);
        unhold(self.counter.cell_key());
    }

    /// Whether this thread holds a permit, per local bookkeeping.
    pub fn has_acquired(&self) -> bool {
        is_held(self.counter.cell_key())
    }
}

impl HydrateObject for Semaphore {
    fn hydration_key(&self) -> &'static str {
        Self::HYDRATION_KEY
    }

    fn dehydrate(&self) -> Value {
        Value::map([
            ("addr", Value::shared(self.counter.erase())),
            ("value", Value::from(self.value as i64)),
        ])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl From<Semaphore> for Value {
    fn from(semaphore: Semaphore) -> Self {
        Value::shared(semaphore)
    }
}

pub(crate) fn hydrate_semaphore(value: &Value) -> Result<Semaphore, CodecError> {
    const KEY: &str = codec::keys::SEMAPHORE;
    let addr: AnyAddress = req_shared(value, "addr", KEY)?;
    let capacity = req_int(value, "value", KEY)? as u32;
    Ok(Semaphore::from_parts(addr, capacity)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            Semaphore::make(0),
            Err(MemoryError::InvalidLayout(_))
        ));
    }

    #[test]
    fn acquire_up_to_capacity() {
        let semaphore = Semaphore::make(2).expect("make");
        assert!(semaphore
            .acquire(Some(Duration::ZERO))
            .expect("not on a runtime"));
        assert!(semaphore
            .acquire(Some(Duration::ZERO))
            .expect("not on a runtime"));
        assert_eq!(semaphore.held(), 2);
        assert!(semaphore.has_acquired());

        // Full: a bounded acquire fails
        assert!(!semaphore
            .acquire(Some(Duration::from_millis(30)))
            .expect("not on a runtime"));

        semaphore.release();
        assert!(semaphore
            .acquire(Some(Duration::from_secs(1)))
            .expect("not on a runtime"));
        semaphore.release();
        semaphore.release();
        assert_eq!(semaphore.held(), 0);
        assert!(!semaphore.has_acquired());
    }

    #[test]
    fn release_wakes_parked_acquirer() {
        let semaphore = Semaphore::make(1).expect("make");
        assert!(semaphore
            .acquire(Some(Duration::ZERO))
            .expect("not on a runtime"));

        let contender = semaphore.clone();
        let waiter = thread::spawn(move || {
            let ok = contender
                .acquire(Some(Duration::from_secs(10)))
                .expect("not on a runtime");
            if ok {
                contender.release();
            }
            ok
        });

        thread::sleep(Duration::from_millis(50));
        semaphore.release();
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn holders_never_exceed_capacity() {
        let semaphore = Semaphore::make(2).expect("make");
        let holders = Address::<i32>::alloc(1).expect("alloc");
        let peak = Address::<i32>::alloc(1).expect("alloc");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let semaphore = semaphore.clone();
                let holders = holders.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(semaphore.acquire(None).expect("not on a runtime"));
                        let inside = holders.atomic_add(1, 0) + 1;
                        // Track the high-water mark of concurrent holders
                        loop {
                            let seen = peak.atomic_load(0);
                            if inside <= seen || peak.compare_exchange(seen, inside, 0) == seen {
                                break;
                            }
                        }
                        holders.atomic_sub(1, 0);
                        semaphore.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(peak.atomic_load(0) <= 2);
        assert_eq!(semaphore.held(), 0);
    }
}
