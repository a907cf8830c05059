use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::memory::ElementKind;
use weft_api::value::{HydrateObject, Value};

use super::Mutex;
use crate::codec::{self, req_int, req_shared};
use crate::memory::{allocate, blocking_allowed, Address, AnyAddress, Budget, LayoutItem};

const NUM_HIT: usize = 0;
const EPOCH: usize = 1;

/// A reusable rendezvous for exactly `max_needed` participants.
///
/// Arrivals accumulate under an embedded mutex; the last arrival opens a new
/// epoch, resets the count and wakes everyone parked on the epoch cell. The
/// barrier is immediately reusable for the next epoch.
#[derive(Debug, Clone)]
pub struct Barrier {
    mux: Mutex,
    cells: Address<i32>,
    max_needed: u32,
}

impl Barrier {
    pub const HYDRATION_KEY: &'static str = codec::keys::BARRIER;
    pub const ELEMENT_LAYOUT: &'static [LayoutItem] = &[
        LayoutItem::scalar(ElementKind::I32),
        LayoutItem::array(ElementKind::I32, 2),
    ];

    /// Allocate a fresh barrier for `max_needed >= 1` participants.
    pub fn make(max_needed: u32) -> Result<Self, MemoryError> {
        if max_needed == 0 {
            return Err(MemoryError::InvalidLayout(
                "barrier needs at least one participant".into(),
            ));
        }
        let mut addrs = allocate(Self::ELEMENT_LAYOUT)?;
        let cells = addrs.remove(1);
        let mux = Mutex::from_address(addrs.remove(0))?;
        Ok(Self {
            mux,
            cells: cells.typed()?,
            max_needed,
        })
    }

    pub(crate) fn from_parts(
        mux: Mutex,
        cells: AnyAddress,
        max_needed: u32,
    ) -> Result<Self, MemoryError> {
        if max_needed == 0 {
            return Err(MemoryError::InvalidLayout(
                "barrier needs at least one participant".into(),
            ));
        }
        Ok(Self {
            mux,
            cells: cells.typed()?,
            max_needed,
        })
    }

    pub fn max_needed(&self) -> u32 {
        self.max_needed
    }

    /// Arrive and block until `max_needed` participants have arrived.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        blocking_allowed()?;
        Ok(self.wait_raw(timeout))
    }

    pub(crate) fn wait_raw(&self, timeout: Option<Duration>) -> bool {
        let budget = Budget::new(timeout);
        if !self.mux.lock_raw(budget.remaining()) {
            return false;
        }
        let arrived = self.cells.atomic_add(1, NUM_HIT) + 1;
        if arrived < self.max_needed as i32 {
            let snapshot = self.cells.atomic_load(EPOCH);
            self.mux.unlock();
            // Park until the epoch advances; re-check against spurious wakes
            loop {
                if self.cells.atomic_load(EPOCH) != snapshot {
                    return true;
                }
                if budget.expired() {
                    return false;
                }
                let _ = self.cells.wait_raw(snapshot, budget.remaining(), EPOCH);
            }
        } else {
            // Last arrival: open the next epoch and release the cohort
            self.cells.atomic_add(1, EPOCH);
            self.cells.atomic_store(0, NUM_HIT);
            self.cells.notify_all(EPOCH);
            self.mux.unlock();
            true
        }
    }

    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let barrier = self.clone();
        tokio::task::spawn_blocking(move || barrier.wait_raw(timeout))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }
}

impl HydrateObject for Barrier {
    fn hydration_key(&self) -> &'static str {
        Self::HYDRATION_KEY
    }

    fn dehydrate(&self) -> Value {
        Value::map([
            ("mux", Value::shared(self.mux.clone())),
            ("addr", Value::shared(self.cells.erase())),
            ("maxNeeded", Value::from(self.max_needed as i64)),
        ])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl From<Barrier> for Value {
    fn from(barrier: Barrier) -> Self {
        Value::shared(barrier)
    }
}

pub(crate) fn hydrate_barrier(value: &Value) -> Result<Barrier, CodecError> {
    const KEY: &str = codec::keys::BARRIER;
    let mux: Mutex = req_shared(value, "mux", KEY)?;
    let cells: AnyAddress = req_shared(value, "addr", KEY)?;
    let max_needed = req_int(value, "maxNeeded", KEY)? as u32;
    Ok(Barrier::from_parts(mux, cells, max_needed)?)
}
