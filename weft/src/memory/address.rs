use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use weft_api::errors::{CodecError, MemoryError, SyncError};
use weft_api::value::{HydrateObject, Value};

use super::{
    futex_wait, futex_wake, AtomicElement, Element, ElementKind, Memory, WaitElement, WaitOutcome,
};
use crate::codec::{self, req_int, req_memory, req_str};

/// Refuse to block a thread that drives an async runtime; the `*_async`
/// variants exist for those callers. Worker threads carry no runtime context
/// and pass.
pub(crate) fn blocking_allowed() -> Result<(), SyncError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(SyncError::BlockingNotAllowed);
    }
    Ok(())
}

/// A typed, bounds-checked window of `count` elements into a shared
/// allocation, starting `offset` elements in.
///
/// Addresses are lightweight handles: cloning one shares the underlying
/// allocation. Indexed accessors panic on out-of-range indices, like slice
/// indexing; constructors check that the whole window fits.
#[derive(Debug, Clone)]
pub struct Address<T: Element> {
    memory: Memory,
    offset: usize,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> Address<T> {
    /// View `count` elements of `memory` starting at element `offset`.
    pub fn new(memory: Memory, offset: usize, count: usize) -> Result<Self, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidLayout(
                "address must cover at least one element".into(),
            ));
        }
        let width = T::KIND.byte_width();
        let end = offset
            .checked_add(count)
            .and_then(|n| n.checked_mul(width));
        match end {
            Some(end) if end <= memory.byte_len() => Ok(Self {
                memory,
                offset,
                count,
                _marker: PhantomData,
            }),
            _ => Err(MemoryError::OutOfBounds {
                kind: T::KIND,
                offset,
                count,
                len: memory.byte_len(),
            }),
        }
    }

    /// Allocate a fresh shared buffer holding exactly `count` elements and
    /// view all of it.
    pub fn alloc(count: usize) -> Result<Self, MemoryError> {
        let memory = Memory::alloc(count.saturating_mul(T::KIND.byte_width()));
        Self::new(memory, 0, count)
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget the element type; used by the codec.
    pub fn erase(&self) -> AnyAddress {
        AnyAddress {
            memory: self.memory.clone(),
            kind: T::KIND,
            offset: self.offset,
            count: self.count,
        }
    }

    /// Identity of the first viewed cell: (allocation id, byte offset).
    /// Keys the per-thread held sets.
    pub(crate) fn cell_key(&self) -> (usize, usize) {
        (self.memory.id(), self.offset * T::KIND.byte_width())
    }

    fn ptr(&self, index: usize) -> *mut u8 {
        assert!(
            index < self.count,
            "index {index} out of bounds for {}-element address",
            self.count
        );
        // In bounds per the constructor check plus the assert above
        unsafe {
            self.memory
                .base_ptr()
                .add((self.offset + index) * T::KIND.byte_width())
        }
    }

    /// Plain load of element `index`.
    pub fn get(&self, index: usize) -> T {
        unsafe { T::load_plain(self.ptr(index)) }
    }

    /// Plain store to element `index`.
    pub fn set(&self, value: T, index: usize) {
        unsafe { T::store_plain(self.ptr(index), value) }
    }
}

impl<T: AtomicElement> Address<T> {
    pub fn atomic_add(&self, value: T, index: usize) -> T {
        unsafe { T::fetch_add(self.ptr(index), value) }
    }

    pub fn atomic_sub(&self, value: T, index: usize) -> T {
        unsafe { T::fetch_sub(self.ptr(index), value) }
    }

    pub fn atomic_and(&self, value: T, index: usize) -> T {
        unsafe { T::fetch_and(self.ptr(index), value) }
    }

    pub fn atomic_or(&self, value: T, index: usize) -> T {
        unsafe { T::fetch_or(self.ptr(index), value) }
    }

    pub fn atomic_xor(&self, value: T, index: usize) -> T {
        unsafe { T::fetch_xor(self.ptr(index), value) }
    }

    /// Compare-and-exchange; returns the previous value either way.
    pub fn compare_exchange(&self, expected: T, replacement: T, index: usize) -> T {
        unsafe { T::compare_exchange(self.ptr(index), expected, replacement) }
    }

    pub fn exchange(&self, value: T, index: usize) -> T {
        unsafe { T::swap(self.ptr(index), value) }
    }

    pub fn atomic_load(&self, index: usize) -> T {
        unsafe { T::load(self.ptr(index)) }
    }

    pub fn atomic_store(&self, value: T, index: usize) {
        unsafe { T::store(self.ptr(index), value) }
    }
}

impl<T: WaitElement> Address<T> {
    fn futex_cell(&self, index: usize) -> &AtomicU32 {
        // Four-byte aligned because 32-bit elements sit at width-multiples
        unsafe { &*(self.ptr(index) as *const AtomicU32) }
    }

    /// Block until notified while element `index` holds `expected`.
    ///
    /// Fails with [`SyncError::BlockingNotAllowed`] on async runtime threads;
    /// use [`Address::wait_async`] there.
    pub fn wait(
        &self,
        expected: T,
        timeout: Option<Duration>,
        index: usize,
    ) -> Result<WaitOutcome, SyncError> {
        blocking_allowed()?;
        Ok(self.wait_raw(expected, timeout, index))
    }

    /// The unguarded wait core shared by the blocking and async paths.
    pub(crate) fn wait_raw(&self, expected: T, timeout: Option<Duration>, index: usize) -> WaitOutcome {
        futex_wait(self.futex_cell(index), expected.futex_repr(), timeout)
    }

    /// Async wait: runs the blocking core on the runtime's blocking pool.
    pub async fn wait_async(
        &self,
        expected: T,
        timeout: Option<Duration>,
        index: usize,
    ) -> Result<WaitOutcome, SyncError> {
        let addr = self.clone();
        tokio::task::spawn_blocking(move || addr.wait_raw(expected, timeout, index))
            .await
            .map_err(|e| SyncError::Runtime(e.to_string()))
    }

    /// Wake up to `count` waiters on element `index`; returns how many were
    /// woken where the platform reports it.
    pub fn notify(&self, count: u32, index: usize) -> usize {
        futex_wake(self.futex_cell(index), count)
    }

    pub fn notify_one(&self, index: usize) -> usize {
        self.notify(1, index)
    }

    pub fn notify_all(&self, index: usize) -> usize {
        self.notify(u32::MAX, index)
    }
}

/// An address with its element type carried as data instead of in the type
/// system; the form that crosses the worker boundary.
#[derive(Debug, Clone)]
pub struct AnyAddress {
    memory: Memory,
    kind: ElementKind,
    offset: usize,
    count: usize,
}

impl AnyAddress {
    pub fn new(
        memory: Memory,
        kind: ElementKind,
        offset: usize,
        count: usize,
    ) -> Result<Self, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidLayout(
                "address must cover at least one element".into(),
            ));
        }
        let end = offset
            .checked_add(count)
            .and_then(|n| n.checked_mul(kind.byte_width()));
        match end {
            Some(end) if end <= memory.byte_len() => Ok(Self {
                memory,
                kind,
                offset,
                count,
            }),
            _ => Err(MemoryError::OutOfBounds {
                kind,
                offset,
                count,
                len: memory.byte_len(),
            }),
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Recover the typed view. Fails when `T` does not match the carried
    /// kind.
    pub fn typed<T: Element>(&self) -> Result<Address<T>, MemoryError> {
        if T::KIND != self.kind {
            return Err(MemoryError::KindMismatch {
                expected: T::KIND,
                found: self.kind,
            });
        }
        Address::new(self.memory.clone(), self.offset, self.count)
    }

    fn wait_view(&self) -> Result<Address<u32>, MemoryError> {
        if !self.kind.is_waitable() {
            return Err(MemoryError::WaitNotSupported(self.kind));
        }
        // I32 and U32 share a futex-compatible bit layout; the dynamic
        // surface works on the raw 32-bit pattern
        Address::new(self.memory.clone(), self.offset, self.count)
    }

    /// Dynamic wait on the raw 32-bit pattern of element `index`. Only the
    /// 32-bit integer kinds can park; everything else fails with
    /// [`MemoryError::WaitNotSupported`].
    pub fn wait(
        &self,
        expected: u32,
        timeout: Option<Duration>,
        index: usize,
    ) -> Result<WaitOutcome, SyncError> {
        let view = self.wait_view().map_err(SyncError::Memory)?;
        view.wait(expected, timeout, index)
    }

    /// Dynamic wake of up to `count` waiters on element `index`.
    pub fn notify(&self, count: u32, index: usize) -> Result<usize, MemoryError> {
        Ok(self.wait_view()?.notify(count, index))
    }
}

impl HydrateObject for AnyAddress {
    fn hydration_key(&self) -> &'static str {
        codec::keys::ADDRESS
    }

    fn dehydrate(&self) -> Value {
        Value::map([
            ("memory", Value::Memory(self.memory.clone())),
            ("kind", Value::from(self.kind.tag())),
            ("offset", Value::from(self.offset as i64)),
            ("cnt", Value::from(self.count as i64)),
        ])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(crate) fn hydrate_address(value: &Value) -> Result<AnyAddress, CodecError> {
    const KEY: &str = codec::keys::ADDRESS;
    let memory = req_memory(value, "memory", KEY)?;
    let tag = req_str(value, "kind", KEY)?;
    let kind = ElementKind::from_tag(tag)
        .ok_or_else(|| codec::malformed(KEY, format!("unknown element kind `{tag}`")))?;
    let offset = req_int(value, "offset", KEY)? as usize;
    let count = req_int(value, "cnt", KEY)? as usize;
    Ok(AnyAddress::new(memory, kind, offset, count)?)
}
