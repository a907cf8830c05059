//! Typed views over shared allocations.
//!
//! A [`Memory`] allocation is raw cells; an [`Address`] is a typed,
//! bounds-checked window into one. The scalar type decides the available
//! surface: every kind gets plain `get`/`set`, the integer kinds get the
//! atomic read-modify-write operations, and the 32-bit integer kinds
//! additionally get futex-backed `wait`/`notify`.
//!
//! The split is a sealed trait ladder ([`Element`], then
//! [`AtomicElement`], then [`WaitElement`]) so misuse, say fetch-add on an
//! `f64` view, is a compile error rather than a runtime fault.

mod address;
mod alloc;
mod futex;

pub use address::{Address, AnyAddress};
pub(crate) use address::{blocking_allowed, hydrate_address};
pub use alloc::{allocate, LayoutItem};
pub use futex::WaitOutcome;
pub(crate) use futex::{futex_wait, futex_wake, Budget};

pub use weft_api::memory::{ElementKind, Memory};

use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

mod sealed {
    pub trait Sealed {}
}

/// A scalar that can back an [`Address`].
///
/// # Safety contract (internal)
///
/// The raw accessors require `ptr` to point at a live, properly aligned cell
/// inside a [`Memory`] allocation; [`Address`] upholds this by construction
/// and is the only caller.
pub trait Element: sealed::Sealed + Copy + Send + Sync + std::fmt::Debug + 'static {
    const KIND: ElementKind;

    /// Plain (relaxed) load. Every access goes through an atomic so
    /// concurrent plain and atomic access to the same cell stays defined.
    unsafe fn load_plain(ptr: *mut u8) -> Self;

    /// Plain (relaxed) store.
    unsafe fn store_plain(ptr: *mut u8, value: Self);
}

/// Integer scalars: the sequentially consistent read-modify-write surface.
pub trait AtomicElement: Element {
    unsafe fn fetch_add(ptr: *mut u8, value: Self) -> Self;
    unsafe fn fetch_sub(ptr: *mut u8, value: Self) -> Self;
    unsafe fn fetch_and(ptr: *mut u8, value: Self) -> Self;
    unsafe fn fetch_or(ptr: *mut u8, value: Self) -> Self;
    unsafe fn fetch_xor(ptr: *mut u8, value: Self) -> Self;
    /// Returns the previous value whether or not the exchange happened.
    unsafe fn compare_exchange(ptr: *mut u8, expected: Self, replacement: Self) -> Self;
    unsafe fn swap(ptr: *mut u8, value: Self) -> Self;
    unsafe fn load(ptr: *mut u8) -> Self;
    unsafe fn store(ptr: *mut u8, value: Self);
}

/// 32-bit integer scalars: the futex word for `wait`/`notify`.
pub trait WaitElement: AtomicElement {
    fn futex_repr(self) -> u32;
}

macro_rules! int_element {
    ($scalar:ty, $atomic:ty, $kind:expr) => {
        impl sealed::Sealed for $scalar {}

        impl Element for $scalar {
            const KIND: ElementKind = $kind;

            unsafe fn load_plain(ptr: *mut u8) -> Self {
                (*(ptr as *const $atomic)).load(Ordering::Relaxed)
            }

            unsafe fn store_plain(ptr: *mut u8, value: Self) {
                (*(ptr as *const $atomic)).store(value, Ordering::Relaxed)
            }
        }

        impl AtomicElement for $scalar {
            unsafe fn fetch_add(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).fetch_add(value, Ordering::SeqCst)
            }

            unsafe fn fetch_sub(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).fetch_sub(value, Ordering::SeqCst)
            }

            unsafe fn fetch_and(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).fetch_and(value, Ordering::SeqCst)
            }

            unsafe fn fetch_or(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).fetch_or(value, Ordering::SeqCst)
            }

            unsafe fn fetch_xor(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).fetch_xor(value, Ordering::SeqCst)
            }

            unsafe fn compare_exchange(ptr: *mut u8, expected: Self, replacement: Self) -> Self {
                match (*(ptr as *const $atomic)).compare_exchange(
                    expected,
                    replacement,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(previous) | Err(previous) => previous,
                }
            }

            unsafe fn swap(ptr: *mut u8, value: Self) -> Self {
                (*(ptr as *const $atomic)).swap(value, Ordering::SeqCst)
            }

            unsafe fn load(ptr: *mut u8) -> Self {
                (*(ptr as *const $atomic)).load(Ordering::SeqCst)
            }

            unsafe fn store(ptr: *mut u8, value: Self) {
                (*(ptr as *const $atomic)).store(value, Ordering::SeqCst)
            }
        }
    };
}

int_element!(i8, AtomicI8, ElementKind::I8);
int_element!(u8, AtomicU8, ElementKind::U8);
int_element!(i16, AtomicI16, ElementKind::I16);
int_element!(u16, AtomicU16, ElementKind::U16);
int_element!(i32, AtomicI32, ElementKind::I32);
int_element!(u32, AtomicU32, ElementKind::U32);
int_element!(i64, AtomicI64, ElementKind::I64);
int_element!(u64, AtomicU64, ElementKind::U64);

impl WaitElement for i32 {
    fn futex_repr(self) -> u32 {
        self as u32
    }
}

impl WaitElement for u32 {
    fn futex_repr(self) -> u32 {
        self
    }
}

// Floats carry no atomic arithmetic; plain access goes through the same-width
// integer atomic with a bit cast so mixed access stays defined.

impl sealed::Sealed for f32 {}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;

    unsafe fn load_plain(ptr: *mut u8) -> Self {
        f32::from_bits((*(ptr as *const AtomicU32)).load(Ordering::Relaxed))
    }

    unsafe fn store_plain(ptr: *mut u8, value: Self) {
        (*(ptr as *const AtomicU32)).store(value.to_bits(), Ordering::Relaxed)
    }
}

impl sealed::Sealed for f64 {}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::F64;

    unsafe fn load_plain(ptr: *mut u8) -> Self {
        f64::from_bits((*(ptr as *const AtomicU64)).load(Ordering::Relaxed))
    }

    unsafe fn store_plain(ptr: *mut u8, value: Self) {
        (*(ptr as *const AtomicU64)).store(value.to_bits(), Ordering::Relaxed)
    }
}
