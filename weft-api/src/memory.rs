//! Shared allocations and the scalar kinds that view them.
//!
//! A [`Memory`] is a fixed-size, zero-initialized allocation shared between
//! workers by handle: cloning the handle clones an `Arc`, so every holder
//! observes the same cells. All mutation goes through the typed address layer,
//! which funnels every access through atomics; that discipline is what makes
//! the `Send + Sync` impls below sound.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

/// Scalar kinds a shared allocation can be viewed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementKind {
    /// Width in bytes; also the natural alignment of the kind.
    pub const fn byte_width(self) -> usize {
        match self {
            ElementKind::I8 | ElementKind::U8 => 1,
            ElementKind::I16 | ElementKind::U16 => 2,
            ElementKind::I32 | ElementKind::U32 | ElementKind::F32 => 4,
            ElementKind::I64 | ElementKind::U64 | ElementKind::F64 => 8,
        }
    }

    /// Whether the atomic read-modify-write surface applies.
    pub const fn is_integer(self) -> bool {
        !matches!(self, ElementKind::F32 | ElementKind::F64)
    }

    /// Whether wait/notify applies. The futex word is 32 bits, so only the
    /// 32-bit integer kinds are waitable.
    pub const fn is_waitable(self) -> bool {
        matches!(self, ElementKind::I32 | ElementKind::U32)
    }

    /// Stable tag used in layouts and dehydrated addresses.
    pub const fn tag(self) -> &'static str {
        match self {
            ElementKind::I8 => "int8",
            ElementKind::U8 => "uint8",
            ElementKind::I16 => "int16",
            ElementKind::U16 => "uint16",
            ElementKind::I32 => "int32",
            ElementKind::U32 => "uint32",
            ElementKind::I64 => "int64",
            ElementKind::U64 => "uint64",
            ElementKind::F32 => "f32",
            ElementKind::F64 => "f64",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "int8" => ElementKind::I8,
            "uint8" => ElementKind::U8,
            "int16" => ElementKind::I16,
            "uint16" => ElementKind::U16,
            "int32" => ElementKind::I32,
            "uint32" => ElementKind::U32,
            "int64" => ElementKind::I64,
            "uint64" => ElementKind::U64,
            "f32" => ElementKind::F32,
            "f64" => ElementKind::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

struct MemoryInner {
    /// Backing store kept as 64-bit words so every scalar kind finds its
    /// natural alignment at any properly rounded byte offset.
    words: Box<[UnsafeCell<u64>]>,
    byte_len: usize,
}

// Sound because all access to the cells goes through atomic operations on
// the address layer; the raw pointer never escapes unsynchronized.
unsafe impl Send for MemoryInner {}
unsafe impl Sync for MemoryInner {}

/// Handle to a shared allocation. Clones share storage; equality is identity.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

impl Memory {
    /// Allocate `byte_len` zeroed bytes, 8-byte aligned.
    pub fn alloc(byte_len: usize) -> Self {
        let words = byte_len.div_ceil(8);
        let words = (0..words)
            .map(|_| UnsafeCell::new(0u64))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(MemoryInner { words, byte_len }),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.inner.byte_len
    }

    /// Identity of the allocation, stable for its lifetime. Used as a key by
    /// per-thread bookkeeping (held-lock sets).
    pub fn id(&self) -> usize {
        self.inner.words.as_ptr() as usize
    }

    /// Whether two handles refer to the same allocation.
    pub fn same(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Base pointer of the allocation.
    ///
    /// Valid for `byte_len()` bytes while any handle is alive. Callers must
    /// only access it through atomic operations.
    pub fn base_ptr(&self) -> *mut u8 {
        self.inner.words.as_ptr() as *mut u8
    }
}

impl PartialEq for Memory {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Memory {}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("byte_len", &self.inner.byte_len)
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_sized() {
        let mem = Memory::alloc(12);
        assert_eq!(mem.byte_len(), 12);
        // 12 bytes round up to two 64-bit words
        let base = mem.base_ptr();
        for i in 0..12 {
            let b = unsafe {
                (*(base.add(i) as *const std::sync::atomic::AtomicU8))
                    .load(std::sync::atomic::Ordering::Relaxed)
            };
            assert_eq!(b, 0);
        }
    }

    #[test]
    fn clones_share_identity() {
        let a = Memory::alloc(8);
        let b = a.clone();
        let c = Memory::alloc(8);
        assert!(a.same(&b));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            ElementKind::I8,
            ElementKind::U8,
            ElementKind::I16,
            ElementKind::U16,
            ElementKind::I32,
            ElementKind::U32,
            ElementKind::I64,
            ElementKind::U64,
            ElementKind::F32,
            ElementKind::F64,
        ] {
            assert_eq!(ElementKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ElementKind::from_tag("int128"), None);
        assert!(ElementKind::I32.is_waitable());
        assert!(!ElementKind::U64.is_waitable());
        assert!(!ElementKind::F64.is_integer());
    }
}
