//! Layout packing: turn a primitive's element layout into one shared
//! allocation plus one address per layout item.

use weft_api::errors::MemoryError;

use super::{AnyAddress, ElementKind, Memory};

/// One item of an element layout: `count` scalars of `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutItem {
    pub kind: ElementKind,
    pub count: usize,
}

impl LayoutItem {
    pub const fn scalar(kind: ElementKind) -> Self {
        Self { kind, count: 1 }
    }

    pub const fn array(kind: ElementKind, count: usize) -> Self {
        Self { kind, count }
    }
}

const fn round_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// Pack `layout` into a single fresh allocation with natural per-item
/// alignment (each item starts at a byte offset divisible by its scalar
/// width) and return one address per item, in layout order.
///
/// Primitive constructors consume the addresses positionally.
pub fn allocate(layout: &[LayoutItem]) -> Result<Vec<AnyAddress>, MemoryError> {
    if layout.is_empty() {
        return Err(MemoryError::InvalidLayout("empty element layout".into()));
    }

    let mut byte = 0usize;
    let mut placements = Vec::with_capacity(layout.len());
    for item in layout {
        if item.count == 0 {
            return Err(MemoryError::InvalidLayout(format!(
                "zero-length {} item",
                item.kind
            )));
        }
        let width = item.kind.byte_width();
        byte = round_up(byte, width);
        placements.push((byte, *item));
        byte += width * item.count;
    }

    let memory = Memory::alloc(byte);
    placements
        .into_iter()
        .map(|(start, item)| {
            AnyAddress::new(
                memory.clone(),
                item.kind,
                start / item.kind.byte_width(),
                item.count,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Address;

    #[test]
    fn packs_with_natural_alignment() {
        let layout = [
            LayoutItem::scalar(ElementKind::I8),
            LayoutItem::scalar(ElementKind::I32),
            LayoutItem::array(ElementKind::I16, 3),
            LayoutItem::scalar(ElementKind::F64),
        ];
        let addrs = allocate(&layout).expect("valid layout");
        assert_eq!(addrs.len(), 4);

        // i8 at byte 0, i32 padded to byte 4, i16 x3 at byte 8,
        // f64 padded from byte 14 to byte 16
        assert_eq!(addrs[0].offset(), 0);
        assert_eq!(addrs[1].offset(), 1); // element offset: byte 4 / width 4
        assert_eq!(addrs[2].offset(), 4); // byte 8 / width 2
        assert_eq!(addrs[3].offset(), 2); // byte 16 / width 8

        // All items share one allocation sized to the packed total
        let mem = addrs[0].memory();
        assert!(addrs.iter().all(|a| a.memory().same(mem)));
        assert_eq!(mem.byte_len(), 24);
    }

    #[test]
    fn items_are_disjoint() {
        let layout = [
            LayoutItem::scalar(ElementKind::I32),
            LayoutItem::array(ElementKind::I32, 2),
        ];
        let addrs = allocate(&layout).expect("valid layout");
        let first: Address<i32> = addrs[0].typed().expect("i32");
        let rest: Address<i32> = addrs[1].typed().expect("i32");

        first.set(-1, 0);
        rest.set(7, 0);
        rest.set(8, 1);
        assert_eq!(first.get(0), -1);
        assert_eq!(rest.get(0), 7);
        assert_eq!(rest.get(1), 8);
    }

    #[test]
    fn rejects_degenerate_layouts() {
        assert!(matches!(
            allocate(&[]),
            Err(MemoryError::InvalidLayout(_))
        ));
        assert!(matches!(
            allocate(&[LayoutItem::array(ElementKind::I32, 0)]),
            Err(MemoryError::InvalidLayout(_))
        ));
    }
}
