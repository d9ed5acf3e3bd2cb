//! The object-model seam.
//!
//! The collector does not know how objects are laid out. It consumes an
//! [`ObjectModel`] that tells it how large a cell is, where its reference
//! slots are and how to plant filler cells. The only layout assumption the
//! collector makes is that every cell has one header word (the *hub word*)
//! whose valid values have the two low bits clear, so the collector can
//! temporarily install forwarding pointers in it.
//!
//! [`StandardObjectModel`] is a small concrete layout used by the demo
//! binary, the C API and the tests.

use std::sync::atomic::AtomicUsize;

use modular_bitfield::prelude::*;

use crate::address::{align_up, checked_align_up, Address, OBJECT_ALIGNMENT, WORD_SIZE};

/// Object layout oracle consumed by the heap.
pub trait ObjectModel: Send + Sync {
    /// Byte offset of the hub word inside a cell.
    fn hub_offset(&self) -> usize {
        0
    }

    /// Whether `hub` decodes to a known type descriptor (fillers included).
    fn is_valid_hub(&self, hub: usize) -> bool;

    /// Whether `hub` marks a filler cell planted to pad a buffer.
    fn is_filler(&self, hub: usize) -> bool;

    /// Size in bytes of the cell at `cell` whose hub word is `hub`.
    fn size_of(&self, cell: Address, hub: usize) -> usize;

    /// Calls `visitor` with the address of every reference slot of the cell.
    fn visit_reference_slots(&self, cell: Address, hub: usize, visitor: &mut dyn FnMut(Address));

    /// Copies the cell contents. The hub word of the copy is rewritten by the
    /// collector afterwards.
    fn copy_cell(&self, from: Address, to: Address, size: usize) {
        unsafe {
            core::ptr::copy_nonoverlapping(from.to_ptr::<u8>(), to.to_mut_ptr::<u8>(), size);
        }
    }

    /// Turns `[start, start + size)` into parseable filler. `size` is a
    /// multiple of the object alignment and may be as small as one word.
    fn write_filler(&self, start: Address, size: usize);
}

/// Hub word cell of `cell` as an atomic.
#[inline(always)]
pub(crate) fn hub_word<'a>(model: &dyn ObjectModel, cell: Address) -> &'a AtomicUsize {
    unsafe { &*cell.offset(model.hub_offset()).to_ptr::<AtomicUsize>() }
}

/// Reference slots are plain words; accesses go through an atomic so parallel
/// workers can update them without tearing.
#[inline(always)]
pub(crate) fn slot_word<'a>(slot: Address) -> &'a AtomicUsize {
    unsafe { &*slot.to_ptr::<AtomicUsize>() }
}

// Cell layout of the standard model:
//
// +------------+--------------------------------------------------+
// | word 0     | hub word: (type id << 8) | HUB_TAG               |
// +------------+--------------------------------------------------+
// | word 1     | shape: size in words, reference count, flags     |
// +------------+--------------------------------------------------+
// | word 2..   | `reference_count` reference slots                |
// +------------+--------------------------------------------------+
// | ...        | raw payload bytes                                |
// +------------+--------------------------------------------------+
//
// A one-word filler consists of the hub word only.

const HUB_TAG: usize = 0xB0;
const HUB_TAG_MASK: usize = 0xFF;
const HUB_SHIFT: usize = 8;

pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

#[bitfield(bits = 64)]
#[derive(Clone, Copy, Debug)]
pub struct CellShape {
    pub size_words: B32,
    pub reference_count: B24,
    pub flags: B8,
}

/// Type descriptor id of the standard model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Hub(pub u32);

impl Hub {
    pub const WORD_FILLER: Hub = Hub(0);
    pub const FILLER: Hub = Hub(1);
    /// First id available to the embedding runtime.
    pub const FIRST_USER: u32 = 2;

    pub const fn encode(self) -> usize {
        ((self.0 as usize) << HUB_SHIFT) | HUB_TAG
    }

    pub fn decode(word: usize) -> Option<Hub> {
        if word & HUB_TAG_MASK == HUB_TAG {
            Some(Hub((word >> HUB_SHIFT) as u32))
        } else {
            None
        }
    }
}

/// Header word + shape word layout.
#[derive(Default)]
pub struct StandardObjectModel;

impl StandardObjectModel {
    pub fn new() -> Self {
        Self
    }

    /// Bytes needed for a cell with `references` slots and `payload` raw bytes.
    pub const fn cell_size(references: usize, payload: usize) -> usize {
        align_up(HEADER_SIZE + references * WORD_SIZE + payload, OBJECT_ALIGNMENT)
    }

    /// [`cell_size`](Self::cell_size) for untrusted counts, `None` on overflow.
    pub fn checked_cell_size(references: usize, payload: usize) -> Option<usize> {
        let size = references
            .checked_mul(WORD_SIZE)?
            .checked_add(HEADER_SIZE)?
            .checked_add(payload)?;
        checked_align_up(size, OBJECT_ALIGNMENT)
    }

    /// Plants a header into freshly allocated memory and nulls every slot.
    ///
    /// # Safety
    /// `cell` must point to at least `size` writable bytes.
    pub unsafe fn initialize(&self, cell: Address, hub: Hub, size: usize, references: usize) {
        debug_assert!(size >= Self::cell_size(references, 0));
        debug_assert!(hub.0 >= Hub::FIRST_USER);
        cell.store_word(hub.encode());
        Self::write_shape(cell, size, references);
        for i in 0..references {
            Self::reference_slot(cell, i).store_word(0);
        }
    }

    unsafe fn write_shape(cell: Address, size: usize, references: usize) {
        let shape = CellShape::new()
            .with_size_words((size / WORD_SIZE) as u32)
            .with_reference_count(references as u32)
            .with_flags(0);
        cell.add_words(1).to_mut_ptr::<[u8; 8]>().write(shape.into_bytes());
    }

    /// # Safety
    /// `cell` must be a live cell of this model that is not a word filler.
    pub unsafe fn shape(cell: Address) -> CellShape {
        CellShape::from_bytes(cell.add_words(1).to_ptr::<[u8; 8]>().read())
    }

    pub fn reference_slot(cell: Address, index: usize) -> Address {
        cell.add_words(2 + index)
    }

    /// # Safety
    /// `cell` must be a live cell with more than `index` references.
    pub unsafe fn read_reference(cell: Address, index: usize) -> Address {
        Address::from(slot_word(Self::reference_slot(cell, index)).load(atomic::Ordering::Acquire))
    }

    pub fn reference_count(cell: Address) -> usize {
        unsafe { Self::shape(cell).reference_count() as usize }
    }

    /// First payload byte of a cell.
    pub fn payload(cell: Address) -> Address {
        cell.add_words(2 + Self::reference_count(cell))
    }

    pub fn hub_of(cell: Address) -> Option<Hub> {
        Hub::decode(unsafe { cell.load_word() })
    }
}

impl ObjectModel for StandardObjectModel {
    fn is_valid_hub(&self, hub: usize) -> bool {
        Hub::decode(hub).is_some()
    }

    fn is_filler(&self, hub: usize) -> bool {
        matches!(Hub::decode(hub), Some(Hub::WORD_FILLER) | Some(Hub::FILLER))
    }

    fn size_of(&self, cell: Address, hub: usize) -> usize {
        if hub == Hub::WORD_FILLER.encode() {
            return WORD_SIZE;
        }
        unsafe { Self::shape(cell).size_words() as usize * WORD_SIZE }
    }

    fn visit_reference_slots(&self, cell: Address, hub: usize, visitor: &mut dyn FnMut(Address)) {
        if self.is_filler(hub) {
            return;
        }
        let count = unsafe { Self::shape(cell).reference_count() as usize };
        for i in 0..count {
            visitor(Self::reference_slot(cell, i));
        }
    }

    fn write_filler(&self, start: Address, size: usize) {
        debug_assert!(size % WORD_SIZE == 0);
        unsafe {
            if size == 0 {
                return;
            }
            if size == WORD_SIZE {
                start.store_word(Hub::WORD_FILLER.encode());
                return;
            }
            start.store_word(Hub::FILLER.encode());
            Self::write_shape(start, size, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;

    #[test]
    fn header_round_trips_through_memory() {
        let map = Mmap::new(4096).unwrap();
        let model = StandardObjectModel::new();
        let cell = map.start();
        let size = StandardObjectModel::cell_size(3, 20);
        assert_eq!(size, 16 + 24 + 24);
        unsafe {
            model.initialize(cell, Hub(7), size, 3);
        }
        let hub = unsafe { cell.load_word() };
        assert!(model.is_valid_hub(hub));
        assert!(!model.is_filler(hub));
        assert_eq!(hub & 0b11, 0);
        assert_eq!(StandardObjectModel::hub_of(cell), Some(Hub(7)));
        assert_eq!(model.size_of(cell, hub), size);
        let mut slots = vec![];
        model.visit_reference_slots(cell, hub, &mut |s| slots.push(s));
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0], cell.add_words(2));
        assert_eq!(StandardObjectModel::payload(cell), cell.add_words(5));
    }

    #[test]
    fn checked_cell_size_rejects_overflow() {
        assert_eq!(
            StandardObjectModel::checked_cell_size(3, 20),
            Some(StandardObjectModel::cell_size(3, 20))
        );
        assert_eq!(StandardObjectModel::checked_cell_size(usize::MAX / 4, 0), None);
        assert_eq!(StandardObjectModel::checked_cell_size(1, usize::MAX - 16), None);
        assert_eq!(StandardObjectModel::checked_cell_size(0, usize::MAX - 20), None);
    }

    #[test]
    fn fillers_are_parseable() {
        let map = Mmap::new(4096).unwrap();
        let model = StandardObjectModel::new();
        model.write_filler(map.start(), WORD_SIZE);
        model.write_filler(map.start().offset(WORD_SIZE), 64);
        let hub = unsafe { map.start().load_word() };
        assert!(model.is_filler(hub));
        assert_eq!(model.size_of(map.start(), hub), WORD_SIZE);
        let next = map.start().offset(WORD_SIZE);
        let hub = unsafe { next.load_word() };
        assert!(model.is_filler(hub));
        assert_eq!(model.size_of(next, hub), 64);
        let mut count = 0;
        model.visit_reference_slots(next, hub, &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn garbage_is_not_a_hub() {
        let model = StandardObjectModel::new();
        assert!(!model.is_valid_hub(crate::belt::WIPE_PATTERN));
        assert!(!model.is_valid_hub(0));
        assert!(!model.is_valid_hub(Hub(9).encode() | 1));
    }
}
