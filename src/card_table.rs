use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::{
    address::{align_up, Address},
    error::{HeapError, HeapResult},
    region::MemoryRegion,
};

pub const CARD_SIZE_BITS: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SIZE_BITS;

/// Maintain a card table from the write barrier. Every reference store into
/// the covered region goes through [`CardTable::mark`]; the collector only
/// rescans cards that are dirty.
///
/// A dirty card means "this card may hold a reference of interest". False
/// positives are fine, a missing mark is a collector bug.
pub struct CardTable {
    /// Mmapped pages for the card table, one byte per card.
    mem_map: MmapMut,
    covered: MemoryRegion,
}

impl CardTable {
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;

    pub fn new(covered: MemoryRegion) -> HeapResult<Self> {
        if !covered.start().is_aligned(CARD_SIZE) {
            return Err(HeapError::Configuration(format!(
                "card table region {:?} is not card aligned",
                covered
            )));
        }
        let cards = align_up(covered.size(), CARD_SIZE) >> CARD_SIZE_BITS;
        let mem_map = MmapMut::map_anon(cards.max(1)).map_err(|err| {
            HeapError::Configuration(format!("unable to map card table: {}", err))
        })?;
        Ok(Self { mem_map, covered })
    }

    pub fn covered(&self) -> &MemoryRegion {
        &self.covered
    }

    pub fn number_of_cards(&self) -> usize {
        align_up(self.covered.size(), CARD_SIZE) >> CARD_SIZE_BITS
    }

    #[inline]
    fn card(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.number_of_cards());
        unsafe { &*(self.mem_map.as_ptr().add(index) as *const AtomicU8) }
    }

    #[inline]
    pub fn card_index(&self, addr: Address) -> usize {
        debug_assert!(self.covered.contains(addr) || addr == self.covered.end());
        addr.offset_from(self.covered.start()) >> CARD_SIZE_BITS
    }

    #[inline]
    pub fn card_start(&self, index: usize) -> Address {
        self.covered.start().offset(index << CARD_SIZE_BITS)
    }

    #[inline]
    pub fn card_end(&self, index: usize) -> Address {
        self.card_start(index + 1).min(self.covered.end())
    }

    /// Write-barrier entry point: dirties the card covering `slot`.
    #[inline]
    pub fn mark(&self, slot: Address) {
        if self.covered.contains(slot) {
            self.card(self.card_index(slot))
                .store(Self::CARD_DIRTY, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.card(index).load(Ordering::Acquire) == Self::CARD_DIRTY
    }

    pub fn is_dirty_at(&self, addr: Address) -> bool {
        self.is_dirty(self.card_index(addr))
    }

    pub fn clean(&self, index: usize) {
        self.card(index).store(Self::CARD_CLEAN, Ordering::Release);
    }

    /// Cleans every card overlapping `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let first = self.card_index(start);
        let last = self.card_index(end.sub(1));
        for index in first..=last {
            self.clean(index);
        }
    }

    /// Calls `visitor` with the index of every dirty card overlapping `[start, end)`.
    pub fn for_each_dirty_card(&self, start: Address, end: Address, mut visitor: impl FnMut(usize)) {
        if end <= start {
            return;
        }
        let first = self.card_index(start);
        let last = self.card_index(end.sub(1));
        for index in first..=last {
            if self.is_dirty(index) {
                visitor(index);
            }
        }
    }

    pub fn count_dirty(&self, start: Address, end: Address) -> usize {
        let mut count = 0;
        self.for_each_dirty_card(start, end, |_| count += 1);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;

    #[test]
    fn mark_and_clear() {
        let map = Mmap::new(16 * CARD_SIZE).unwrap();
        let table =
            CardTable::new(MemoryRegion::new("covered", map.start(), map.size())).unwrap();
        let slot = map.start().offset(3 * CARD_SIZE + 8);
        assert!(!table.is_dirty_at(slot));
        table.mark(slot);
        assert!(table.is_dirty(3));
        assert!(!table.is_dirty(2));
        assert_eq!(table.count_dirty(map.start(), map.end()), 1);
        let mut seen = vec![];
        table.for_each_dirty_card(map.start(), map.end(), |i| seen.push(i));
        assert_eq!(seen, vec![3]);
        table.clear_range(map.start().offset(3 * CARD_SIZE), map.start().offset(4 * CARD_SIZE));
        assert!(!table.is_dirty(3));
    }

    #[test]
    fn marks_outside_are_ignored() {
        let map = Mmap::new(4 * CARD_SIZE).unwrap();
        let table =
            CardTable::new(MemoryRegion::new("covered", map.start(), 2 * CARD_SIZE)).unwrap();
        table.mark(map.start().offset(3 * CARD_SIZE));
        assert_eq!(table.count_dirty(map.start(), map.start().offset(2 * CARD_SIZE)), 0);
    }
}
