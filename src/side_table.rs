use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    address::{align_up, Address, WORD_SIZE},
    card_table::{CARD_SIZE, CARD_SIZE_BITS},
    region::MemoryRegion,
};

const NO_CELL: u8 = u8::MAX;

/// Records, for every card of a linearly allocated region, the word offset of
/// the first cell starting in that card. Lets the collector find an object
/// boundary from which to walk a dirty card.
pub struct SideTable {
    entries: Box<[AtomicU8]>,
    covered: MemoryRegion,
}

impl SideTable {
    pub fn new(covered: MemoryRegion) -> Self {
        debug_assert!(CARD_SIZE / WORD_SIZE < NO_CELL as usize);
        let cards = align_up(covered.size(), CARD_SIZE) >> CARD_SIZE_BITS;
        let entries = (0..cards)
            .map(|_| AtomicU8::new(NO_CELL))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { entries, covered }
    }

    pub fn covered(&self) -> &MemoryRegion {
        &self.covered
    }

    #[inline]
    fn chunk_index(&self, addr: Address) -> usize {
        addr.offset_from(self.covered.start()) >> CARD_SIZE_BITS
    }

    #[inline]
    fn chunk_start(&self, index: usize) -> Address {
        self.covered.start().offset(index << CARD_SIZE_BITS)
    }

    /// Notes that a cell starts at `cell`.
    pub fn record_cell_start(&self, cell: Address) {
        debug_assert!(self.covered.contains(cell));
        let index = self.chunk_index(cell);
        let offset = (cell.offset_from(self.chunk_start(index)) / WORD_SIZE) as u8;
        self.entries[index].fetch_min(offset, Ordering::AcqRel);
    }

    /// First cell starting inside card `index`, if any.
    pub fn first_cell_in(&self, index: usize) -> Option<Address> {
        match self.entries[index].load(Ordering::Acquire) {
            NO_CELL => None,
            offset => Some(self.chunk_start(index).add_words(offset as usize)),
        }
    }

    /// A cell boundary at or before the start of card `index` from which a
    /// forward walk reaches every cell overlapping the card. When no cell
    /// starts at or before the card, the first cell inside it is returned.
    pub fn scan_start(&self, index: usize) -> Option<Address> {
        let target = self.chunk_start(index);
        let mut k = index;
        loop {
            if let Some(cell) = self.first_cell_in(k) {
                if cell <= target {
                    return Some(cell);
                }
            }
            if k == 0 {
                return self.first_cell_in(index);
            }
            k -= 1;
        }
    }

    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.store(NO_CELL, Ordering::Relaxed);
        }
    }
}
