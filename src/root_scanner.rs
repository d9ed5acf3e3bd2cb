use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    address::Address,
    belt::Belt,
    heap::Heap,
    object::{hub_word, slot_word},
};

/// Source of root slots outside mutator stacks: global/static references,
/// reference-literal tables of compiled code and the like.
///
/// Slots must stay valid and unmoved while the world is stopped.
pub trait RootProvider: Send + Sync {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Address));
}

impl<F> RootProvider for F
where
    F: Fn(&mut dyn FnMut(Address)) + Send + Sync,
{
    fn visit_roots(&self, visitor: &mut dyn FnMut(Address)) {
        self(visitor)
    }
}

/// Registry of individual global root slots, always scanned by the heap.
#[derive(Default)]
pub struct GlobalRoots {
    slots: Mutex<Vec<Address>>,
}

impl GlobalRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, slot: Address) {
        self.slots.lock().push(slot);
    }

    pub fn remove(&self, slot: Address) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter().position(|s| *s == slot) {
            Some(index) => {
                slots.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for GlobalRoots {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Address)) {
        for slot in self.slots.lock().iter() {
            visitor(*slot);
        }
    }
}

/// Slots discovered by one root scan.
#[derive(Default, Debug)]
pub struct RootSet {
    pub slots: Vec<Address>,
    pub mutator_slots: usize,
    pub global_slots: usize,
    /// Slots found in dirty cards of the immortal regions.
    pub card_slots: usize,
    pub dirty_cards: usize,
    pub cleaned_cards: usize,
    pub root_scan_time: Duration,
    pub card_scan_time: Duration,
}

/// Discovers every slot that may reference a belt. Must run with all mutators
/// stopped.
pub struct RootScanner<'a> {
    heap: &'a Heap,
}

impl<'a> RootScanner<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }

    pub fn run(&self) -> RootSet {
        let mut roots = RootSet::default();
        let start = Instant::now();
        self.scan_thread_and_global_roots(&mut roots);
        roots.root_scan_time = start.elapsed();
        let start = Instant::now();
        for space in self.heap.immortal_spaces() {
            self.scan_dirty_cards(space, &mut roots);
        }
        roots.card_scan_time = start.elapsed();
        log::debug!(
            "roots scanned: {} mutator slots, {} global slots, {} card slots ({} dirty cards, {} cleaned)",
            roots.mutator_slots,
            roots.global_slots,
            roots.card_slots,
            roots.dirty_cards,
            roots.cleaned_cards
        );
        roots
    }

    /// Mutator root stacks and registered root providers, without the card
    /// scan of the immortal regions.
    pub fn scan_thread_and_global_roots(&self, roots: &mut RootSet) {
        self.heap.safepoint().for_each_mutator(|mutator| {
            let mut stack = mutator.roots.lock();
            // The vector cannot grow while its owner is stopped, so the slot
            // addresses stay valid until the world is resumed.
            for slot in stack.iter_mut() {
                roots.slots.push(Address::from_ptr(slot as *mut usize));
                roots.mutator_slots += 1;
            }
        });
        let before = roots.slots.len();
        self.heap.visit_root_providers(&mut |slot| roots.slots.push(slot));
        roots.global_slots += roots.slots.len() - before;
    }

    /// Walks the cells overlapping every dirty card of `space` and collects
    /// the slots of that card referencing a belt. Cards holding no such slot
    /// are cleaned.
    fn scan_dirty_cards(&self, space: &Belt, roots: &mut RootSet) {
        let heap = self.heap;
        let cards = heap.card_table();
        let side_table = heap.side_table();
        let model = heap.object_model();
        let belts = heap.belt_manager();
        let end = space.allocation_mark();

        cards.for_each_dirty_card(space.start(), end, |index| {
            roots.dirty_cards += 1;
            let card_start = cards.card_start(index);
            let card_end = cards.card_end(index).min(end);
            let mut cell = match side_table.scan_start(index) {
                Some(cell) => cell,
                None => {
                    cards.clean(index);
                    roots.cleaned_cards += 1;
                    return;
                }
            };
            let mut holds_belt_references = false;
            while cell < card_end {
                let hub = hub_word(model, cell).load(atomic::Ordering::Acquire);
                if !model.is_valid_hub(hub) {
                    log::warn!(
                        "unparseable cell at {} in {}, card {} kept dirty",
                        cell,
                        space.name(),
                        index
                    );
                    holds_belt_references = true;
                    break;
                }
                let size = model.size_of(cell, hub);
                model.visit_reference_slots(cell, hub, &mut |slot| {
                    if slot < card_start || slot >= card_end {
                        return;
                    }
                    let value = Address::from(slot_word(slot).load(atomic::Ordering::Relaxed));
                    if belts.contains(value) {
                        holds_belt_references = true;
                        roots.slots.push(slot);
                        roots.card_slots += 1;
                    }
                });
                cell = cell.offset(size);
            }
            if !holds_belt_references {
                cards.clean(index);
                roots.cleaned_cards += 1;
            }
        });
    }
}
