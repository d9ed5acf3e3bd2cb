use crate::{
    address::Address,
    belt::Belt,
    error::HeapError,
    heap::Heap,
    object::{hub_word, slot_word},
    region::MemoryRegion,
    root_scanner::{RootScanner, RootSet},
};

/// Consistency checker run around collections.
///
/// Every cell of a scanned range must carry a valid hub, and every reference
/// it holds must be null or point at a valid cell in allocated heap or
/// immortal memory. A forbidden region (the belt about to be recycled) may
/// not be referenced at all.
pub struct HeapVerifier<'a> {
    heap: &'a Heap,
    phase: &'static str,
    forbidden: Option<MemoryRegion>,
    errors: Vec<HeapError>,
    cells: usize,
}

impl<'a> HeapVerifier<'a> {
    pub fn new(heap: &'a Heap, phase: &'static str) -> Self {
        Self {
            heap,
            phase,
            forbidden: None,
            errors: Vec::new(),
            cells: 0,
        }
    }

    pub fn forbid(mut self, region: Option<MemoryRegion>) -> Self {
        self.forbidden = region;
        self
    }

    /// Walks every cell of `[scan_start, scan_end)` and checks the given root
    /// slots.
    pub fn verify_heap(&mut self, scan_start: Address, scan_end: Address, roots: &[Address]) {
        self.verify_region(scan_start, scan_end);
        self.verify_roots(roots);
    }

    /// Verifies `scan` (the belt holding the live objects), both immortal
    /// regions and all thread and global roots.
    pub fn verify_all(mut self, scan: &Belt) -> Vec<HeapError> {
        let mut roots = RootSet::default();
        RootScanner::new(self.heap).scan_thread_and_global_roots(&mut roots);
        self.verify_heap(scan.start(), scan.allocation_mark(), &roots.slots);
        for space in self.heap.immortal_spaces() {
            self.verify_region(space.start(), space.allocation_mark());
        }
        log::debug!(
            "verification {}: {} cells, {} roots, {} errors",
            self.phase,
            self.cells,
            roots.slots.len(),
            self.errors.len()
        );
        self.errors
    }

    pub fn verify_region(&mut self, start: Address, end: Address) {
        let heap = self.heap;
        let model = heap.object_model();
        let mut cell = start;
        while cell < end {
            let hub = hub_word(model, cell).load(atomic::Ordering::Acquire);
            if !model.is_valid_hub(hub) {
                self.report(cell, 0, format!("invalid hub word {:#x}", hub));
                // The rest of the range cannot be parsed.
                return;
            }
            self.cells += 1;
            let size = model.size_of(cell, hub);
            model.visit_reference_slots(cell, hub, &mut |slot| {
                let value = Address::from(slot_word(slot).load(atomic::Ordering::Relaxed));
                self.check_reference(cell, slot.offset_from(cell), value);
            });
            if size == 0 {
                self.report(cell, 0, "zero sized cell".to_string());
                return;
            }
            cell = cell.offset(size);
        }
    }

    pub fn verify_roots(&mut self, roots: &[Address]) {
        for slot in roots {
            let value = Address::from(slot_word(*slot).load(atomic::Ordering::Relaxed));
            self.check_reference(*slot, 0, value);
        }
    }

    fn check_reference(&mut self, holder: Address, offset: usize, value: Address) {
        if value.is_null() {
            return;
        }
        if let Some(forbidden) = &self.forbidden {
            if forbidden.contains(value) {
                let message = format!("reference {} into vacated {}", value, forbidden.name());
                self.report(holder, offset, message);
                return;
            }
        }
        if !self.heap.contains_in_allocated(value) && !self.heap.is_immortal_allocated(value) {
            self.report(holder, offset, format!("reference {} outside of the heap", value));
            return;
        }
        let heap = self.heap;
        let model = heap.object_model();
        let hub = hub_word(model, value).load(atomic::Ordering::Acquire);
        if !model.is_valid_hub(hub) || model.is_filler(hub) {
            let message = format!("reference {} to a cell with hub word {:#x}", value, hub);
            self.report(holder, offset, message);
        }
    }

    fn report(&mut self, address: Address, offset: usize, message: String) {
        self.errors.push(HeapError::Verification {
            address,
            offset,
            message: format!("{} ({})", message, self.phase),
        });
    }
}
