use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    address::{align_up, Address, OBJECT_ALIGNMENT},
    belt::Belt,
    object::ObjectModel,
};

/// Size of the buffer handed out for a request of `request` bytes: the
/// default size, grown in default-size steps when the request is larger.
pub fn tlab_size_for(request: usize, default: usize) -> usize {
    let request = align_up(request, OBJECT_ALIGNMENT);
    if request <= default {
        default
    } else {
        align_up(request, default)
    }
}

/// Thread local allocation buffer of a mutator.
///
/// Only the owning mutator allocates from it. The collector touches it while
/// the owner is stopped, to pad the unused tail and to drop it once the belt it
/// points into has been evacuated. The safepoint lock orders both sides, so
/// the fields are relaxed atomics.
pub struct Tlab {
    start: AtomicUsize,
    top: AtomicUsize,
    end: AtomicUsize,
}

impl Tlab {
    pub const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end.load(Ordering::Relaxed) == 0
    }

    pub fn start(&self) -> Address {
        Address::from(self.start.load(Ordering::Relaxed))
    }

    pub fn remaining(&self) -> usize {
        self.end.load(Ordering::Relaxed) - self.top.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let top = self.top.load(Ordering::Relaxed);
        let new_top = top + size;
        if top == 0 || new_top > self.end.load(Ordering::Relaxed) {
            return None;
        }
        self.top.store(new_top, Ordering::Relaxed);
        Some(Address::from(top))
    }

    pub fn refill(&self, start: Address, size: usize) {
        self.start.store(start.to_usize(), Ordering::Relaxed);
        self.top.store(start.to_usize(), Ordering::Relaxed);
        self.end.store(start.to_usize() + size, Ordering::Relaxed);
    }

    /// Pads the unused tail with filler and forgets the buffer.
    pub fn retire(&self, model: &dyn ObjectModel) {
        if !self.is_empty() {
            let top = Address::from(self.top.load(Ordering::Relaxed));
            model.write_filler(top, self.remaining());
        }
        self.reset();
    }

    /// Forgets the buffer without touching memory. Used once the belt the
    /// buffer pointed into has been wiped.
    pub fn reset(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.top.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
    }
}

impl Default for Tlab {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy buffer private to one parallel scavenger worker. Large cells go
/// straight to the belt so a buffer never wastes more than one cell's worth
/// of padding.
pub struct GcLab {
    top: Address,
    end: Address,
    size: usize,
}

impl GcLab {
    pub fn new(size: usize) -> Self {
        Self {
            top: Address::null(),
            end: Address::null(),
            size,
        }
    }

    pub fn allocate(&mut self, belt: &Belt, model: &dyn ObjectModel, size: usize) -> Option<Address> {
        if self.top.is_non_null() && self.top.offset(size) <= self.end {
            let result = self.top;
            self.top = self.top.offset(size);
            return Some(result);
        }
        if size * 4 > self.size {
            return belt.allocate(size);
        }
        self.retire(model);
        match belt.allocate(self.size) {
            Some(start) => {
                self.top = start.offset(size);
                self.end = start.offset(self.size);
                Some(start)
            }
            // Near the end of the belt a whole buffer may not fit any more.
            None => belt.allocate(size),
        }
    }

    pub fn retire(&mut self, model: &dyn ObjectModel) {
        if self.top.is_non_null() {
            model.write_filler(self.top, self.end.offset_from(self.top));
        }
        self.top = Address::null();
        self.end = Address::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mmap::Mmap,
        object::{Hub, StandardObjectModel},
        region::MemoryRegion,
    };

    #[test]
    fn sizing_grows_in_default_steps() {
        assert_eq!(tlab_size_for(16, 32 * 1024), 32 * 1024);
        assert_eq!(tlab_size_for(32 * 1024, 32 * 1024), 32 * 1024);
        assert_eq!(tlab_size_for(32 * 1024 + 8, 32 * 1024), 64 * 1024);
    }

    #[test]
    fn retire_leaves_a_parseable_tail() {
        let map = Mmap::new(4096).unwrap();
        let model = StandardObjectModel::new();
        let tlab = Tlab::new();
        assert!(tlab.allocate(16).is_none());
        tlab.refill(map.start(), 256);
        let a = tlab.allocate(64).unwrap();
        assert_eq!(a, map.start());
        assert_eq!(tlab.remaining(), 192);
        assert!(tlab.allocate(256).is_none());
        tlab.retire(&model);
        assert!(tlab.is_empty());
        let tail = map.start().offset(64);
        let hub = unsafe { tail.load_word() };
        assert_eq!(StandardObjectModel::hub_of(tail), Some(Hub::FILLER));
        assert_eq!(model.size_of(tail, hub), 192);
    }

    #[test]
    fn gc_lab_pads_when_refilling() {
        let map = Mmap::new(4096).unwrap();
        let belt = Belt::new(MemoryRegion::new("to", map.start(), map.size()), 0);
        let model = StandardObjectModel::new();
        let mut lab = GcLab::new(512);
        let a = lab.allocate(&belt, &model, 96).unwrap();
        let b = lab.allocate(&belt, &model, 96).unwrap();
        assert_eq!(b.offset_from(a), 96);
        // Large enough to bypass the buffer.
        let big = lab.allocate(&belt, &model, 400).unwrap();
        assert_eq!(big, map.start().offset(512));
        let c = lab.allocate(&belt, &model, 96).unwrap();
        assert_eq!(c.offset_from(b), 96);
        lab.retire(&model);
        let tail = c.offset(96);
        assert_eq!(StandardObjectModel::hub_of(tail), Some(Hub::FILLER));
        assert_eq!(belt.used_space(), 912);
    }
}
