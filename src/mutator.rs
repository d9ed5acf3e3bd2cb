use std::sync::Arc;

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    address::{checked_align_up, Address, OBJECT_ALIGNMENT},
    error::HeapResult,
    heap::Heap,
    tlab::{tlab_size_for, Tlab},
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing heap code: may allocate, read and write references.
    Running = 0,
    /// Stopped at a poll, waiting for the collection to finish.
    Parked = 1,
    /// Outside of heap code; the collector may run concurrently.
    Native = 2,
}

/// Per-mutator state shared with the collector.
pub struct MutatorData {
    pub(crate) id: usize,
    pub(crate) state: Atomic<ThreadState>,
    pub(crate) tlab: Tlab,
    /// Root slots. The collector reads and rewrites them while the world is
    /// stopped.
    pub(crate) roots: Mutex<Vec<usize>>,
}

impl MutatorData {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: Atomic::new(ThreadState::Native),
            tlab: Tlab::new(),
            roots: Mutex::new(Vec::new()),
        }
    }
}

/// Handle of one application thread attached to a [`Heap`].
///
/// Objects are allocated through the handle's TLAB; references the thread
/// needs to survive a collection must live on its root stack.
pub struct Mutator {
    heap: Arc<Heap>,
    data: Arc<MutatorData>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, data: Arc<MutatorData>) -> Self {
        Self { heap, data }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn state(&self) -> ThreadState {
        self.data.state.load(Ordering::Acquire)
    }

    /// Safepoint poll. Parks the thread while a collection is pending.
    #[inline(always)]
    pub fn safepoint(&self) -> HeapResult<()> {
        if self.heap.safepoint().is_requested() {
            return self.heap.safepoint().park(&self.data);
        }
        Ok(())
    }

    /// Allocates `size` bytes. Small objects come from the TLAB, objects at or
    /// above the large object threshold straight from the belt. Runs a
    /// collection when memory is exhausted.
    ///
    /// The returned memory is uninitialized; it must be turned into a valid
    /// cell before the next safepoint poll.
    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> HeapResult<Address> {
        self.safepoint()?;
        let size = match checked_align_up(size, OBJECT_ALIGNMENT) {
            Some(size) => size,
            None => return Err(self.heap.out_of_memory(size)),
        };
        if size < self.heap.config().large_object_threshold {
            if let Some(result) = self.data.tlab.allocate(size) {
                return Ok(result);
            }
            return self.allocate_slow(size);
        }
        self.heap
            .allocate_in_belt(&self.data, size, size)
            .map(|(result, _)| result)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&mut self, size: usize) -> HeapResult<Address> {
        self.data.tlab.retire(self.heap.object_model());
        let preferred = tlab_size_for(size, self.heap.config().tlab_size);
        // A collection triggered below resets this TLAB again; it is empty by now.
        let (start, granted) = self
            .heap
            .allocate_in_belt(&self.data, size, preferred)?;
        self.data.tlab.refill(start, granted);
        match self.data.tlab.allocate(size) {
            Some(result) => Ok(result),
            None => unreachable!("fresh TLAB of {} bytes cannot fit {} bytes", granted, size),
        }
    }

    /// Runs a collection on behalf of this thread. The thread counts as
    /// stopped while it waits.
    pub fn collect(&self, requested: usize) -> HeapResult<bool> {
        self.heap.collect_as(Some(&self.data), requested)
    }

    /// Runs `f` with the thread marked as outside of heap code, e.g. around a
    /// blocking call. `f` must not touch the heap.
    pub fn in_native<R>(&self, f: impl FnOnce() -> R) -> HeapResult<R> {
        self.heap.safepoint().enter_native(&self.data);
        let result = f();
        self.heap.safepoint().leave_native(&self.data)?;
        Ok(result)
    }

    /// Pushes `value` onto the root stack and returns its index.
    pub fn push_root(&self, value: Address) -> usize {
        let mut roots = self.data.roots.lock();
        roots.push(value.to_usize());
        roots.len() - 1
    }

    pub fn pop_root(&self) -> Option<Address> {
        self.data.roots.lock().pop().map(Address::from)
    }

    /// Current value of root `index`; it changes when a collection moves the
    /// referent.
    pub fn root(&self, index: usize) -> Address {
        Address::from(self.data.roots.lock()[index])
    }

    pub fn set_root(&self, index: usize, value: Address) {
        self.data.roots.lock()[index] = value.to_usize();
    }

    pub fn number_of_roots(&self) -> usize {
        self.data.roots.lock().len()
    }

    pub fn truncate_roots(&self, len: usize) {
        self.data.roots.lock().truncate(len);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if self.state() == ThreadState::Running {
            self.data.tlab.retire(self.heap.object_model());
        }
        self.heap.safepoint().unregister(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        object::{Hub, StandardObjectModel},
    };

    fn heap() -> Arc<Heap> {
        let mut config = Config::default();
        config.heap_size = 1024 * 1024;
        config.boot_region_size = 0;
        config.code_region_size = 0;
        Heap::new(config, Arc::new(StandardObjectModel::new())).unwrap()
    }

    #[test]
    fn small_objects_come_from_the_tlab() {
        let heap = heap();
        let mut mutator = heap.attach_mutator().unwrap();
        assert_eq!(mutator.state(), ThreadState::Running);
        let a = mutator.allocate(32).unwrap();
        let b = mutator.allocate(32).unwrap();
        assert_eq!(b.offset_from(a), 32);
        assert_eq!(heap.report_used_space(), heap.config().tlab_size);
        let large = mutator.allocate(heap.config().large_object_threshold).unwrap();
        assert_eq!(large, a.offset(heap.config().tlab_size));
    }

    #[test]
    fn roots_follow_moved_objects() {
        let heap = heap();
        let mut mutator = heap.attach_mutator().unwrap();
        let model = StandardObjectModel::new();
        let size = StandardObjectModel::cell_size(0, 8);
        let cell = mutator.allocate(size).unwrap();
        unsafe {
            model.initialize(cell, Hub(5), size, 0);
            StandardObjectModel::payload(cell).store_word(0x1234);
        }
        let index = mutator.push_root(cell);
        assert!(mutator.collect(0).unwrap());
        let moved = mutator.root(index);
        assert_ne!(moved, cell);
        assert!(heap.contains_in_allocated(moved));
        assert_eq!(StandardObjectModel::hub_of(moved), Some(Hub(5)));
        assert_eq!(unsafe { StandardObjectModel::payload(moved).load_word() }, 0x1234);
        assert_eq!(mutator.pop_root(), Some(moved));
        assert_eq!(mutator.number_of_roots(), 0);
    }

    #[test]
    fn detached_mutators_leave_the_registry() {
        let heap = heap();
        let mutator = heap.attach_mutator().unwrap();
        assert_eq!(heap.safepoint().number_of_mutators(), 1);
        drop(mutator);
        assert_eq!(heap.safepoint().number_of_mutators(), 0);
        assert!(heap.collect(0).unwrap());
    }
}
