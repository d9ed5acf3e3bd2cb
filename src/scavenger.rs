//! The stop-the-world copying collector.
//!
//! A cycle walks the state machine
//! `Idle -> RootsScanned -> Copying -> Wiping -> Swapped -> Idle`:
//!
//! 1. mutators are stopped, their TLABs retired, the optional pre-check runs
//!    and the [`RootScanner`] collects the root set;
//! 2. every root referencing the FROM belt is forwarded into the TO belt and
//!    the copies are scanned transitively, either by a Cheney scan or by a
//!    pool of work-stealing workers;
//! 3. the evacuated belt is wiped and its cards cleared;
//! 4. the optional post-check runs and the belt roles are swapped;
//! 5. mutators are resumed.
//!
//! Both modes share one claim-and-forward primitive. The hub word of a cell
//! is swapped for a busy marker with a CAS, the cell is copied, and the hub
//! word is then replaced by the tagged address of the copy. Whoever loses the
//! CAS waits for the forwarding address, so a cell is never copied twice.
//!
//! If the TO belt overflows the heap is halted for good: the FROM belt is half
//! forwarded at that point and cannot be handed back to mutators.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::{Duration, Instant};

use atomic::{Atomic, Ordering};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;

use crate::{
    address::Address,
    belt::Belt,
    config::ScavengeMode,
    error::{HeapError, HeapResult},
    heap::{CollectionPhase, Heap},
    object::{hub_word, slot_word, ObjectModel},
    region::MemoryRegion,
    root_scanner::RootScanner,
    statistics::PhaseTimes,
    tlab::GcLab,
    verifier::HeapVerifier,
};

const TAG_MASK: usize = 0b11;
const FORWARDED_TAG: usize = 0b01;
/// Installed while a cell is being copied. Never a valid hub nor a tagged
/// address.
const BUSY: usize = 0b11;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CollectorState {
    Idle,
    RootsScanned,
    Copying,
    Wiping,
    Swapped,
    /// The heap is unusable; entered on to-space exhaustion.
    Halted,
}

/// Outcome of [`Evacuation::claim_and_forward`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Forward {
    /// Another slot already forwarded the cell.
    Existing(Address),
    /// This call copied the cell; the copy still needs scanning.
    Copied(Address),
}

/// Decodes a forwarding pointer installed in a hub word.
#[inline]
pub fn forwarding_address(hub: usize) -> Option<Address> {
    if hub & TAG_MASK == FORWARDED_TAG {
        Some(Address::from(hub & !TAG_MASK))
    } else {
        None
    }
}

/// Copy state of one cycle, shared by all workers.
pub struct Evacuation<'a> {
    model: &'a dyn ObjectModel,
    from: &'a Belt,
    to: &'a Belt,
    failed: AtomicBool,
    objects: AtomicUsize,
    bytes: AtomicUsize,
}

impl<'a> Evacuation<'a> {
    pub fn new(model: &'a dyn ObjectModel, from: &'a Belt, to: &'a Belt) -> Self {
        Self {
            model,
            from,
            to,
            failed: AtomicBool::new(false),
            objects: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn objects_copied(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    pub fn bytes_copied(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The single atomic copy-and-forward step.
    ///
    /// Returns `Err(size)` when `alloc` cannot provide room for the copy; the
    /// cell is left unforwarded in that case.
    pub fn claim_and_forward(
        &self,
        cell: Address,
        alloc: &mut dyn FnMut(usize) -> Option<Address>,
    ) -> Result<Forward, usize> {
        let hub_cell = hub_word(self.model, cell);
        let backoff = Backoff::new();
        loop {
            let hub = hub_cell.load(Ordering::Acquire);
            if let Some(forwarded) = forwarding_address(hub) {
                return Ok(Forward::Existing(forwarded));
            }
            if hub == BUSY {
                backoff.snooze();
                continue;
            }
            let size = self.model.size_of(cell, hub);
            if hub_cell
                .compare_exchange(hub, BUSY, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let copy = match alloc(size) {
                Some(copy) => copy,
                None => {
                    hub_cell.store(hub, Ordering::Release);
                    return Err(size);
                }
            };
            self.model.copy_cell(cell, copy, size);
            hub_word(self.model, copy).store(hub, Ordering::Relaxed);
            hub_cell.store(copy.to_usize() | FORWARDED_TAG, Ordering::Release);
            self.objects.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(size, Ordering::Relaxed);
            log::trace!("forwarded {} -> {} ({} bytes)", cell, copy, size);
            return Ok(Forward::Copied(copy));
        }
    }

    /// Redirects `slot` if it references the FROM belt. `on_copy` receives
    /// cells copied by this call.
    #[inline]
    pub fn process_slot(
        &self,
        slot: Address,
        alloc: &mut dyn FnMut(usize) -> Option<Address>,
        on_copy: &mut dyn FnMut(Address),
    ) {
        let slot_cell = slot_word(slot);
        let referent = Address::from(slot_cell.load(Ordering::Relaxed));
        if referent.is_null() || !self.from.contains(referent) {
            return;
        }
        match self.claim_and_forward(referent, alloc) {
            Ok(Forward::Existing(copy)) => slot_cell.store(copy.to_usize(), Ordering::Relaxed),
            Ok(Forward::Copied(copy)) => {
                slot_cell.store(copy.to_usize(), Ordering::Relaxed);
                on_copy(copy);
            }
            Err(_) => self.failed.store(true, Ordering::Release),
        }
    }

    /// Processes every reference slot of a copied cell and returns its size.
    pub fn scan_cell(
        &self,
        cell: Address,
        alloc: &mut dyn FnMut(usize) -> Option<Address>,
        on_copy: &mut dyn FnMut(Address),
    ) -> usize {
        let hub = hub_word(self.model, cell).load(Ordering::Acquire);
        let size = self.model.size_of(cell, hub);
        self.model.visit_reference_slots(cell, hub, &mut |slot| {
            self.process_slot(slot, alloc, on_copy)
        });
        size
    }

    /// Single-threaded evacuation: forwards the roots, then scans the TO belt
    /// from its start to its allocation mark.
    pub fn run_sequential(&self, roots: &[Address]) {
        let to = self.to;
        // SAFETY: the collector thread is the only one touching the TO belt.
        let mut alloc = |size: usize| unsafe { to.allocate_unsynchronized(size) };
        for slot in roots {
            self.process_slot(*slot, &mut alloc, &mut |_| {});
            if self.has_failed() {
                return;
            }
        }
        let mut scan = to.start();
        while scan < to.allocation_mark() && !self.has_failed() {
            let size = self.scan_cell(scan, &mut alloc, &mut |_| {});
            scan = scan.offset(size);
        }
    }

    /// Parallel evacuation. The roots are forwarded by the calling thread and
    /// their copies seed a global queue drained by `workers` scoped threads
    /// that steal from each other. Joining the scope is the completion
    /// barrier.
    pub fn run_parallel(&self, roots: &[Address], workers: usize, gc_lab_size: usize) {
        let injector = Injector::<Address>::new();
        let pending = AtomicUsize::new(0);
        {
            let to = self.to;
            let mut alloc = |size: usize| to.allocate(size);
            let mut on_copy = |copy: Address| {
                pending.fetch_add(1, Ordering::AcqRel);
                injector.push(copy);
            };
            for slot in roots {
                self.process_slot(*slot, &mut alloc, &mut on_copy);
            }
        }
        if self.has_failed() || pending.load(Ordering::Acquire) == 0 {
            return;
        }

        let queues = (0..workers).map(|_| Worker::new_lifo()).collect::<Vec<_>>();
        let stealers = queues.iter().map(|q| q.stealer()).collect::<Vec<_>>();
        let result = crossbeam_utils::thread::scope(|scope| {
            for (index, queue) in queues.into_iter().enumerate() {
                let injector = &injector;
                let stealers = &stealers;
                let pending = &pending;
                let spawned = scope
                    .builder()
                    .name(format!("beltway-scavenger-{}", index))
                    .spawn(move |_| {
                        self.drain(queue, injector, stealers, pending, gc_lab_size);
                    });
                if let Err(err) = spawned {
                    log::error!("unable to spawn scavenger worker {}: {}", index, err);
                }
            }
        });
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
        // Every worker may have failed to spawn.
        if pending.load(Ordering::Acquire) != 0 && !self.has_failed() {
            let queue = Worker::new_lifo();
            self.drain(queue, &injector, &[], &pending, gc_lab_size);
        }
    }

    fn drain(
        &self,
        queue: Worker<Address>,
        injector: &Injector<Address>,
        stealers: &[Stealer<Address>],
        pending: &AtomicUsize,
        gc_lab_size: usize,
    ) {
        let to = self.to;
        let model = self.model;
        let mut lab = GcLab::new(gc_lab_size);
        let backoff = Backoff::new();
        loop {
            if self.has_failed() {
                break;
            }
            match pop_job(&queue, injector, stealers) {
                Some(cell) => {
                    let mut alloc = |size: usize| lab.allocate(to, model, size);
                    let mut on_copy = |copy: Address| {
                        pending.fetch_add(1, Ordering::AcqRel);
                        queue.push(copy);
                    };
                    self.scan_cell(cell, &mut alloc, &mut on_copy);
                    pending.fetch_sub(1, Ordering::AcqRel);
                    backoff.reset();
                }
                None => {
                    if pending.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    backoff.snooze();
                }
            }
        }
        lab.retire(model);
    }
}

fn pop_job(
    queue: &Worker<Address>,
    injector: &Injector<Address>,
    stealers: &[Stealer<Address>],
) -> Option<Address> {
    if let Some(job) = queue.pop() {
        return Some(job);
    }
    loop {
        match injector.steal_batch_and_pop(queue) {
            Steal::Retry => {}
            Steal::Empty => break,
            Steal::Success(job) => return Some(job),
        }
    }
    for stealer in stealers {
        loop {
            match stealer.steal_batch_and_pop(queue) {
                Steal::Retry => {}
                Steal::Empty => break,
                Steal::Success(job) => return Some(job),
            }
        }
    }
    None
}

/// Drives collection cycles for one heap.
pub struct Scavenger {
    mode: ScavengeMode,
    state: Atomic<CollectorState>,
}

impl Scavenger {
    pub fn new(mode: ScavengeMode) -> Self {
        Self {
            mode,
            state: Atomic::new(CollectorState::Idle),
        }
    }

    pub fn mode(&self) -> ScavengeMode {
        self.mode
    }

    pub fn state(&self) -> CollectorState {
        self.state.load(Ordering::Acquire)
    }

    fn transition(&self, to: CollectorState) {
        log::trace!("collector state {:?} -> {:?}", self.state(), to);
        self.state.store(to, Ordering::Release);
    }

    /// Runs one full cycle. Called on the collector thread only.
    pub fn collect(&self, heap: &Heap) -> HeapResult<()> {
        let _cycle = heap.cycle_lock().lock();
        if self.state() == CollectorState::Halted {
            return Err(HeapError::Halted);
        }
        let cycle_start = Instant::now();
        let mut times = PhaseTimes::default();
        let safepoint = heap.safepoint();
        let model = heap.object_model();

        safepoint.suspend_all_mutators();
        // Threads allocating without a mutator finish their cell first.
        let _gate = heap.allocation_gate().write();
        safepoint.for_each_mutator(|mutator| mutator.tlab.retire(model));
        heap.notify_listeners(CollectionPhase::Before);

        let belts = heap.belt_manager();
        let from = belts.from_space();
        let to = belts.to_space();
        debug_assert_eq!(to.used_space(), 0, "copy reserve {} is not empty", to.name());

        if heap.config().verify_before_gc {
            let start = Instant::now();
            let errors = HeapVerifier::new(heap, "before GC").verify_all(from);
            heap.handle_verification_errors(errors);
            times.verification += start.elapsed();
        }

        // IDLE -> ROOTS_SCANNED
        let roots = RootScanner::new(heap).run();
        times.root_scan = roots.root_scan_time;
        times.card_scan = roots.card_scan_time;
        self.transition(CollectorState::RootsScanned);

        // ROOTS_SCANNED -> COPYING
        self.transition(CollectorState::Copying);
        let start = Instant::now();
        let evacuation = Evacuation::new(model, from, to);
        match self.mode {
            ScavengeMode::Sequential => evacuation.run_sequential(&roots.slots),
            ScavengeMode::Parallel { workers } => {
                evacuation.run_parallel(&roots.slots, workers, heap.config().gc_lab_size)
            }
        }
        times.copy = start.elapsed();
        if evacuation.has_failed() {
            return Err(self.halt(heap, to));
        }
        log::debug!(
            "copied {} objects ({} bytes) into {}",
            evacuation.objects_copied(),
            evacuation.bytes_copied(),
            to.name()
        );

        // COPYING -> WIPING
        self.transition(CollectorState::Wiping);
        let start = Instant::now();
        from.wipe(heap.config().wipe_policy, heap.backing());
        heap.card_table().clear_range(from.start(), from.end());
        times.wipe = start.elapsed();

        if heap.config().verify_after_gc {
            let start = Instant::now();
            let vacated = MemoryRegion::new(from.name(), from.start(), from.size());
            let errors = HeapVerifier::new(heap, "after GC")
                .forbid(Some(vacated))
                .verify_all(to);
            heap.handle_verification_errors(errors);
            times.verification += start.elapsed();
        }

        // WIPING -> SWAPPED
        belts.swap_belts(from.index(), to.index());
        from.reset_allocation_mark();
        self.transition(CollectorState::Swapped);

        times.total = cycle_start.elapsed();
        heap.record_cycle(
            times,
            evacuation.objects_copied(),
            evacuation.bytes_copied(),
        );
        heap.notify_listeners(CollectionPhase::After);
        logln_if!(
            heap.config().verbose,
            "[beltway] GC #{} copied {} objects ({} bytes) in {:.3}ms, {} bytes free in {}",
            heap.collection_count(),
            evacuation.objects_copied(),
            evacuation.bytes_copied(),
            duration_ms(times.total),
            belts.report_free_space(),
            belts.from_space().name()
        );

        // SWAPPED -> IDLE
        safepoint.resume_all_mutators();
        self.transition(CollectorState::Idle);
        Ok(())
    }

    fn halt(&self, heap: &Heap, to: &Belt) -> HeapError {
        self.transition(CollectorState::Halted);
        heap.safepoint().halt();
        let err = HeapError::ToSpaceExhausted {
            live_bytes: to.used_space(),
            capacity: to.size(),
        };
        log::error!("{}\n{}", err, heap.diagnostics());
        err
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mmap::Mmap,
        object::{Hub, StandardObjectModel},
    };

    struct Spaces {
        _map: Mmap,
        from: Belt,
        to: Belt,
    }

    fn spaces(size: usize) -> Spaces {
        let map = Mmap::new(2 * size).unwrap();
        let from = Belt::new(MemoryRegion::new("from", map.start(), size), 0);
        let to = Belt::new(MemoryRegion::new("to", map.start().offset(size), size), 1);
        Spaces {
            _map: map,
            from,
            to,
        }
    }

    fn new_cell(belt: &Belt, references: usize) -> Address {
        let size = StandardObjectModel::cell_size(references, 8);
        let cell = belt.allocate(size).unwrap();
        unsafe { StandardObjectModel::new().initialize(cell, Hub(3), size, references) };
        cell
    }

    #[test]
    fn second_claim_sees_the_forwarding_address() {
        let spaces = spaces(4096);
        let model = StandardObjectModel::new();
        let cell = new_cell(&spaces.from, 1);
        let evacuation = Evacuation::new(&model, &spaces.from, &spaces.to);
        let mut alloc = |size| spaces.to.allocate(size);
        let first = evacuation.claim_and_forward(cell, &mut alloc).unwrap();
        let copy = match first {
            Forward::Copied(copy) => copy,
            other => panic!("unexpected {:?}", other),
        };
        assert!(spaces.to.contains(copy));
        assert_eq!(
            evacuation.claim_and_forward(cell, &mut alloc),
            Ok(Forward::Existing(copy))
        );
        assert_eq!(forwarding_address(unsafe { cell.load_word() }), Some(copy));
        assert_eq!(StandardObjectModel::hub_of(copy), Some(Hub(3)));
        assert_eq!(evacuation.objects_copied(), 1);
    }

    #[test]
    fn failed_claim_restores_the_hub() {
        let spaces = spaces(4096);
        let model = StandardObjectModel::new();
        let cell = new_cell(&spaces.from, 0);
        let evacuation = Evacuation::new(&model, &spaces.from, &spaces.to);
        assert_eq!(
            evacuation.claim_and_forward(cell, &mut |_| None),
            Err(StandardObjectModel::cell_size(0, 8))
        );
        assert_eq!(StandardObjectModel::hub_of(cell), Some(Hub(3)));
    }

    #[test]
    fn cycles_are_copied_once() {
        let spaces = spaces(4096);
        let model = StandardObjectModel::new();
        let a = new_cell(&spaces.from, 1);
        let b = new_cell(&spaces.from, 1);
        unsafe {
            StandardObjectModel::reference_slot(a, 0).store_word(b.to_usize());
            StandardObjectModel::reference_slot(b, 0).store_word(a.to_usize());
        }
        let mut root = [a.to_usize()];
        let evacuation = Evacuation::new(&model, &spaces.from, &spaces.to);
        evacuation.run_sequential(&[Address::from_ptr(root.as_mut_ptr())]);
        assert_eq!(evacuation.objects_copied(), 2);
        let new_a = Address::from(root[0]);
        let new_b = unsafe { StandardObjectModel::read_reference(new_a, 0) };
        assert!(spaces.to.contains(new_a) && spaces.to.contains(new_b));
        assert_eq!(unsafe { StandardObjectModel::read_reference(new_b, 0) }, new_a);
    }

    #[test]
    fn parallel_workers_copy_a_shared_graph_once() {
        let spaces = spaces(256 * 1024);
        let model = StandardObjectModel::new();
        // A ladder: every node references the next one and a shared sink.
        let sink = new_cell(&spaces.from, 0);
        let mut nodes = vec![];
        for _ in 0..500 {
            nodes.push(new_cell(&spaces.from, 2));
        }
        for pair in nodes.windows(2) {
            unsafe {
                StandardObjectModel::reference_slot(pair[0], 0).store_word(pair[1].to_usize());
                StandardObjectModel::reference_slot(pair[0], 1).store_word(sink.to_usize());
            }
        }
        let mut roots = nodes.iter().step_by(50).map(|n| n.to_usize()).collect::<Vec<_>>();
        let slots = roots
            .iter_mut()
            .map(|r| Address::from_ptr(r as *mut usize))
            .collect::<Vec<_>>();
        let evacuation = Evacuation::new(&model, &spaces.from, &spaces.to);
        evacuation.run_parallel(&slots, 4, 1024);
        assert!(!evacuation.has_failed());
        assert_eq!(evacuation.objects_copied(), 501);
        let expected = 500 * StandardObjectModel::cell_size(2, 8) + StandardObjectModel::cell_size(0, 8);
        assert_eq!(evacuation.bytes_copied(), expected);
        for root in &roots {
            assert!(spaces.to.contains(Address::from(*root)));
        }
    }
}
