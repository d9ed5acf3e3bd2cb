use std::{
    fmt::Write as _,
    sync::{atomic::AtomicUsize, Arc},
    thread::JoinHandle,
};

use atomic::Ordering;
use parking_lot::{Mutex, RwLock};

use crate::{
    address::{checked_align_up, Address, OBJECT_ALIGNMENT},
    belt::Belt,
    belt_manager::{check_disjoint, BeltManager},
    card_table::CardTable,
    collection_barrier::CollectionBarrier,
    config::{Config, VerificationPolicy},
    error::{fatal, HeapError, HeapResult},
    mmap::Mmap,
    mutator::{Mutator, MutatorData},
    object::{hub_word, slot_word, ObjectModel},
    region::MemoryRegion,
    root_scanner::{GlobalRoots, RootProvider},
    safepoint::GlobalSafepoint,
    scavenger::{CollectorState, Scavenger},
    side_table::SideTable,
    statistics::{HeapStatistics, PhaseTimes},
    verifier::HeapVerifier,
};

/// Immortal regions laid out in front of the belts. Their cells are never
/// moved nor reclaimed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImmortalSpace {
    /// Boot image objects.
    Boot,
    /// Reference-literal tables of compiled code.
    Code,
}

/// Points at which collection listeners are invoked. Both run on the
/// collector thread while mutators are stopped and allocation outside of
/// mutators is blocked, so listeners must not allocate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectionPhase {
    Before,
    After,
}

pub type CollectionListener = Box<dyn Fn(CollectionPhase, &Heap) + Send + Sync>;

/// A belt-based copying heap.
///
/// The backing memory is one reservation laid out as
/// `[boot | code | belt 0 | belt 1 | ...]`. One card table covers all of it;
/// a side table covers the immortal part so dirty cards can be parsed.
pub struct Heap {
    config: Config,
    model: Arc<dyn ObjectModel>,
    belts: BeltManager,
    boot: Belt,
    code: Belt,
    cards: CardTable,
    side_table: SideTable,
    safepoint: GlobalSafepoint,
    barrier: Arc<CollectionBarrier>,
    scavenger: Scavenger,
    globals: GlobalRoots,
    root_providers: RwLock<Vec<Box<dyn RootProvider>>>,
    listeners: RwLock<Vec<CollectionListener>>,
    statistics: Mutex<HeapStatistics>,
    cycle_lock: Mutex<()>,
    /// Shared by threads allocating without a mutator, held exclusively by a
    /// collection cycle.
    allocation_gate: RwLock<()>,
    next_mutator_id: AtomicUsize,
    collector_thread: Mutex<Option<JoinHandle<()>>>,
    backing: Mmap,
}

impl Heap {
    /// Reserves the backing memory, partitions it and starts the collector
    /// thread.
    pub fn new(config: Config, model: Arc<dyn ObjectModel>) -> HeapResult<Arc<Self>> {
        config.validate()?;
        let heap_size = Config::page_rounded(config.heap_size);
        let boot_size = Config::page_rounded(config.boot_region_size);
        let code_size = Config::page_rounded(config.code_region_size);
        let immortal_size = boot_size + code_size;

        let backing = Mmap::new(immortal_size + heap_size)?;
        let boot = Belt::new(MemoryRegion::new("Boot-Heap", backing.start(), boot_size), 0);
        let code = Belt::new(MemoryRegion::new("Code", boot.end(), code_size), 1);
        let belts = BeltManager::new(code.end(), heap_size, &config.belt_layout)?;

        let mut regions = vec![boot.region().clone(), code.region().clone()];
        regions.extend(belts.belts().iter().map(|b| b.region().clone()));
        check_disjoint(&regions)?;

        let cards = CardTable::new(MemoryRegion::new(
            "Card-Covered",
            backing.start(),
            backing.size(),
        ))?;
        let side_table = SideTable::new(MemoryRegion::new(
            "Immortal",
            backing.start(),
            immortal_size,
        ));

        let heap = Arc::new(Self {
            scavenger: Scavenger::new(config.scavenge_mode),
            model,
            belts,
            boot,
            code,
            cards,
            side_table,
            safepoint: GlobalSafepoint::new(),
            barrier: Arc::new(CollectionBarrier::new()),
            globals: GlobalRoots::new(),
            root_providers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            statistics: Mutex::new(HeapStatistics::default()),
            cycle_lock: Mutex::new(()),
            allocation_gate: RwLock::new(()),
            next_mutator_id: AtomicUsize::new(1),
            collector_thread: Mutex::new(None),
            backing,
            config,
        });

        let barrier = heap.barrier.clone();
        let weak = Arc::downgrade(&heap);
        let handle = std::thread::Builder::new()
            .name("beltway-collector".to_string())
            .spawn(move || CollectionBarrier::run_collector_thread(barrier, weak))
            .map_err(|err| {
                HeapError::Configuration(format!("unable to spawn the collector thread: {}", err))
            })?;
        *heap.collector_thread.lock() = Some(handle);

        logln_if!(
            heap.config.verbose,
            "[beltway] heap of {} bytes at {}, {:?} scavenging",
            heap.backing.size(),
            heap.backing.start(),
            heap.config.scavenge_mode
        );
        if heap.config.verbose {
            heap.log_belts_info();
        }
        Ok(heap)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn object_model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    pub fn belt_manager(&self) -> &BeltManager {
        &self.belts
    }

    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    pub fn side_table(&self) -> &SideTable {
        &self.side_table
    }

    pub fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    pub fn scavenger(&self) -> &Scavenger {
        &self.scavenger
    }

    pub(crate) fn backing(&self) -> &Mmap {
        &self.backing
    }

    pub(crate) fn cycle_lock(&self) -> &Mutex<()> {
        &self.cycle_lock
    }

    pub(crate) fn allocation_gate(&self) -> &RwLock<()> {
        &self.allocation_gate
    }

    pub fn immortal(&self, space: ImmortalSpace) -> &Belt {
        match space {
            ImmortalSpace::Boot => &self.boot,
            ImmortalSpace::Code => &self.code,
        }
    }

    pub fn immortal_spaces(&self) -> [&Belt; 2] {
        [&self.boot, &self.code]
    }

    pub fn collector_state(&self) -> CollectorState {
        self.scavenger.state()
    }

    pub fn is_halted(&self) -> bool {
        self.safepoint.is_halted()
    }

    /// Attaches the calling thread as a mutator.
    pub fn attach_mutator(self: &Arc<Self>) -> HeapResult<Mutator> {
        if self.is_halted() {
            return Err(HeapError::Halted);
        }
        let id = self.next_mutator_id.fetch_add(1, Ordering::Relaxed);
        let data = Arc::new(MutatorData::new(id));
        self.safepoint.register(data.clone());
        let mutator = Mutator::new(self.clone(), data.clone());
        self.safepoint.leave_native(&data)?;
        Ok(mutator)
    }

    /// Spawns a thread running `callback` with its own mutator. The mutator
    /// is registered before the thread starts so a collection cannot miss it.
    pub fn spawn_mutator<F, R>(self: &Arc<Self>, callback: F) -> HeapResult<JoinHandle<R>>
    where
        F: FnOnce(&mut Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.next_mutator_id.fetch_add(1, Ordering::Relaxed);
        let data = Arc::new(MutatorData::new(id));
        self.safepoint.register(data.clone());
        let mut mutator = Mutator::new(self.clone(), data.clone());
        std::thread::Builder::new()
            .name(format!("beltway-mutator-{}", id))
            .spawn(move || {
                if let Err(err) = mutator.heap().safepoint().leave_native(&data) {
                    log::warn!("mutator {} attached to a halted heap: {}", id, err);
                }
                callback(&mut mutator)
            })
            .map_err(|err| HeapError::Configuration(format!("unable to spawn mutator: {}", err)))
    }

    /// Allocates a cell of `size` bytes from the allocation belt for a thread
    /// that is not attached as a mutator, collecting when the belt is
    /// exhausted.
    ///
    /// `init` must turn the memory into a valid cell. It runs before any
    /// collection can start, so a cycle never sees the cell half built; it
    /// must not block nor call back into the heap. Unless `init` makes the
    /// cell reachable, the next collection reclaims it.
    ///
    /// Must not be called by a thread attached as a mutator; mutators
    /// allocate through [`Mutator::allocate`].
    pub fn allocate(&self, size: usize, init: impl FnOnce(Address)) -> HeapResult<Address> {
        let size = checked_align_up(size, OBJECT_ALIGNMENT)
            .ok_or_else(|| self.out_of_memory(size))?;
        if size > self.belts.largest_belt_size() {
            return Err(self.out_of_memory(size));
        }
        if self.config.gc_before_allocation {
            self.collect_as(None, size)?;
        }
        for attempt in 0..2 {
            {
                let _gate = self.allocation_gate.read();
                if self.is_halted() {
                    return Err(HeapError::Halted);
                }
                if let Some(result) = self.belts.from_space().allocate(size) {
                    init(result);
                    return Ok(result);
                }
            }
            if attempt == 0 {
                log::debug!("allocation of {} bytes outside of a mutator, collecting", size);
                self.collect_as(None, size)?;
            }
        }
        Err(self.out_of_memory(size))
    }

    /// Like [`Heap::allocate`] but treats failure as fatal.
    pub fn allocate_or_abort(&self, size: usize, init: impl FnOnce(Address)) -> Address {
        match self.allocate(size, init) {
            Ok(result) => result,
            Err(err) => fatal(&self.diagnostics(), &err),
        }
    }

    /// Mutator slow path. Reserves at least `min` and preferably `preferred`
    /// bytes. Returns the address and the number of bytes granted.
    pub(crate) fn allocate_in_belt(
        &self,
        requester: &MutatorData,
        min: usize,
        preferred: usize,
    ) -> HeapResult<(Address, usize)> {
        if self.is_halted() {
            return Err(HeapError::Halted);
        }
        if min > self.belts.largest_belt_size() {
            return Err(self.out_of_memory(min));
        }
        if self.config.gc_before_allocation {
            self.collect_as(Some(requester), min)?;
        }
        for attempt in 0..2 {
            let from = self.belts.from_space();
            if let Some(result) = from.allocate(preferred) {
                return Ok((result, preferred));
            }
            if min != preferred {
                if let Some(result) = from.allocate(min) {
                    return Ok((result, min));
                }
            }
            if attempt == 0 {
                log::debug!(
                    "{} exhausted by a request of {} bytes, collecting",
                    from.name(),
                    min
                );
                self.collect_as(Some(requester), min)?;
            }
        }
        Err(self.out_of_memory(min))
    }

    pub(crate) fn out_of_memory(&self, requested: usize) -> HeapError {
        HeapError::OutOfMemory {
            requested,
            free: self.report_free_space(),
        }
    }

    /// Allocates a cell in an immortal region, builds it with `init` and
    /// records its start in the side table. Immortal memory is never
    /// collected. The same rules as for [`Heap::allocate`] apply to `init`.
    pub fn allocate_immortal(
        &self,
        space: ImmortalSpace,
        size: usize,
        init: impl FnOnce(Address),
    ) -> HeapResult<Address> {
        let belt = self.immortal(space);
        let _gate = self.allocation_gate.read();
        let result = belt.allocate(size).ok_or(HeapError::OutOfMemory {
            requested: size,
            free: belt.free_space(),
        })?;
        init(result);
        self.side_table.record_cell_start(result);
        Ok(result)
    }

    /// Whether `addr` lies in one of the belts.
    pub fn contains(&self, addr: Address) -> bool {
        self.belts.contains(addr)
    }

    /// Whether `addr` lies in the allocated part of a belt.
    pub fn contains_in_allocated(&self, addr: Address) -> bool {
        self.belts.contains_in_allocated(addr)
    }

    pub fn is_immortal(&self, addr: Address) -> bool {
        self.boot.contains(addr) || self.code.contains(addr)
    }

    pub fn is_immortal_allocated(&self, addr: Address) -> bool {
        self.boot.contains_in_allocated(addr) || self.code.contains_in_allocated(addr)
    }

    /// Runs one collection and reports whether at least `requested` bytes are
    /// free afterwards.
    ///
    /// Must not be called by a thread attached as a mutator; use
    /// [`Mutator::collect`] there.
    pub fn collect(&self, requested: usize) -> HeapResult<bool> {
        self.collect_as(None, requested)
    }

    pub(crate) fn collect_as(
        &self,
        requester: Option<&MutatorData>,
        requested: usize,
    ) -> HeapResult<bool> {
        if let Some(mutator) = requester {
            self.safepoint.enter_native(mutator);
        }
        let result = self.barrier.request_collection(self, requested);
        let resumed = match requester {
            Some(mutator) => self.safepoint.leave_native(mutator),
            None => Ok(()),
        };
        result?;
        resumed?;
        Ok(self.report_free_space() >= requested)
    }

    /// Reference store with write barrier: marks the card covering `slot`.
    pub fn write_reference(&self, slot: Address, value: Address) {
        slot_word(slot).store(value.to_usize(), Ordering::Release);
        self.cards.mark(slot);
    }

    pub fn read_reference(&self, slot: Address) -> Address {
        Address::from(slot_word(slot).load(Ordering::Acquire))
    }

    /// Calls `visitor` with every non-filler cell of the allocation belt.
    /// Only meaningful while no mutator allocates.
    pub fn visit_cells(&self, mut visitor: impl FnMut(Address)) {
        let model = self.object_model();
        let from = self.belts.from_space();
        let mut cell = from.start();
        while cell < from.allocation_mark() {
            let hub = hub_word(model, cell).load(Ordering::Acquire);
            if !model.is_valid_hub(hub) {
                log::warn!("unparseable cell at {} in {}", cell, from.name());
                return;
            }
            if !model.is_filler(hub) {
                visitor(cell);
            }
            cell = cell.offset(model.size_of(cell, hub));
        }
    }

    /// Registers a global root slot.
    pub fn add_global_root(&self, slot: Address) {
        self.globals.add(slot);
    }

    pub fn remove_global_root(&self, slot: Address) -> bool {
        self.globals.remove(slot)
    }

    pub fn add_root_provider(&self, provider: Box<dyn RootProvider>) {
        self.root_providers.write().push(provider);
    }

    pub(crate) fn visit_root_providers(&self, visitor: &mut dyn FnMut(Address)) {
        self.globals.visit_roots(visitor);
        for provider in self.root_providers.read().iter() {
            provider.visit_roots(visitor);
        }
    }

    pub fn add_collection_listener(&self, listener: CollectionListener) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn notify_listeners(&self, phase: CollectionPhase) {
        for listener in self.listeners.read().iter() {
            listener(phase, self);
        }
    }

    /// Stops the world and verifies the allocation belt, the immortal regions
    /// and all roots. Must not be called by a thread attached as a mutator.
    pub fn verify(&self) -> Vec<HeapError> {
        let _cycle = self.cycle_lock.lock();
        self.safepoint.suspend_all_mutators();
        let errors = {
            let _gate = self.allocation_gate.write();
            self.safepoint
                .for_each_mutator(|mutator| mutator.tlab.retire(self.object_model()));
            HeapVerifier::new(self, "on request").verify_all(self.belts.from_space())
        };
        self.safepoint.resume_all_mutators();
        errors
    }

    pub(crate) fn handle_verification_errors(&self, errors: Vec<HeapError>) {
        if errors.is_empty() {
            return;
        }
        match self.config.verification_policy {
            VerificationPolicy::Abort => fatal(&self.diagnostics(), &errors[0]),
            VerificationPolicy::Log => {
                for err in &errors {
                    log::warn!("{}", err);
                }
                self.statistics.lock().verification_failures += errors.len();
            }
        }
    }

    pub(crate) fn record_cycle(&self, times: PhaseTimes, objects: usize, bytes: usize) {
        let mut statistics = self.statistics.lock();
        statistics.total_gc_cycles_count += 1;
        statistics.total_objects_copied += objects;
        statistics.total_bytes_copied += bytes;
        statistics.last_objects_copied = objects;
        statistics.last_bytes_copied = bytes;
        statistics.last_cycle = times;
        statistics.accumulated.accumulate(&times);
    }

    pub fn collection_count(&self) -> usize {
        self.statistics.lock().total_gc_cycles_count
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut statistics = self.statistics.lock().clone();
        let from = self.belts.from_space();
        statistics.heap_size = self.belts.end().offset_from(self.belts.start());
        statistics.number_of_belts = self.belts.number_of_belts();
        statistics.from_space_name = from.name();
        statistics.from_space_size = from.size();
        statistics.from_space_used = from.used_space();
        statistics.immortal_size = self.boot.size() + self.code.size();
        statistics.immortal_used = self.boot.used_space() + self.code.used_space();
        statistics
    }

    /// Free bytes in the allocation belt.
    pub fn report_free_space(&self) -> usize {
        self.belts.report_free_space()
    }

    pub fn report_used_space(&self) -> usize {
        self.belts.report_used_space()
    }

    pub fn log_belts_info(&self) {
        log::info!("{:?}", self.boot);
        log::info!("{:?}", self.code);
        self.belts.log_belts_info();
    }

    /// Heap state dump used by fatal error reports.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "collector state: {:?}", self.collector_state());
        let _ = writeln!(out, "{:?}", self.boot);
        let _ = writeln!(out, "{:?}", self.code);
        for belt in self.belts.belts() {
            let _ = writeln!(out, "{:?} role={:?}", belt, self.belts.role_of(belt.index()));
        }
        if let Some(statistics) = self.statistics.try_lock() {
            let _ = write!(out, "{}", *statistics);
        }
        out
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.barrier.notify_shutdown_requested();
        if let Some(handle) = self.collector_thread.lock().take() {
            // The collector thread may hold the last reference itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BeltLayout,
        object::{Hub, StandardObjectModel},
    };

    const MB: usize = 1024 * 1024;

    fn small_heap() -> Arc<Heap> {
        let mut config = Config::default();
        config.heap_size = 2 * MB;
        config.belt_layout = BeltLayout::SemiSpace;
        config.boot_region_size = 64 * 1024;
        config.code_region_size = 0;
        Heap::new(config, Arc::new(StandardObjectModel::new())).unwrap()
    }

    #[test]
    fn regions_are_laid_out_back_to_back() {
        let heap = small_heap();
        let boot = heap.immortal(ImmortalSpace::Boot);
        let code = heap.immortal(ImmortalSpace::Code);
        assert_eq!(code.size(), 0);
        assert_eq!(boot.end(), code.start());
        assert_eq!(code.end(), heap.belt_manager().start());
        assert_eq!(heap.belt_manager().belt(0).size(), MB);
        assert!(heap.contains(heap.belt_manager().start()));
        assert!(!heap.contains(boot.start()));
        assert!(heap.is_immortal(boot.start()));
    }

    #[test]
    fn write_barrier_dirties_the_card() {
        let heap = small_heap();
        let model = StandardObjectModel::new();
        let size = StandardObjectModel::cell_size(1, 0);
        let holder = heap
            .allocate_immortal(ImmortalSpace::Boot, size, |cell| unsafe {
                model.initialize(cell, Hub(4), size, 1)
            })
            .unwrap();
        let slot = StandardObjectModel::reference_slot(holder, 0);
        assert!(!heap.card_table().is_dirty_at(slot));
        let target = heap
            .allocate(size, |cell| unsafe { model.initialize(cell, Hub(4), size, 1) })
            .unwrap();
        heap.write_reference(slot, target);
        assert!(heap.card_table().is_dirty_at(slot));
        assert_eq!(heap.read_reference(slot), target);
    }

    #[test]
    fn invalid_configuration_is_rejected_before_mapping() {
        let mut config = Config::default();
        config.belt_layout = BeltLayout::Percentages(vec![70, 20]);
        let result = Heap::new(config, Arc::new(StandardObjectModel::new()));
        assert!(matches!(result, Err(HeapError::Configuration(_))));
    }

    #[test]
    fn listeners_see_both_phases() {
        let heap = small_heap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        heap.add_collection_listener(Box::new(move |phase, heap| {
            sink.lock().push((phase, heap.collector_state()));
        }));
        assert!(heap.collect(0).unwrap());
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, CollectionPhase::Before);
        assert_eq!(seen[1], (CollectionPhase::After, CollectorState::Swapped));
        assert_eq!(heap.collector_state(), CollectorState::Idle);
        assert_eq!(heap.collection_count(), 1);
    }
}
