//! Belt-based copying garbage collector.
//!
//! The heap partitions one contiguous reservation into *belts*: bump-allocated
//! regions of which one serves allocation (FROM) and one is kept empty as the
//! copy reserve (TO). When the allocation belt is exhausted, a stop-the-world
//! scavenge copies every live cell into the reserve, wipes the evacuated belt
//! and swaps the two roles. Immortal regions for the boot image and code
//! literal tables sit in front of the belts and are rescanned through a card
//! table.
//!
//! ```no_run
//! use std::sync::Arc;
//! use beltway::{Config, Heap, Hub, StandardObjectModel};
//!
//! let heap = Heap::new(Config::default(), Arc::new(StandardObjectModel::new())).unwrap();
//! let mut mutator = heap.attach_mutator().unwrap();
//! let size = StandardObjectModel::cell_size(1, 0);
//! let cell = mutator.allocate(size).unwrap();
//! unsafe { StandardObjectModel::new().initialize(cell, Hub(2), size, 1) };
//! let root = mutator.push_root(cell);
//! mutator.collect(0).unwrap();
//! assert!(heap.contains(mutator.root(root)));
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod address;
pub mod belt;
pub mod belt_manager;
pub mod card_table;
pub mod collection_barrier;
pub mod config;
pub mod error;
pub mod heap;
pub mod mmap;
pub mod mutator;
pub mod object;
pub mod region;
pub mod root_scanner;
pub mod safepoint;
pub mod scavenger;
pub mod side_table;
pub mod statistics;
pub mod tlab;
pub mod verifier;

pub use address::Address;
pub use config::{BeltLayout, Config, ScavengeMode, VerificationPolicy, WipePolicy};
pub use error::{HeapError, HeapResult};
pub use heap::{CollectionPhase, Heap, ImmortalSpace};
pub use mutator::{Mutator, ThreadState};
pub use object::{Hub, ObjectModel, StandardObjectModel};
pub use root_scanner::RootProvider;
pub use scavenger::CollectorState;
pub use statistics::HeapStatistics;

pub mod c_api {
    //! C surface over a heap using [`StandardObjectModel`].

    use std::{ptr::null_mut, sync::Arc};

    use crate::{
        address::Address,
        config::{Config, ScavengeMode},
        error::{fatal, HeapError, HeapResult},
        heap::Heap,
        object::{Hub, StandardObjectModel},
    };

    #[repr(C)]
    #[derive(Clone, Copy, Debug)]
    pub struct BeltwayConfig {
        pub heap_size: usize,
        pub boot_region_size: usize,
        pub code_region_size: usize,
        /// Zero selects the sequential scavenger.
        pub parallel_workers: usize,
        pub verify: bool,
        pub verbose: bool,
    }

    impl From<BeltwayConfig> for Config {
        fn from(config: BeltwayConfig) -> Self {
            let mut result = Config::default();
            result.heap_size = config.heap_size;
            result.boot_region_size = config.boot_region_size;
            result.code_region_size = config.code_region_size;
            result.scavenge_mode = match config.parallel_workers {
                0 => ScavengeMode::Sequential,
                workers => ScavengeMode::Parallel { workers },
            };
            result.verify_before_gc = config.verify;
            result.verify_after_gc = config.verify;
            result.verbose = config.verbose;
            result
        }
    }

    pub struct BeltwayHeap {
        heap: Arc<Heap>,
        model: StandardObjectModel,
    }

    #[no_mangle]
    pub extern "C" fn beltway_default_config() -> BeltwayConfig {
        let config = Config::default();
        BeltwayConfig {
            heap_size: config.heap_size,
            boot_region_size: config.boot_region_size,
            code_region_size: config.code_region_size,
            parallel_workers: 0,
            verify: false,
            verbose: false,
        }
    }

    /// Creates a heap. NULL is returned if the configuration is invalid.
    #[no_mangle]
    pub extern "C" fn beltway_heap_create(config: BeltwayConfig) -> *mut BeltwayHeap {
        match Heap::new(config.into(), Arc::new(StandardObjectModel::new())) {
            Ok(heap) => Box::into_raw(Box::new(BeltwayHeap {
                heap,
                model: StandardObjectModel::new(),
            })),
            Err(err) => {
                log::error!("unable to create heap: {}", err);
                null_mut()
            }
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_free(heap: *mut BeltwayHeap) {
        if !heap.is_null() {
            drop(Box::from_raw(heap));
        }
    }

    /// Registers a global root slot. The slot must stay valid until removed.
    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_add_root(heap: *mut BeltwayHeap, slot: *mut *mut u8) {
        (*heap).heap.add_global_root(Address::from_ptr(slot));
    }

    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_remove_root(
        heap: *mut BeltwayHeap,
        slot: *mut *mut u8,
    ) -> bool {
        (*heap).heap.remove_global_root(Address::from_ptr(slot))
    }

    fn allocate_cell(
        heap: &BeltwayHeap,
        type_id: u32,
        references: usize,
        payload: usize,
    ) -> HeapResult<Address> {
        let size = StandardObjectModel::checked_cell_size(references, payload)
            .ok_or_else(|| heap.heap.out_of_memory(usize::MAX))?;
        let hub = type_id
            .checked_add(Hub::FIRST_USER)
            .map(Hub)
            .ok_or_else(|| HeapError::Configuration(format!("type id {} out of range", type_id)))?;
        heap.heap.allocate(size, |cell| unsafe {
            heap.model.initialize(cell, hub, size, references)
        })
    }

    /// Allocates a cell with `references` null reference slots followed by
    /// `payload` bytes. NULL is returned if no memory is available or the
    /// requested shape does not fit the address space.
    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_allocate(
        heap: *mut BeltwayHeap,
        type_id: u32,
        references: usize,
        payload: usize,
    ) -> *mut u8 {
        match allocate_cell(&*heap, type_id, references, payload) {
            Ok(cell) => cell.to_mut_ptr(),
            Err(_) => null_mut(),
        }
    }

    /// Like [`beltway_heap_allocate`]. When no memory is left the process is
    /// aborted.
    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_allocate_or_fail(
        heap: *mut BeltwayHeap,
        type_id: u32,
        references: usize,
        payload: usize,
    ) -> *mut u8 {
        let heap = &*heap;
        match allocate_cell(heap, type_id, references, payload) {
            Ok(cell) => cell.to_mut_ptr(),
            Err(err) => fatal(&heap.heap.diagnostics(), &err),
        }
    }

    /// Stores `value` into reference slot `index` of `cell` through the write
    /// barrier.
    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_write_reference(
        heap: *mut BeltwayHeap,
        cell: *mut u8,
        index: usize,
        value: *mut u8,
    ) {
        let slot = StandardObjectModel::reference_slot(Address::from_ptr(cell), index);
        (*heap).heap.write_reference(slot, Address::from_ptr(value));
    }

    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_read_reference(cell: *mut u8, index: usize) -> *mut u8 {
        StandardObjectModel::read_reference(Address::from_ptr(cell), index).to_mut_ptr()
    }

    /// Runs a collection. Returns whether `requested` bytes are free
    /// afterwards; false as well when the heap is halted.
    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_collect(heap: *mut BeltwayHeap, requested: usize) -> bool {
        match (*heap).heap.collect(requested) {
            Ok(enough) => enough,
            Err(err) => {
                log::error!("collection failed: {}", err);
                false
            }
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_contains(heap: *mut BeltwayHeap, ptr: *const u8) -> bool {
        (*heap).heap.contains(Address::from_ptr(ptr))
    }

    #[no_mangle]
    pub unsafe extern "C" fn beltway_heap_free_space(heap: *mut BeltwayHeap) -> usize {
        (*heap).heap.report_free_space()
    }
}
