use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{HeapError, HeapResult},
    heap::Heap,
};

struct BarrierState {
    requested: bool,
    in_progress: bool,
    shutdown: bool,
    /// Number of cycles the collector thread has started.
    started: u64,
    /// Number of cycles the collector thread has finished.
    completed: u64,
    last_result: HeapResult<()>,
}

/// Serializes collection requests and hands them to the collector thread.
///
/// Requesters block until the cycle they asked for has finished. A request
/// arriving while a cycle runs waits for it, then re-checks the free space
/// before asking for another one, so cycles never nest.
pub struct CollectionBarrier {
    state: Mutex<BarrierState>,
    cv_wakeup: Condvar,
    cv_done: Condvar,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                requested: false,
                in_progress: false,
                shutdown: false,
                started: 0,
                completed: 0,
                last_result: Ok(()),
            }),
            cv_wakeup: Condvar::new(),
            cv_done: Condvar::new(),
        }
    }

    /// Asks the collector thread for a cycle and waits for its outcome.
    pub fn request_collection(&self, heap: &Heap, requested_free_space: usize) -> HeapResult<()> {
        let mut state = self.state.lock();
        while state.in_progress && !state.shutdown {
            let running = state.started;
            while state.completed < running && !state.shutdown {
                self.cv_done.wait(&mut state);
            }
            state.last_result.clone()?;
            if heap.report_free_space() >= requested_free_space {
                return Ok(());
            }
        }
        if state.shutdown {
            return Err(HeapError::Halted);
        }
        state.requested = true;
        let target = state.started + 1;
        self.cv_wakeup.notify_one();
        while state.completed < target && !state.shutdown {
            self.cv_done.wait(&mut state);
        }
        if state.completed < target {
            return Err(HeapError::Halted);
        }
        state.last_result.clone()
    }

    pub fn notify_shutdown_requested(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cv_wakeup.notify_all();
        self.cv_done.notify_all();
    }

    /// Body of the collector thread: waits for requests and runs one cycle per
    /// request until shutdown. Only a weak handle to the heap is kept so an
    /// idle collector thread does not keep the heap alive.
    pub(crate) fn run_collector_thread(barrier: Arc<CollectionBarrier>, heap: Weak<Heap>) {
        loop {
            {
                let mut state = barrier.state.lock();
                while !state.requested && !state.shutdown {
                    barrier.cv_wakeup.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                state.requested = false;
                state.in_progress = true;
                state.started += 1;
            }
            let result = match heap.upgrade() {
                Some(heap) => heap.scavenger().collect(&heap),
                None => Err(HeapError::Halted),
            };
            let mut state = barrier.state.lock();
            state.in_progress = false;
            state.completed += 1;
            state.last_result = result;
            barrier.cv_done.notify_all();
        }
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
