use std::sync::{atomic::AtomicBool, Arc};

use atomic::Ordering;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{HeapError, HeapResult},
    mutator::{MutatorData, ThreadState},
};

struct SafepointInner {
    mutators: Vec<Arc<MutatorData>>,
    halted: bool,
}

/// Used to bring all threads with heap access to a safepoint such that a
/// collection can be performed.
///
/// A mutator is stopped when it is `Parked` (waiting inside a poll) or
/// `Native` (not touching the heap, e.g. blocked on a collection request).
/// The collector only proceeds once no registered mutator is `Running`.
pub struct GlobalSafepoint {
    gc_running: AtomicBool,
    inner: Mutex<SafepointInner>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            gc_running: AtomicBool::new(false),
            inner: Mutex::new(SafepointInner {
                mutators: Vec::new(),
                halted: false,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    /// Fast check used by mutator polls.
    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.gc_running.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.inner.lock().halted
    }

    pub fn number_of_mutators(&self) -> usize {
        self.inner.lock().mutators.len()
    }

    /// Registers a mutator in the `Native` state; it becomes `Running` through
    /// [`GlobalSafepoint::leave_native`].
    pub(crate) fn register(&self, mutator: Arc<MutatorData>) {
        let mut inner = self.inner.lock();
        mutator.state.store(ThreadState::Native, Ordering::Release);
        inner.mutators.push(mutator);
    }

    pub(crate) fn unregister(&self, mutator: &MutatorData) {
        let mut inner = self.inner.lock();
        inner.mutators.retain(|m| m.id != mutator.id);
        self.cv_stopped.notify_all();
    }

    /// Parks the calling mutator until the pending collection finished.
    #[cold]
    #[inline(never)]
    pub(crate) fn park(&self, mutator: &MutatorData) -> HeapResult<()> {
        let inner = self.inner.lock();
        mutator.state.store(ThreadState::Parked, Ordering::Release);
        self.cv_stopped.notify_all();
        self.wait_for_resume(inner, mutator)
    }

    pub(crate) fn enter_native(&self, mutator: &MutatorData) {
        let _inner = self.inner.lock();
        mutator.state.store(ThreadState::Native, Ordering::Release);
        self.cv_stopped.notify_all();
    }

    pub(crate) fn leave_native(&self, mutator: &MutatorData) -> HeapResult<()> {
        let inner = self.inner.lock();
        self.wait_for_resume(inner, mutator)
    }

    fn wait_for_resume(
        &self,
        mut inner: MutexGuard<'_, SafepointInner>,
        mutator: &MutatorData,
    ) -> HeapResult<()> {
        while self.gc_running.load(Ordering::Acquire) && !inner.halted {
            self.cv_resume.wait(&mut inner);
        }
        if inner.halted {
            return Err(HeapError::Halted);
        }
        mutator.state.store(ThreadState::Running, Ordering::Release);
        Ok(())
    }

    /// Blocks until every registered mutator is stopped. Mutators arriving at
    /// a poll afterwards park until [`GlobalSafepoint::resume_all_mutators`].
    pub fn suspend_all_mutators(&self) {
        let mut inner = self.inner.lock();
        self.gc_running.store(true, Ordering::Release);
        while inner
            .mutators
            .iter()
            .any(|m| m.state.load(Ordering::Acquire) == ThreadState::Running)
        {
            self.cv_stopped.wait(&mut inner);
        }
    }

    pub fn resume_all_mutators(&self) {
        let inner = self.inner.lock();
        if inner.halted {
            return;
        }
        self.gc_running.store(false, Ordering::Release);
        self.cv_resume.notify_all();
    }

    /// Stops the world for good. Waiting mutators wake up with
    /// [`HeapError::Halted`] and never run heap code again.
    pub fn halt(&self) {
        let mut inner = self.inner.lock();
        inner.halted = true;
        self.gc_running.store(true, Ordering::Release);
        self.cv_resume.notify_all();
    }

    /// Visits every registered mutator. Only meaningful while the world is
    /// stopped.
    pub(crate) fn for_each_mutator(&self, mut visitor: impl FnMut(&MutatorData)) {
        let inner = self.inner.lock();
        for mutator in inner.mutators.iter() {
            visitor(mutator);
        }
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}
