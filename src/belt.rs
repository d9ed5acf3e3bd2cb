use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    address::{checked_align_up, Address, OBJECT_ALIGNMENT, WORD_SIZE},
    config::WipePolicy,
    mmap::Mmap,
    region::MemoryRegion,
};

/// Pattern written over a vacated belt so stale reads stand out.
pub const WIPE_PATTERN: usize = 0xdead_beef_dead_beef_u64 as usize;

/// A bump-allocated memory region. The allocation mark only moves forward
/// between two calls of [`Belt::reset_allocation_mark`].
pub struct Belt {
    region: MemoryRegion,
    index: usize,
    mark: AtomicUsize,
}

impl Belt {
    pub fn new(region: MemoryRegion, index: usize) -> Self {
        let mark = AtomicUsize::new(region.start().to_usize());
        Self {
            region,
            index,
            mark,
        }
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }
    pub fn name(&self) -> &'static str {
        self.region.name()
    }
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn start(&self) -> Address {
        self.region.start()
    }
    pub fn end(&self) -> Address {
        self.region.end()
    }
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn allocation_mark(&self) -> Address {
        Address::from(self.mark.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    /// Like [`Belt::contains`] but restricted to `[start, allocation_mark)`.
    #[inline]
    pub fn contains_in_allocated(&self, addr: Address) -> bool {
        addr >= self.start() && addr < self.allocation_mark()
    }

    pub fn free_space(&self) -> usize {
        self.end().offset_from(self.allocation_mark())
    }

    pub fn used_space(&self) -> usize {
        self.allocation_mark().offset_from(self.start())
    }

    /// Reserves `size` bytes (rounded up to the object alignment) at the
    /// allocation mark. Returns `None` without side effects when the request
    /// does not fit (absurd sizes included); a request that exactly fills the belt succeeds.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let size = checked_align_up(size, OBJECT_ALIGNMENT)?;
        let end = self.end().to_usize();
        let mut old = self.mark.load(Ordering::Relaxed);
        loop {
            let new = old.checked_add(size)?;
            if new > end {
                return None;
            }
            match self
                .mark
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(Address::from(old)),
                Err(x) => old = x,
            }
        }
    }

    /// Single-threaded variant of [`Belt::allocate`].
    ///
    /// # Safety
    /// No other thread may allocate from this belt concurrently.
    pub unsafe fn allocate_unsynchronized(&self, size: usize) -> Option<Address> {
        let size = checked_align_up(size, OBJECT_ALIGNMENT)?;
        let old = self.mark.load(Ordering::Relaxed);
        let new = old.checked_add(size)?;
        if new > self.end().to_usize() {
            return None;
        }
        self.mark.store(new, Ordering::Release);
        Some(Address::from(old))
    }

    /// Only legal on a belt that holds no live objects.
    pub fn reset_allocation_mark(&self) {
        self.mark.store(self.start().to_usize(), Ordering::Release);
    }

    /// Overwrites the whole belt according to `policy`.
    pub fn wipe(&self, policy: WipePolicy, backing: &Mmap) {
        match policy {
            WipePolicy::Skip => {}
            WipePolicy::Decommit => backing.dontneed(self.start(), self.size()),
            WipePolicy::Pattern => unsafe {
                let mut cursor = self.start();
                while cursor < self.end() {
                    cursor.store_word(WIPE_PATTERN);
                    cursor = cursor.offset(WORD_SIZE);
                }
            },
        }
    }
}

impl fmt::Debug for Belt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Belt #{} {:?} mark={} free={}",
            self.index,
            self.region,
            self.allocation_mark(),
            self.free_space()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::align_up;
    use proptest::prelude::*;

    fn belt_over(map: &Mmap) -> Belt {
        Belt::new(MemoryRegion::new("test", map.start(), map.size()), 0)
    }

    #[test]
    fn exact_fit_succeeds() {
        let map = Mmap::new(4096).unwrap();
        let belt = belt_over(&map);
        assert!(belt.allocate(4000).is_some());
        assert_eq!(belt.free_space(), 96);
        assert!(belt.allocate(97).is_none());
        assert_eq!(belt.free_space(), 96);
        assert!(belt.allocate(96).is_some());
        assert_eq!(belt.free_space(), 0);
        assert!(belt.allocate(1).is_none());
    }

    #[test]
    fn sizes_are_aligned() {
        let map = Mmap::new(4096).unwrap();
        let belt = belt_over(&map);
        let a = belt.allocate(3).unwrap();
        let b = belt.allocate(9).unwrap();
        assert_eq!(b.offset_from(a), OBJECT_ALIGNMENT);
        assert_eq!(belt.used_space(), OBJECT_ALIGNMENT + 16);
        assert!(belt.contains_in_allocated(b));
        assert!(!belt.contains_in_allocated(belt.allocation_mark()));
        belt.reset_allocation_mark();
        assert_eq!(belt.used_space(), 0);
    }

    #[test]
    fn absurd_sizes_do_not_overflow() {
        let map = Mmap::new(4096).unwrap();
        let belt = belt_over(&map);
        assert!(belt.allocate(usize::MAX).is_none());
        assert!(belt.allocate(usize::MAX - 3).is_none());
        assert!(unsafe { belt.allocate_unsynchronized(usize::MAX) }.is_none());
        assert_eq!(belt.used_space(), 0);
    }

    #[test]
    fn wipe_with_pattern() {
        let map = Mmap::new(4096).unwrap();
        let belt = belt_over(&map);
        belt.wipe(WipePolicy::Pattern, &map);
        unsafe {
            assert_eq!(belt.start().load_word(), WIPE_PATTERN);
            assert_eq!(belt.end().sub(WORD_SIZE).load_word(), WIPE_PATTERN);
        }
    }

    #[test]
    fn concurrent_allocation_never_overlaps() {
        let map = Mmap::new(64 * 1024).unwrap();
        let belt = belt_over(&map);
        let mut all = crossbeam_utils::thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|_| {
                        let mut mine = Vec::new();
                        while let Some(addr) = belt.allocate(64) {
                            mine.push(addr);
                        }
                        mine
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();
        all.sort();
        assert_eq!(all.len(), 1024);
        for pair in all.windows(2) {
            assert_eq!(pair[1].offset_from(pair[0]), 64);
        }
    }

    proptest! {
        #[test]
        fn allocation_is_monotonic(sizes in proptest::collection::vec(1usize..512, 1..64)) {
            let map = Mmap::new(16 * 1024).unwrap();
            let belt = belt_over(&map);
            let mut last_end = belt.start();
            for size in sizes {
                let before = belt.allocation_mark();
                match belt.allocate(size) {
                    Some(addr) => {
                        prop_assert!(addr >= last_end);
                        last_end = addr.offset(align_up(size, OBJECT_ALIGNMENT));
                        prop_assert_eq!(belt.allocation_mark(), last_end);
                    }
                    None => prop_assert_eq!(belt.allocation_mark(), before),
                }
                prop_assert!(belt.allocation_mark() >= before);
                prop_assert!(belt.allocation_mark() <= belt.end());
            }
        }
    }
}
