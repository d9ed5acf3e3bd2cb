use atomic::{Atomic, Ordering};

use crate::{
    address::{align_up, page_size, Address},
    belt::Belt,
    config::BeltLayout,
    error::{HeapError, HeapResult},
    region::MemoryRegion,
};

const BELT_NAMES: [&str; 8] = [
    "Heap-Belt-0",
    "Heap-Belt-1",
    "Heap-Belt-2",
    "Heap-Belt-3",
    "Heap-Belt-4",
    "Heap-Belt-5",
    "Heap-Belt-6",
    "Heap-Belt-7",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BeltRole {
    /// Serves allocation and is evacuated by the next scavenge.
    From,
    /// Copy reserve for the next scavenge.
    To,
    /// Not used by the copying scheme.
    Reserve,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
struct BeltRoles {
    from: u32,
    to: u32,
}

/// Owns the ordered set of belts and the FROM/TO role assignment.
pub struct BeltManager {
    belts: Vec<Belt>,
    roles: Atomic<BeltRoles>,
}

impl BeltManager {
    /// Partitions `[start, start + total)` into contiguous belts sized by the
    /// layout percentages. Every belt but the last is rounded up to the page
    /// size; the last one takes the remainder so no byte is left over.
    pub fn new(start: Address, total: usize, layout: &BeltLayout) -> HeapResult<Self> {
        let page = page_size();
        let percentages = layout.percentages();
        if percentages.len() < 2 {
            return Err(HeapError::Configuration(format!(
                "a copying heap needs at least two belts, got {}",
                percentages.len()
            )));
        }
        if percentages.len() > BELT_NAMES.len() {
            return Err(HeapError::Configuration(format!(
                "at most {} belts are supported, got {}",
                BELT_NAMES.len(),
                percentages.len()
            )));
        }
        if percentages.iter().sum::<usize>() != 100 {
            return Err(HeapError::Configuration(format!(
                "belt percentages {:?} do not sum to 100",
                percentages
            )));
        }
        if !start.is_aligned(page) || total % page != 0 {
            return Err(HeapError::Configuration(format!(
                "belt span [{}, +{:#x}) is not page aligned",
                start, total
            )));
        }

        let mut belts = Vec::with_capacity(percentages.len());
        let mut cursor = start;
        let end = start.offset(total);
        for (index, percentage) in percentages.iter().enumerate() {
            let last = index == percentages.len() - 1;
            let size = if last {
                if cursor >= end {
                    0
                } else {
                    end.offset_from(cursor)
                }
            } else {
                align_up(total * percentage / 100, page)
            };
            if size == 0 || cursor.offset(size) > end {
                return Err(HeapError::Configuration(format!(
                    "belt {} of layout {:?} gets no memory out of {} bytes",
                    index, percentages, total
                )));
            }
            belts.push(Belt::new(
                MemoryRegion::new(BELT_NAMES[index], cursor, size),
                index,
            ));
            cursor = cursor.offset(size);
        }

        let regions = belts.iter().map(|b| b.region().clone()).collect::<Vec<_>>();
        check_disjoint(&regions)?;

        Ok(Self {
            belts,
            roles: Atomic::new(BeltRoles { from: 0, to: 1 }),
        })
    }

    pub fn number_of_belts(&self) -> usize {
        self.belts.len()
    }

    pub fn belt(&self, index: usize) -> &Belt {
        &self.belts[index]
    }

    pub fn belts(&self) -> &[Belt] {
        &self.belts
    }

    /// Upper bound for a single allocation request.
    pub fn largest_belt_size(&self) -> usize {
        self.belts.iter().map(Belt::size).max().unwrap_or(0)
    }

    pub fn start(&self) -> Address {
        self.belts[0].start()
    }

    pub fn end(&self) -> Address {
        self.belts[self.belts.len() - 1].end()
    }

    pub fn role_of(&self, index: usize) -> BeltRole {
        let roles = self.roles.load(Ordering::Acquire);
        if roles.from as usize == index {
            BeltRole::From
        } else if roles.to as usize == index {
            BeltRole::To
        } else {
            BeltRole::Reserve
        }
    }

    /// Belt serving allocation.
    pub fn from_space(&self) -> &Belt {
        &self.belts[self.roles.load(Ordering::Acquire).from as usize]
    }

    /// Copy reserve.
    pub fn to_space(&self) -> &Belt {
        &self.belts[self.roles.load(Ordering::Acquire).to as usize]
    }

    /// Exchanges the FROM/TO labels of `from` and `to`. Memory is not touched.
    ///
    /// Panics if the belts do not currently hold the FROM and TO roles.
    pub fn swap_belts(&self, from: usize, to: usize) {
        let roles = self.roles.load(Ordering::Acquire);
        assert!(
            roles.from as usize == from && roles.to as usize == to,
            "swap_belts({}, {}) does not match the current roles {:?}",
            from,
            to,
            roles
        );
        self.roles.store(
            BeltRoles {
                from: to as u32,
                to: from as u32,
            },
            Ordering::Release,
        );
    }

    /// Belt containing `addr`, found by binary search over the sorted belts.
    pub fn find(&self, addr: Address) -> Option<&Belt> {
        if addr < self.start() || addr >= self.end() {
            return None;
        }
        let index = match self.belts.binary_search_by(|b| b.start().cmp(&addr)) {
            Ok(index) => index,
            Err(insert) => insert - 1,
        };
        let belt = &self.belts[index];
        if belt.contains(addr) {
            Some(belt)
        } else {
            None
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start() && addr < self.end()
    }

    pub fn contains_in_allocated(&self, addr: Address) -> bool {
        self.find(addr)
            .map(|belt| belt.contains_in_allocated(addr))
            .unwrap_or(false)
    }

    /// Free space available to the allocator, i.e. in the FROM belt.
    pub fn report_free_space(&self) -> usize {
        self.from_space().free_space()
    }

    pub fn report_used_space(&self) -> usize {
        self.from_space().used_space()
    }

    pub fn log_belts_info(&self) {
        for belt in &self.belts {
            log::info!("{:?} role={:?}", belt, self.role_of(belt.index()));
        }
    }
}

/// Fails with [`HeapError::RegionOverlap`] if two regions partially overlap.
pub fn check_disjoint(regions: &[MemoryRegion]) -> HeapResult<()> {
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            if a.overlaps(b) {
                return Err(HeapError::RegionOverlap {
                    first: a.name(),
                    second: b.name(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;
    use proptest::prelude::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn sixty_forty_split_spans_the_heap() {
        let map = Mmap::new(MB).unwrap();
        let manager =
            BeltManager::new(map.start(), MB, &BeltLayout::Percentages(vec![60, 40])).unwrap();
        let first = manager.belt(0);
        let second = manager.belt(1);
        assert_eq!(first.size(), align_up(MB * 60 / 100, page_size()));
        assert!(first.size() - MB * 60 / 100 < page_size());
        assert_eq!(first.size() + second.size(), MB);
        assert_eq!(first.end(), second.start());
        assert_eq!(first.start(), map.start());
        assert_eq!(second.end(), map.end());
    }

    #[test]
    fn rejects_bad_percentages() {
        let map = Mmap::new(MB).unwrap();
        assert!(BeltManager::new(map.start(), MB, &BeltLayout::Percentages(vec![50, 40])).is_err());
        assert!(BeltManager::new(map.start(), MB, &BeltLayout::Percentages(vec![100])).is_err());
        let page = page_size();
        // The first belt swallows the whole span, leaving nothing for the second.
        assert!(
            BeltManager::new(map.start(), page, &BeltLayout::Percentages(vec![99, 1])).is_err()
        );
    }

    #[test]
    fn find_classifies_addresses() {
        let map = Mmap::new(MB).unwrap();
        let manager = BeltManager::new(
            map.start(),
            MB,
            &BeltLayout::Percentages(vec![25, 25, 50]),
        )
        .unwrap();
        for belt in manager.belts() {
            assert_eq!(manager.find(belt.start()).unwrap().index(), belt.index());
            assert_eq!(
                manager.find(belt.end().sub(1)).unwrap().index(),
                belt.index()
            );
        }
        assert!(manager.find(map.end()).is_none());
        assert!(manager.find(map.start().sub(1)).is_none());
        assert_eq!(manager.role_of(2), BeltRole::Reserve);
        assert_eq!(manager.largest_belt_size(), MB / 2);
    }

    #[test]
    fn swap_twice_restores_roles() {
        let map = Mmap::new(MB).unwrap();
        let manager = BeltManager::new(map.start(), MB, &BeltLayout::SemiSpace).unwrap();
        let from = manager.from_space().index();
        let to = manager.to_space().index();
        manager.from_space().allocate(128).unwrap();
        manager.swap_belts(from, to);
        assert_eq!(manager.from_space().index(), to);
        assert_eq!(manager.role_of(from), BeltRole::To);
        manager.swap_belts(to, from);
        assert_eq!(manager.from_space().index(), from);
        assert_eq!(manager.to_space().index(), to);
        assert_eq!(manager.from_space().used_space(), 128);
    }

    #[test]
    #[should_panic]
    fn swap_with_wrong_roles_panics() {
        let map = Mmap::new(MB).unwrap();
        let manager = BeltManager::new(map.start(), MB, &BeltLayout::SemiSpace).unwrap();
        manager.swap_belts(1, 0);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let a = MemoryRegion::new("a", Address::from(0x1000), 0x2000);
        let b = MemoryRegion::new("b", Address::from(0x2000), 0x2000);
        assert_eq!(
            check_disjoint(&[a.clone(), b]),
            Err(HeapError::RegionOverlap {
                first: "a",
                second: "b"
            })
        );
        assert!(check_disjoint(&[a.clone(), a]).is_ok());
    }

    proptest! {
        #[test]
        fn belts_are_disjoint_and_contiguous(split in 1usize..99, pages in 8usize..64) {
            let total = pages * page_size();
            let map = Mmap::new(total).unwrap();
            let layout = BeltLayout::Percentages(vec![split, 100 - split]);
            if let Ok(manager) = BeltManager::new(map.start(), total, &layout) {
                let belts = manager.belts();
                for (i, a) in belts.iter().enumerate() {
                    for b in &belts[i + 1..] {
                        prop_assert!(a.region().is_disjoint_from(b.region()));
                    }
                }
                prop_assert_eq!(belts[0].end(), belts[1].start());
                prop_assert_eq!(belts.iter().map(|b| b.size()).sum::<usize>(), total);
            }
        }
    }
}
