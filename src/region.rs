use std::fmt;

use crate::address::Address;

/// A named, fixed span of address space.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    name: &'static str,
    start: Address,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(name: &'static str, start: Address, size: usize) -> Self {
        Self { name, start, size }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn start(&self) -> Address {
        self.start
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Two regions either are the same span or do not overlap at all.
    pub fn is_disjoint_from(&self, other: &MemoryRegion) -> bool {
        self.end() <= other.start() || other.end() <= self.start()
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        !self.is_disjoint_from(other) && !self.same_span(other)
    }

    pub fn same_span(&self, other: &MemoryRegion) -> bool {
        self.start == other.start && self.size == other.size
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.name, self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjointness() {
        let a = MemoryRegion::new("a", Address::from(0x1000), 0x1000);
        let b = MemoryRegion::new("b", Address::from(0x2000), 0x1000);
        let c = MemoryRegion::new("c", Address::from(0x1800), 0x1000);
        assert!(a.is_disjoint_from(&b));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(!a.overlaps(&a.clone()));
        assert!(a.contains(Address::from(0x1fff)));
        assert!(!a.contains(a.end()));
    }
}
