use core::cmp::Ordering;
use core::fmt;
use std::mem::size_of;

pub const WORD_SIZE: usize = size_of::<usize>();
/// Every allocation request is rounded up to this granularity before the bounds check.
pub const OBJECT_ALIGNMENT: usize = WORD_SIZE;

/// Wrapper around usize for easy pointer math.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// Offset from `base`
    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base);

        self.0 - base.0
    }
    /// Return self + offset
    #[inline(always)]
    pub const fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }
    /// Return self - offset
    #[inline(always)]
    pub const fn sub(self, offset: usize) -> Address {
        Address(self.0 - offset)
    }
    /// Add `words` machine words to self.
    #[inline(always)]
    pub const fn add_words(self, words: usize) -> Address {
        Address(self.0 + words * WORD_SIZE)
    }
    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.0
    }
    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }
    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
    #[inline(always)]
    pub const fn null() -> Address {
        Address(0)
    }
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    pub const fn is_non_null(self) -> bool {
        self.0 != 0
    }
    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }
    #[inline(always)]
    pub const fn align_up(self, align: usize) -> Address {
        Address(align_up(self.0, align))
    }
    #[inline(always)]
    pub const fn align_down(self, align: usize) -> Address {
        Address(align_down(self.0, align))
    }

    /// Reads the word stored at this address.
    ///
    /// # Safety
    /// The address must be word aligned and point into mapped memory.
    #[inline(always)]
    pub unsafe fn load_word(self) -> usize {
        self.to_ptr::<usize>().read()
    }

    /// # Safety
    /// The address must be word aligned and point into mapped, writable memory.
    #[inline(always)]
    pub unsafe fn store_word(self, value: usize) {
        self.to_mut_ptr::<usize>().write(value)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}
/// `align_up` that reports overflow instead of wrapping.
#[inline(always)]
pub const fn checked_align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(sum) => Some(sum & !align.wrapping_sub(1)),
        None => None,
    }
}
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Size of a virtual memory page on the host.
pub fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        let size = libc::sysconf(libc::_SC_PAGESIZE);
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_down(15, 8), 8);
        assert!(is_aligned(4096, page_size()));
        assert_eq!(Address::from(0x1001).align_up(16), Address::from(0x1010));
    }

    #[test]
    fn pointer_math() {
        let a = Address::from(0x1000);
        assert_eq!(a.add_words(2).offset_from(a), 2 * WORD_SIZE);
        assert_eq!(a.offset(16).sub(16), a);
        assert!(Address::null().is_null());
        assert!(a.is_non_null());
    }
}
