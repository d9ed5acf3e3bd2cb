use memmap2::MmapMut;

use crate::address::{page_size, Address};
use crate::error::{HeapError, HeapResult};

/// Anonymous page-aligned reservation backing the heap and its side structures.
pub struct Mmap {
    map: MmapMut,
    start: Address,
    size: usize,
}

impl Mmap {
    pub fn new(size: usize) -> HeapResult<Self> {
        let mut map = MmapMut::map_anon(size).map_err(|err| {
            HeapError::Configuration(format!("unable to reserve {} bytes: {}", size, err))
        })?;
        let start = Address::from_ptr(map.as_mut_ptr());
        debug_assert!(start.is_aligned(page_size()));
        #[cfg(unix)]
        unsafe {
            libc::madvise(start.to_mut_ptr(), size, libc::MADV_SEQUENTIAL);
        }
        Ok(Self { map, start, size })
    }

    pub fn start(&self) -> Address {
        self.start
    }
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }
    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Hands the pages of `[page, page + size)` back to the OS. The next read
    /// of those pages observes zeroes.
    pub fn dontneed(&self, page: Address, size: usize) {
        debug_assert!(page >= self.start && page.offset(size) <= self.end());
        let page_size = page_size();
        let begin = page.align_up(page_size);
        let end = page.offset(size).align_down(page_size);
        if end <= begin {
            unsafe {
                core::ptr::write_bytes(page.to_mut_ptr::<u8>(), 0, size);
            }
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::madvise(
                begin.to_mut_ptr(),
                end.offset_from(begin),
                libc::MADV_DONTNEED,
            );
            // Partial pages at either edge are not released by madvise.
            core::ptr::write_bytes(page.to_mut_ptr::<u8>(), 0, begin.offset_from(page));
            core::ptr::write_bytes(end.to_mut_ptr::<u8>(), 0, page.offset(size).offset_from(end));
        }
        #[cfg(not(unix))]
        unsafe {
            core::ptr::write_bytes(page.to_mut_ptr::<u8>(), 0, size);
        }
    }
}
