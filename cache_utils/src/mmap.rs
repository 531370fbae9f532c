use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::sys::mman;
use thiserror::Error;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_MASK        0x3f

#define HUGETLB_FLAG_ENCODE_64KB        (16 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_512KB       (19 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_1MB         (20 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

/// Default huge page size, the mapping is aligned on it and physically contiguous within it.
pub const HUGE_PAGE_LEN: usize = 2 << 20;

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map an empty region")]
    Empty,
    #[error("huge page mapping of {size} bytes refused: {source}")]
    HugePages { size: usize, source: nix::Error },
}

/// Anything an eviction set can be laid over: a base pointer and a length.
///
/// # Safety
///
/// `as_mut_ptr()` must be valid for reads and writes of `len()` bytes for as long as the
/// value lives, and neither may change over that lifetime.
pub unsafe trait Backing {
    fn as_mut_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
A populated, locked, huge-page backed anonymous mapping.

There is no fallback to regular pages: if the kernel cannot provide huge pages (none
reserved in `/proc/sys/vm/nr_hugepages`, or exhausted) construction fails.
*/
#[derive(Debug)]
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
    mapped: usize,
}

impl MMappedMemory {
    pub fn try_new(size: usize) -> Result<MMappedMemory, MmapError> {
        let length = NonZeroUsize::new(size).ok_or(MmapError::Empty)?;
        // munmap of hugetlb mappings wants whole pages.
        let mapped = length.get().div_ceil(HUGE_PAGE_LEN) * HUGE_PAGE_LEN;
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                NonZeroUsize::new(mapped).ok_or(MmapError::Empty)?,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE
                    | mman::MapFlags::MAP_HUGETLB
                    | mman::MapFlags::MAP_POPULATE
                    | mman::MapFlags::MAP_LOCKED,
            )
        }
        .map_err(|source| MmapError::HugePages { size, source })?;
        log::debug!("mapped {} bytes of huge pages at {:p}", mapped, p.as_ptr());
        Ok(MMappedMemory {
            pointer: p.cast(),
            size,
            mapped,
        })
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

// The mapping is owned, `size` bytes long and only unmapped on drop.
unsafe impl Backing for MMappedMemory {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.pointer.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Deref for MMappedMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.slice()
    }
}

impl DerefMut for MMappedMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.slice_mut()
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        let p: NonNull<c_void> = self.pointer.cast();
        if let Err(e) = unsafe { mman::munmap(p, self.mapped) } {
            log::warn!("munmap of {:p} failed: {}", p.as_ptr(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_refused() {
        assert!(matches!(MMappedMemory::try_new(0), Err(MmapError::Empty)));
    }

    #[test]
    #[ignore = "needs reserved huge pages"]
    fn huge_page_aligned() {
        let mut m = MMappedMemory::try_new(64 * 512 * 16).unwrap();
        assert_eq!(m.as_mut_ptr() as usize % HUGE_PAGE_LEN, 0);
        assert_eq!(m.len(), 64 * 512 * 16);
        m[100] = 3;
        assert_eq!(m.slice()[100], 3);
    }
}
