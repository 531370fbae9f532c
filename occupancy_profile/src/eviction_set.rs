use crate::error::EvictionSetError;
use cache_utils::address::CacheGeometry;
use cache_utils::mmap::{Backing, MMappedMemory, HUGE_PAGE_LEN};
use cache_utils::TimingPrimitives;
use core::ptr::null_mut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: *mut u8,
    pub size: usize,
}

impl MemoryRegion {
    const EMPTY: MemoryRegion = MemoryRegion {
        start: null_mut(),
        size: 0,
    };
}

/**
A memory region laid out so that, for a cache of `cache_sets` sets with `line_size` byte
lines, line `l` of congruence class `s` sits at `s * line_size + l * cache_sets * line_size`.

The region is split in a warmup section of `warmup_lines` lines per set, immediately
followed by the occupation section of `cache_lines` lines per set. The base must map to
set 0, which is checked on construction.

In the PAPP paper `cache_sets` is `s`, `cache_lines` is `a` and `warmup_lines` is `n`.
*/
#[derive(Debug)]
pub struct EvictionSet<B: Backing = MMappedMemory> {
    backing: Option<B>,
    warmup_section: MemoryRegion,
    occupation_section: MemoryRegion,
    line_size: usize,
    cache_sets: usize,
    cache_lines: usize,
    warmup_lines: usize,
}

impl EvictionSet<MMappedMemory> {
    /// Allocate an eviction set on huge pages. Fails if the pages cannot be obtained.
    pub fn new(
        geometry: &CacheGeometry,
        cache_lines: usize,
        warmup_lines: usize,
    ) -> Result<Self, EvictionSetError> {
        geometry.validate()?;
        if cache_lines == 0 {
            return Err(EvictionSetError::NoLines);
        }
        // Within a huge page virtual and physical set bits agree, not across pages.
        if geometry.set_stride() > HUGE_PAGE_LEN {
            return Err(EvictionSetError::StrideTooLarge {
                stride: geometry.set_stride(),
                page: HUGE_PAGE_LEN,
            });
        }
        let size = Self::required_len(geometry, cache_lines, warmup_lines)?;
        let memory = MMappedMemory::try_new(size)?;
        Self::from_backing(memory, geometry, cache_lines, warmup_lines)
    }
}

impl<B: Backing> EvictionSet<B> {
    /// Bytes of the warmup and occupation sections.
    fn section_sizes(
        geometry: &CacheGeometry,
        cache_lines: usize,
        warmup_lines: usize,
    ) -> Result<(usize, usize), EvictionSetError> {
        let too_large = || EvictionSetError::TooLarge {
            cache_lines,
            warmup_lines,
        };
        let stride = geometry.set_stride();
        let warmup = stride.checked_mul(warmup_lines).ok_or_else(too_large)?;
        let occupation = stride.checked_mul(cache_lines).ok_or_else(too_large)?;
        warmup.checked_add(occupation).ok_or_else(too_large)?;
        Ok((warmup, occupation))
    }

    pub fn required_len(
        geometry: &CacheGeometry,
        cache_lines: usize,
        warmup_lines: usize,
    ) -> Result<usize, EvictionSetError> {
        let (warmup, occupation) = Self::section_sizes(geometry, cache_lines, warmup_lines)?;
        Ok(warmup + occupation)
    }

    /// Lay an eviction set over an existing region, checking its size and that its base
    /// decodes to set 0, block 0.
    pub fn from_backing(
        backing: B,
        geometry: &CacheGeometry,
        cache_lines: usize,
        warmup_lines: usize,
    ) -> Result<Self, EvictionSetError> {
        let decoder = geometry.decoder()?;
        if cache_lines == 0 {
            return Err(EvictionSetError::NoLines);
        }
        let (warmup_size, occupation_size) =
            Self::section_sizes(geometry, cache_lines, warmup_lines)?;
        let needed = warmup_size + occupation_size;
        if backing.len() < needed {
            return Err(EvictionSetError::Undersized {
                given: backing.len(),
                needed,
            });
        }

        let base = backing.as_mut_ptr();
        let triple = decoder.decompose_ptr(base);
        if triple.set != 0 || triple.block != 0 {
            return Err(EvictionSetError::Misaligned {
                base: base as usize,
                set: triple.set,
                block: triple.block,
            });
        }

        let warmup_section = MemoryRegion {
            start: base,
            size: warmup_size,
        };
        let occupation_section = MemoryRegion {
            start: base.wrapping_add(warmup_size),
            size: occupation_size,
        };

        log::info!(
            "eviction set: {} sets x ({} + {} warmup) lines",
            geometry.sets,
            cache_lines,
            warmup_lines
        );
        log::info!(
            "warmup: {:p} ({})",
            warmup_section.start,
            decoder.decompose_ptr(warmup_section.start)
        );
        log::info!(
            "occupation: {:p} ({})",
            occupation_section.start,
            decoder.decompose_ptr(occupation_section.start)
        );

        Ok(EvictionSet {
            backing: Some(backing),
            warmup_section,
            occupation_section,
            line_size: geometry.line_size,
            cache_sets: geometry.sets,
            cache_lines,
            warmup_lines,
        })
    }

    pub fn warmup_section(&self) -> MemoryRegion {
        self.warmup_section
    }

    pub fn occupation_section(&self) -> MemoryRegion {
        self.occupation_section
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn cache_sets(&self) -> usize {
        self.cache_sets
    }

    pub fn cache_lines(&self) -> usize {
        self.cache_lines
    }

    pub fn warmup_lines(&self) -> usize {
        self.warmup_lines
    }

    /// Lines per set over both sections.
    pub fn total_lines(&self) -> usize {
        // Both sections together fit in the backing, so their line counts add up.
        self.cache_lines + self.warmup_lines
    }

    pub fn is_released(&self) -> bool {
        self.occupation_section.size == 0
    }

    fn set_stride(&self) -> usize {
        self.cache_sets * self.line_size
    }

    /// Line `candidate_line` of class `candidate_set`, counting warmup lines first.
    pub fn line_address(&self, candidate_set: usize, candidate_line: usize) -> Option<*mut u8> {
        if candidate_set >= self.cache_sets || candidate_line >= self.total_lines() {
            return None;
        }
        Some(self.warmup_section.start.wrapping_add(
            candidate_set * self.line_size + candidate_line * self.set_stride(),
        ))
    }

    /// Line `candidate_line` of class `candidate_set` within the occupation section.
    pub fn occupation_line_address(
        &self,
        candidate_set: usize,
        candidate_line: usize,
    ) -> Option<*mut u8> {
        if candidate_set >= self.cache_sets || candidate_line >= self.cache_lines {
            return None;
        }
        Some(self.occupation_section.start.wrapping_add(
            candidate_set * self.line_size + candidate_line * self.set_stride(),
        ))
    }

    /// Flush both sections, fencing once at the end.
    #[inline(always)]
    pub fn flush_all<T: TimingPrimitives>(&mut self, primitives: &T) {
        unsafe {
            primitives.flush_range(
                self.warmup_section.start,
                self.warmup_section.size,
                self.line_size,
                false,
            );
            primitives.flush_range(
                self.occupation_section.start,
                self.occupation_section.size,
                self.line_size,
                false,
            );
        }
        primitives.full_fence();
    }

    /// Write every warmup line then every occupation line of `target_set`, leaving all
    /// of its ways holding eviction set lines.
    pub fn prime_set<T: TimingPrimitives>(
        &mut self,
        primitives: &T,
        target_set: usize,
    ) -> Result<(), EvictionSetError> {
        if target_set >= self.cache_sets {
            return Err(EvictionSetError::TargetSetOutOfRange {
                target: target_set,
                sets: self.cache_sets,
            });
        }
        self.prime_set_unchecked(primitives, target_set);
        Ok(())
    }

    // target_set < cache_sets, or the descriptor is released and every count is 0.
    #[inline(always)]
    pub(crate) fn prime_set_unchecked<T: TimingPrimitives>(&mut self, primitives: &T, target_set: usize) {
        let offset = target_set * self.line_size;
        unsafe {
            primitives.write_lines_strided(
                self.warmup_section.start.wrapping_add(offset),
                self.warmup_lines,
                self.cache_sets,
                self.line_size,
            );
            primitives.write_lines_strided(
                self.occupation_section.start.wrapping_add(offset),
                self.cache_lines,
                self.cache_sets,
                self.line_size,
            );
        }
    }

    /// Unmap the region and zero the descriptor. Calling it again does nothing.
    pub fn release(&mut self) {
        if self.backing.is_none() && self.is_released() {
            return;
        }
        if let Some(backing) = self.backing.take() {
            log::debug!("releasing eviction set at {:p}", backing.as_mut_ptr());
            drop(backing);
        }
        self.warmup_section = MemoryRegion::EMPTY;
        self.occupation_section = MemoryRegion::EMPTY;
        self.line_size = 0;
        self.cache_sets = 0;
        self.cache_lines = 0;
        self.warmup_lines = 0;
    }
}

impl<B: Backing> Drop for EvictionSet<B> {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::AlignedBuffer;
    use super::*;
    use cache_utils::testing::{Event, Recorder};

    fn small_set(sets: usize, lines: usize, warmup: usize) -> EvictionSet<AlignedBuffer> {
        let geometry = CacheGeometry::new(64, sets, lines);
        let size = EvictionSet::<AlignedBuffer>::required_len(&geometry, lines, warmup).unwrap();
        let buffer = AlignedBuffer::new(size, geometry.set_stride());
        EvictionSet::from_backing(buffer, &geometry, lines, warmup).unwrap()
    }

    #[test]
    fn sizes_and_layout() {
        for (s, a, w) in [(4, 2, 0), (16, 8, 3), (512, 8, 8), (1, 1, 1)] {
            let es = small_set(s, a, w);
            let warmup = es.warmup_section();
            let occupation = es.occupation_section();
            assert_eq!(warmup.size, 64 * s * w);
            assert_eq!(occupation.size, 64 * s * a);
            assert_eq!(occupation.start as usize, warmup.start as usize + warmup.size);
            assert_eq!(warmup.start as usize % (64 * s), 0);
        }
    }

    struct Shifted(AlignedBuffer);

    unsafe impl Backing for Shifted {
        fn as_mut_ptr(&self) -> *mut u8 {
            self.0.as_mut_ptr().wrapping_add(64)
        }

        fn len(&self) -> usize {
            self.0.len() - 64
        }
    }

    #[test]
    fn misaligned_base_refused() {
        let geometry = CacheGeometry::new(64, 16, 2);
        let shifted = Shifted(AlignedBuffer::new(64 * 16 * 4, 64 * 16));
        assert!(matches!(
            EvictionSet::from_backing(shifted, &geometry, 2, 0),
            Err(EvictionSetError::Misaligned { set: 1, block: 0, .. })
        ));
    }

    #[test]
    fn undersized_and_empty_refused() {
        let geometry = CacheGeometry::new(64, 16, 2);
        let buffer = AlignedBuffer::new(64 * 16, 64 * 16);
        assert!(matches!(
            EvictionSet::from_backing(buffer, &geometry, 2, 0),
            Err(EvictionSetError::Undersized {
                given: 1024,
                needed: 2048
            })
        ));
        let buffer = AlignedBuffer::new(64 * 16, 64 * 16);
        assert!(matches!(
            EvictionSet::from_backing(buffer, &geometry, 0, 1),
            Err(EvictionSetError::NoLines)
        ));
    }

    #[test]
    fn line_addresses() {
        let es = small_set(8, 2, 1);
        let base = es.warmup_section().start as usize;
        assert_eq!(es.line_address(0, 0).unwrap() as usize, base);
        assert_eq!(es.line_address(3, 0).unwrap() as usize, base + 3 * 64);
        assert_eq!(es.line_address(3, 2).unwrap() as usize, base + 3 * 64 + 2 * 8 * 64);
        assert_eq!(
            es.occupation_line_address(3, 1).unwrap() as usize,
            es.occupation_section().start as usize + 3 * 64 + 8 * 64
        );
        assert_eq!(es.line_address(8, 0), None);
        assert_eq!(es.line_address(0, 3), None);
        assert_eq!(es.occupation_line_address(0, 2), None);
    }

    #[test]
    fn prime_touches_one_class() {
        let mut es = small_set(8, 3, 2);
        let rec = Recorder::default();
        es.prime_set(&rec, 5).unwrap();
        let base = es.warmup_section().start as usize;
        let expected: Vec<Event> = (0..5).map(|l| Event::Touch(base + 5 * 64 + l * 8 * 64)).collect();
        assert_eq!(*rec.events.borrow(), expected);
        assert!(es.prime_set(&rec, 8).is_err());
    }

    #[test]
    fn flush_covers_everything_then_fences() {
        let mut es = small_set(4, 2, 1);
        let rec = Recorder::default();
        es.flush_all(&rec);
        let events = rec.events.borrow();
        assert_eq!(events.len(), 4 * 3 + 1);
        assert_eq!(events.last(), Some(&Event::FullFence));
        let base = es.warmup_section().start as usize;
        for (i, e) in events[..12].iter().enumerate() {
            assert_eq!(*e, Event::Flush(base + i * 64));
        }
    }

    #[test]
    fn release_is_idempotent() {
        let mut es = small_set(4, 2, 1);
        es.release();
        assert!(es.is_released());
        assert_eq!(es.warmup_section(), MemoryRegion::EMPTY);
        assert_eq!(es.occupation_section(), MemoryRegion::EMPTY);
        assert_eq!((es.cache_sets(), es.cache_lines(), es.warmup_lines()), (0, 0, 0));
        es.release();
        assert!(es.is_released());

        let rec = Recorder::default();
        es.flush_all(&rec);
        assert_eq!(*rec.events.borrow(), vec![Event::FullFence]);
        assert!(es.prime_set(&rec, 0).is_err());
        assert_eq!(es.line_address(0, 0), None);
    }

    #[test]
    #[ignore = "needs reserved huge pages"]
    fn huge_page_eviction_set() {
        let mut es = EvictionSet::new(&CacheGeometry::L2, 8, 8).unwrap();
        assert_eq!(es.occupation_section().size, 64 * 512 * 8);
        let native = cache_utils::NativePrimitives;
        es.flush_all(&native);
        es.prime_set(&native, 256).unwrap();
        es.release();
    }

    #[test]
    fn oversized_line_counts_refused() {
        assert!(matches!(
            EvictionSet::new(&CacheGeometry::L2, 8, usize::MAX),
            Err(EvictionSetError::TooLarge { cache_lines: 8, .. })
        ));
        assert!(matches!(
            EvictionSet::new(&CacheGeometry::L2, usize::MAX / 2, 0),
            Err(EvictionSetError::TooLarge { .. })
        ));

        // 256 byte stride: 2^56 warmup lines wrap to exactly 2^64 bytes.
        let geometry = CacheGeometry::new(64, 4, 2);
        for warmup in [1 << 56, 1 << 62, usize::MAX] {
            let buffer = AlignedBuffer::new(1024, 256);
            assert!(matches!(
                EvictionSet::from_backing(buffer, &geometry, 2, warmup),
                Err(EvictionSetError::TooLarge { .. })
            ));
        }
        let buffer = AlignedBuffer::new(512, 256);
        assert!(matches!(
            EvictionSet::from_backing(buffer, &geometry, 1 << 48, 1),
            Err(EvictionSetError::Undersized { given: 512, .. })
        ));
        assert!(matches!(
            EvictionSet::<AlignedBuffer>::required_len(&geometry, 2, 1 << 56),
            Err(EvictionSetError::TooLarge { .. })
        ));
        assert_eq!(
            EvictionSet::<AlignedBuffer>::required_len(&geometry, 2, 1).unwrap(),
            768
        );
    }

    #[test]
    fn stride_larger_than_huge_page_refused() {
        let geometry = CacheGeometry::new(64, 1 << 16, 16);
        assert!(matches!(
            EvictionSet::new(&geometry, 16, 0),
            Err(EvictionSetError::StrideTooLarge { .. })
        ));
    }
}
