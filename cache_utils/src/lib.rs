#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::assert_cfg;

assert_cfg!(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    "Cache flush and cycle counter primitives only exist for x86_64 and aarch64"
);

pub mod address;
pub mod mmap;

use core::ptr;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/**
Hardware capability used by every measurement: a monotonic cycle counter, load and full
fences, a single line flush, and plain / read-modify-write accesses.

The composed operations (`timed_read`, `flush_range`, `read_lines`, ...) are provided
methods so that an implementation for another ISA, or an instrumented one, only needs the
primitives. They are forced inline: nothing may sit between a fence and the access it
orders.
*/
pub trait TimingPrimitives {
    /// Read the cycle counter, ordered after all prior loads.
    fn read_counter(&self) -> u64;

    /// Order prior loads before subsequent ones.
    fn load_fence(&self);

    /// Order all prior loads and stores before all subsequent ones.
    fn full_fence(&self);

    /// Evict the line containing `p` from every cache level.
    ///
    /// # Safety
    ///
    /// `p` must point into a mapped region.
    unsafe fn flush_line(&self, p: *const u8);

    /// # Safety
    ///
    /// `p` must be valid for reads.
    unsafe fn maccess(&self, p: *const u8);

    /// Read-modify-write of one byte, so the access is not elided and the line is
    /// owned for writing.
    ///
    /// # Safety
    ///
    /// `p` must be valid for reads and writes.
    unsafe fn touch(&self, p: *mut u8);

    /// Relative tick count of one read of `*p`. Not calibrated, subject to frequency
    /// scaling.
    ///
    /// # Safety
    ///
    /// `p` must be valid for reads.
    #[inline(always)]
    unsafe fn timed_read(&self, p: *const u8) -> u64 {
        self.full_fence();
        let t = self.read_counter();
        self.load_fence();
        unsafe { self.maccess(p) };
        let end = self.read_counter();
        end.wrapping_sub(t)
    }

    /// Flush `[start, start + len)` with a `line_size` stride. When `fenced` is false the
    /// caller is in charge of the closing `full_fence`. A zero `line_size` flushes nothing.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped.
    #[inline(always)]
    unsafe fn flush_range(&self, start: *const u8, len: usize, line_size: usize, fenced: bool) {
        if len != 0 && line_size != 0 {
            for offset in (0..len).step_by(line_size) {
                unsafe { self.flush_line(start.add(offset)) };
            }
        }
        if fenced {
            self.full_fence();
        }
    }

    /// Read `num_lines` consecutive lines, returns the address just past the last one.
    ///
    /// # Safety
    ///
    /// `num_lines * line_size` bytes from `start` must be readable.
    #[inline(always)]
    unsafe fn read_lines(&self, start: *const u8, num_lines: usize, line_size: usize) -> *const u8 {
        let end = num_lines * line_size;
        if end != 0 {
            for offset in (0..end).step_by(line_size) {
                unsafe { self.maccess(start.add(offset)) };
            }
        }
        start.wrapping_add(end)
    }

    /// # Safety
    ///
    /// `num_lines * line_size` bytes from `start` must be writable.
    #[inline(always)]
    unsafe fn write_lines(&self, start: *mut u8, num_lines: usize, line_size: usize) -> *mut u8 {
        unsafe { self.write_lines_strided(start, num_lines, 1, line_size) }
    }

    /// Touch `num_lines` lines spaced `stride` lines apart.
    ///
    /// # Safety
    ///
    /// `num_lines * stride * line_size` bytes from `start` must be writable.
    #[inline(always)]
    unsafe fn write_lines_strided(
        &self,
        start: *mut u8,
        num_lines: usize,
        stride: usize,
        line_size: usize,
    ) -> *mut u8 {
        let step = stride * line_size;
        let end = num_lines * step;
        if end != 0 {
            for offset in (0..end).step_by(step) {
                unsafe { self.touch(start.add(offset)) };
            }
        }
        start.wrapping_add(end)
    }
}

// rdtscp waits for prior loads, lfence after it keeps later instructions from starting early.
#[cfg(target_arch = "x86_64")]
mod arch {
    use core::arch::x86_64 as arch_x86;

    #[inline(always)]
    pub fn rdtscp() -> u64 {
        let mut aux = 0u32;
        unsafe { arch_x86::__rdtscp(&mut aux) }
    }

    #[inline(always)]
    pub fn lfence() {
        unsafe { arch_x86::_mm_lfence() }
    }

    #[inline(always)]
    pub fn mfence() {
        unsafe { arch_x86::_mm_mfence() }
    }

    #[inline(always)]
    pub fn fence() {
        mfence();
        lfence();
    }

    /// # Safety
    ///
    /// p must be mapped.
    #[inline(always)]
    pub unsafe fn flush(p: *const u8) {
        unsafe { arch_x86::_mm_clflush(p) }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use core::arch::asm;

    #[inline(always)]
    pub fn rdtscp() -> u64 {
        let t: u64;
        unsafe {
            asm!(
                "dsb ishld",
                "isb",
                "mrs {t}, cntvct_el0",
                t = out(reg) t,
                options(nostack, preserves_flags)
            )
        };
        t
    }

    #[inline(always)]
    pub fn lfence() {
        unsafe { asm!("dmb ishld", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn fence() {
        unsafe { asm!("dsb sy", "isb", options(nostack, preserves_flags)) }
    }

    /// # Safety
    ///
    /// p must be mapped.
    #[inline(always)]
    pub unsafe fn flush(p: *const u8) {
        unsafe { asm!("dc civac, {p}", p = in(reg) p, options(nostack, preserves_flags)) }
    }
}

pub use arch::{fence, flush, lfence};

/// # Safety
///
/// p must be valid for reads.
#[inline(always)]
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

/// The real instructions of the machine we run on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePrimitives;

impl TimingPrimitives for NativePrimitives {
    #[inline(always)]
    fn read_counter(&self) -> u64 {
        arch::rdtscp()
    }

    #[inline(always)]
    fn load_fence(&self) {
        lfence()
    }

    #[inline(always)]
    fn full_fence(&self) {
        fence()
    }

    #[inline(always)]
    unsafe fn flush_line(&self, p: *const u8) {
        unsafe { flush(p) }
    }

    #[inline(always)]
    unsafe fn maccess(&self, p: *const u8) {
        unsafe { maccess(p) }
    }

    #[inline(always)]
    unsafe fn touch(&self, p: *mut u8) {
        unsafe { ptr::write_volatile(p, ptr::read_volatile(p).wrapping_add(1)) }
    }
}

/// Pin the calling process to `core`, returning the previous affinity mask.
pub fn pin_to_core(core: usize) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    log::info!("pinned to core {}", core);
    Ok(old)
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::TimingPrimitives;
    use core::cell::{Cell, RefCell};
    use core::ptr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Event {
        Counter,
        LoadFence,
        FullFence,
        Flush(usize),
        Read(usize),
        Touch(usize),
    }

    /// Logs every primitive instead of issuing cache instructions.
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub events: RefCell<Vec<Event>>,
        clock: Cell<u64>,
    }

    impl TimingPrimitives for Recorder {
        fn read_counter(&self) -> u64 {
            self.events.borrow_mut().push(Event::Counter);
            let t = self.clock.get() + 7;
            self.clock.set(t);
            t
        }

        fn load_fence(&self) {
            self.events.borrow_mut().push(Event::LoadFence);
        }

        fn full_fence(&self) {
            self.events.borrow_mut().push(Event::FullFence);
        }

        unsafe fn flush_line(&self, p: *const u8) {
            self.events.borrow_mut().push(Event::Flush(p as usize));
        }

        unsafe fn maccess(&self, p: *const u8) {
            self.events.borrow_mut().push(Event::Read(p as usize));
        }

        unsafe fn touch(&self, p: *mut u8) {
            self.events.borrow_mut().push(Event::Touch(p as usize));
            unsafe { ptr::write_volatile(p, ptr::read_volatile(p).wrapping_add(1)) }
        }
    }
}
