use crate::{check_len, check_line_size, ExperimentError};
use cache_utils::TimingPrimitives;
use serde::{Deserialize, Serialize};

/// How many times the line, or the eviction buffer, is rewritten before each sample.
const REPEAT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySizes {
    pub line_size: usize,
    pub l1_size: usize,
    pub l2_size: usize,
}

impl Default for LatencySizes {
    fn default() -> Self {
        LatencySizes {
            line_size: 64,
            l1_size: 32 << 10,
            l2_size: 256 << 10,
        }
    }
}

impl LatencySizes {
    /// Size of each of the target and eviction buffers.
    pub fn buffer_len(&self) -> usize {
        self.l2_size.saturating_mul(2)
    }
}

/// One row of `L1,L2,L3,RAM`. The four columns come from four separate loops, row `i`
/// is the `i`th sample of each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    #[serde(rename = "L1")]
    pub l1: u64,
    #[serde(rename = "L2")]
    pub l2: u64,
    #[serde(rename = "L3")]
    pub l3: u64,
    #[serde(rename = "RAM")]
    pub ram: u64,
}

/**
Time a read of the first line of `target` in four situations:

* L1: the line was just written.
* L2: the line was written, then an L1 sized part of `eviction` was.
* L3: same with an L2 sized part of `eviction`.
* RAM: the line, and the L2 sized region around it, were flushed.
*/
pub fn measure_latencies<T: TimingPrimitives>(
    primitives: &T,
    target: &mut [u8],
    eviction: &mut [u8],
    sizes: &LatencySizes,
    samples: usize,
) -> Result<Vec<LatencySample>, ExperimentError> {
    check_line_size(sizes.line_size)?;
    check_len(target, sizes.l2_size)?;
    check_len(eviction, sizes.l2_size)?;

    let line_size = sizes.line_size;
    let target = target.as_mut_ptr();
    let eviction = eviction.as_mut_ptr();
    let mut results = vec![LatencySample::default(); samples];

    primitives.full_fence();
    for r in results.iter_mut() {
        for _ in 0..REPEAT {
            unsafe { primitives.write_lines(target, 1, line_size) };
        }
        r.l1 = unsafe { primitives.timed_read(target) };
    }
    log::debug!("L1 done");

    for (level, evicted) in [(2, sizes.l1_size), (3, sizes.l2_size)] {
        primitives.full_fence();
        for r in results.iter_mut() {
            for _ in 0..REPEAT {
                unsafe { primitives.write_lines(target, 1, line_size) };
            }
            for _ in 0..REPEAT {
                unsafe { primitives.write_lines(eviction, evicted / line_size, line_size) };
            }
            let t = unsafe { primitives.timed_read(target) };
            if level == 2 {
                r.l2 = t;
            } else {
                r.l3 = t;
            }
        }
        log::debug!("L{} done", level);
    }

    primitives.full_fence();
    for r in results.iter_mut() {
        unsafe { primitives.flush_range(target, sizes.l2_size, line_size, true) };
        r.ram = unsafe { primitives.timed_read(target) };
    }
    log::debug!("RAM done");

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::testing::{Event, Recorder};

    const SMALL: LatencySizes = LatencySizes {
        line_size: 64,
        l1_size: 256,
        l2_size: 1024,
    };

    #[test]
    fn one_row_per_sample() {
        let rec = Recorder::default();
        let mut target = vec![0u8; SMALL.buffer_len()];
        let mut eviction = vec![0u8; SMALL.buffer_len()];
        let rows = measure_latencies(&rec, &mut target, &mut eviction, &SMALL, 3).unwrap();
        assert_eq!(rows.len(), 3);
        // The recorder clock advances by 7 per counter read.
        assert!(rows.iter().all(|r| [r.l1, r.l2, r.l3, r.ram] == [7; 4]));

        // Every sample rewrites the line 10 times, L2 and L3 samples add 10 passes over
        // 4 and 16 eviction lines.
        assert_eq!(target[0] as usize, 3 * 10 * 3);
        assert_eq!(eviction[0] as usize, 3 * 10 * 2);
        assert_eq!(eviction[3 * 64] as usize, 3 * 10 * 2);
        assert_eq!(eviction[4 * 64] as usize, 3 * 10);
        assert_eq!(eviction[15 * 64] as usize, 3 * 10);
        assert_eq!(eviction[16 * 64], 0);
    }

    #[test]
    fn ram_sample_is_flushed() {
        let rec = Recorder::default();
        let mut target = vec![0u8; SMALL.buffer_len()];
        let mut eviction = vec![0u8; SMALL.buffer_len()];
        let base = target.as_ptr() as usize;
        measure_latencies(&rec, &mut target, &mut eviction, &SMALL, 1).unwrap();

        let events = rec.events.borrow();
        let first_flush = events
            .iter()
            .position(|e| matches!(e, Event::Flush(_)))
            .unwrap();
        let flushes: Vec<Event> = (0..16).map(|i| Event::Flush(base + i * 64)).collect();
        assert_eq!(events[first_flush..first_flush + 16], flushes[..]);
        assert_eq!(events[first_flush + 16], Event::FullFence);
        assert_eq!(
            events[first_flush + 17..],
            [
                Event::FullFence,
                Event::Counter,
                Event::LoadFence,
                Event::Read(base),
                Event::Counter
            ]
        );
    }

    #[test]
    fn zero_line_size_refused() {
        let rec = Recorder::default();
        let sizes = LatencySizes {
            line_size: 0,
            ..SMALL
        };
        let mut target = vec![0u8; SMALL.buffer_len()];
        let mut eviction = vec![0u8; SMALL.buffer_len()];
        assert!(matches!(
            measure_latencies(&rec, &mut target, &mut eviction, &sizes, 1),
            Err(ExperimentError::ZeroLineSize)
        ));
        assert!(rec.events.borrow().is_empty());
    }

    #[test]
    fn undersized_buffers() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 512];
        let mut eviction = vec![0u8; SMALL.buffer_len()];
        assert!(matches!(
            measure_latencies(&rec, &mut target, &mut eviction, &SMALL, 1),
            Err(ExperimentError::BufferTooSmall { needed: 1024, len: 512 })
        ));
        assert!(rec.events.borrow().is_empty());
    }
}
