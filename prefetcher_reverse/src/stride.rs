use crate::{check_len, check_line_size, ExperimentError};
use cache_utils::TimingPrimitives;
use serde::{Deserialize, Serialize};

/// Strides, in lines, checked by the stride prefetch test.
pub const STRIDES: [usize; 14] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 16, 24, 32];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSample {
    #[serde(rename = "TrainingSize")]
    pub training_size: usize,
    #[serde(rename = "Cycles")]
    pub cycles: u64,
}

/// Start from a clean slate: `target` out of the cache and `eviction` in it.
#[inline(always)]
fn reset<T: TimingPrimitives>(primitives: &T, target: &[u8], eviction: &mut [u8], line_size: usize) {
    unsafe {
        primitives.flush_range(target.as_ptr(), target.len(), line_size, true);
        primitives.write_lines(eviction.as_mut_ptr(), eviction.len() / line_size, line_size);
    }
    primitives.full_fence();
}

/**
Next-line prefetch test. Sample `i` writes `i % max_training` consecutive lines of `target`
and times the read of the line right after them. A next-line prefetcher shows up as fast
reads once the training size is large enough.
*/
pub fn next_line_test<T: TimingPrimitives>(
    primitives: &T,
    target: &mut [u8],
    eviction: &mut [u8],
    line_size: usize,
    samples: usize,
    max_training: usize,
) -> Result<Vec<TrainingSample>, ExperimentError> {
    check_line_size(line_size)?;
    if max_training == 0 {
        return Err(ExperimentError::NoTraining);
    }
    let needed = max_training.checked_mul(line_size).unwrap_or(usize::MAX);
    check_len(target, needed)?;

    let mut results = Vec::with_capacity(samples);
    for i in 0..samples {
        reset(primitives, target, eviction, line_size);
        let training_size = i % max_training;
        let next = unsafe { primitives.write_lines(target.as_mut_ptr(), training_size, line_size) };
        let cycles = unsafe { primitives.timed_read(next) };
        results.push(TrainingSample {
            training_size,
            cycles,
        });
    }
    Ok(results)
}

/// Same protocol with the training lines `stride` lines apart, the probed line is one
/// more stride away.
pub fn stride_test<T: TimingPrimitives>(
    primitives: &T,
    target: &mut [u8],
    eviction: &mut [u8],
    line_size: usize,
    stride: usize,
    samples: usize,
    max_training: usize,
) -> Result<Vec<TrainingSample>, ExperimentError> {
    check_line_size(line_size)?;
    if max_training == 0 {
        return Err(ExperimentError::NoTraining);
    }
    // The probed line sits `max_training - 1` strides past the start at most.
    let needed = (max_training - 1)
        .checked_mul(stride)
        .and_then(|lines| lines.checked_add(1))
        .and_then(|lines| lines.checked_mul(line_size))
        .unwrap_or(usize::MAX);
    check_len(target, needed)?;

    let mut results = Vec::with_capacity(samples);
    for i in 0..samples {
        reset(primitives, target, eviction, line_size);
        let training_size = i % max_training;
        let next = unsafe {
            primitives.write_lines_strided(target.as_mut_ptr(), training_size, stride, line_size)
        };
        let cycles = unsafe { primitives.timed_read(next) };
        results.push(TrainingSample {
            training_size,
            cycles,
        });
    }
    log::debug!("stride {}: {} samples", stride, samples);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::testing::{Event, Recorder};

    fn reads(rec: &Recorder) -> Vec<usize> {
        rec.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Read(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn next_line_probes_after_training() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 8 * 64];
        let mut eviction = vec![0u8; 4 * 64];
        let base = target.as_ptr() as usize;

        let rows = next_line_test(&rec, &mut target, &mut eviction, 64, 10, 4).unwrap();
        let sizes: Vec<usize> = rows.iter().map(|r| r.training_size).collect();
        assert_eq!(sizes, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
        assert_eq!(
            reads(&rec),
            sizes.iter().map(|ts| base + ts * 64).collect::<Vec<_>>()
        );
        assert_eq!(eviction[3 * 64], 10);
        // Line i is trained by every sample with a training size above i.
        let trained: Vec<u8> = target[..4 * 64].iter().step_by(64).copied().collect();
        assert_eq!(trained, [7u8, 4, 2, 0]);
    }

    #[test]
    fn clean_slate_before_training() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 2 * 64];
        let mut eviction = vec![0u8; 64];
        let t = target.as_ptr() as usize;
        let e = eviction.as_ptr() as usize;

        next_line_test(&rec, &mut target, &mut eviction, 64, 2, 2).unwrap();
        let events = rec.events.borrow();
        assert_eq!(
            events[..],
            [
                Event::Flush(t),
                Event::Flush(t + 64),
                Event::FullFence,
                Event::Touch(e),
                Event::FullFence,
                Event::FullFence,
                Event::Counter,
                Event::LoadFence,
                Event::Read(t),
                Event::Counter,
                Event::Flush(t),
                Event::Flush(t + 64),
                Event::FullFence,
                Event::Touch(e),
                Event::FullFence,
                Event::Touch(t),
                Event::FullFence,
                Event::Counter,
                Event::LoadFence,
                Event::Read(t + 64),
                Event::Counter,
            ]
        );
    }

    #[test]
    fn strided_probe() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 16 * 64];
        let mut eviction = vec![0u8; 64];
        let base = target.as_ptr() as usize;

        let rows = stride_test(&rec, &mut target, &mut eviction, 64, 5, 4, 4).unwrap();
        assert!(rows.iter().all(|r| r.cycles == 7));
        assert_eq!(
            reads(&rec),
            vec![base, base + 5 * 64, base + 10 * 64, base + 15 * 64]
        );
        assert_eq!(target[0], 3);
        assert_eq!(target[5 * 64], 2);
        assert_eq!(target[10 * 64], 1);
        assert_eq!(target[64], 0);
    }

    #[test]
    fn stride_needs_room() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 15 * 64];
        let mut eviction = vec![0u8; 64];
        assert!(matches!(
            stride_test(&rec, &mut target, &mut eviction, 64, 5, 4, 4),
            Err(ExperimentError::BufferTooSmall { needed: 1024, len: 960 })
        ));
        assert!(matches!(
            next_line_test(&rec, &mut target, &mut eviction, 64, 4, 0),
            Err(ExperimentError::NoTraining)
        ));
        assert!(rec.events.borrow().is_empty());
    }

    #[test]
    fn degenerate_parameters_refused() {
        let rec = Recorder::default();
        let mut target = vec![0u8; 16 * 64];
        let mut eviction = vec![0u8; 64];
        assert!(matches!(
            next_line_test(&rec, &mut target, &mut eviction, 0, 4, 4),
            Err(ExperimentError::ZeroLineSize)
        ));
        assert!(matches!(
            stride_test(&rec, &mut target, &mut eviction, 0, 5, 4, 4),
            Err(ExperimentError::ZeroLineSize)
        ));
        assert!(matches!(
            stride_test(&rec, &mut target, &mut eviction, 64, usize::MAX, 4, 4),
            Err(ExperimentError::BufferTooSmall { needed: usize::MAX, len: 1024 })
        ));
        assert!(matches!(
            next_line_test(&rec, &mut target, &mut eviction, 64, 4, usize::MAX),
            Err(ExperimentError::BufferTooSmall { needed: usize::MAX, len: 1024 })
        ));
        assert!(rec.events.borrow().is_empty());
    }

    #[test]
    fn stride_list() {
        assert_eq!(STRIDES.len(), 14);
        assert!(STRIDES.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(STRIDES.last(), Some(&32));
    }
}
