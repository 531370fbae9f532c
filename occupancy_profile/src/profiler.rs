use crate::error::ProfileError;
use crate::eviction_set::EvictionSet;
use crate::sink::{OccupancyRecord, RecordSink};
use cache_utils::mmap::Backing;
use cache_utils::{NativePrimitives, TimingPrimitives};
use serde::{Deserialize, Serialize};

/// Which lines of the eviction set get probed after priming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeLinePolicy {
    /// Lines `0..warmup_lines + cache_lines` of each set, warmup section first.
    #[default]
    All,
    /// Lines `0..cache_lines` of each set, occupation section only.
    OccupationOnly,
}

impl ProbeLinePolicy {
    pub fn lines_per_set<B: Backing>(&self, set: &EvictionSet<B>) -> usize {
        match self {
            ProbeLinePolicy::All => set.total_lines(),
            ProbeLinePolicy::OccupationOnly => set.cache_lines(),
        }
    }
}

/**
Occupancy profiling from the PAPP paper.

For every iteration, every target set `s` and every line (`s'`, `l'`) of the eviction set:
flush the whole eviction set, prime `s` (warmup lines first), time a read of (`s'`, `l'`)
and record it. A short read means the line stayed cached (retained by the replacement
policy or brought back by a prefetcher), a long one is a miss.

Every probe starts from a flushed eviction set, nothing else is carried between probes.
*/
#[derive(Debug, Default)]
pub struct OccupancyProfiler<T: TimingPrimitives = NativePrimitives> {
    primitives: T,
}

impl<T: TimingPrimitives> OccupancyProfiler<T> {
    pub fn new(primitives: T) -> Self {
        OccupancyProfiler { primitives }
    }

    pub fn primitives(&self) -> &T {
        &self.primitives
    }

    /// Number of records `run` emits, saturating at `usize::MAX`.
    pub fn probe_count<B: Backing>(
        set: &EvictionSet<B>,
        iterations: usize,
        policy: ProbeLinePolicy,
    ) -> usize {
        iterations
            .saturating_mul(set.cache_sets())
            .saturating_mul(set.cache_sets())
            .saturating_mul(policy.lines_per_set(set))
    }

    /// Full sweep over every target set. Returns the number of records written.
    ///
    /// Records come in generation order: iteration, target set, candidate set, candidate
    /// line. A sink failure stops the run, records already handed over stay where they are.
    pub fn run<B: Backing, S: RecordSink>(
        &self,
        set: &mut EvictionSet<B>,
        iterations: usize,
        policy: ProbeLinePolicy,
        sink: &mut S,
    ) -> Result<usize, ProfileError> {
        if set.is_released() {
            return Err(ProfileError::Released);
        }
        log::info!(
            "occupancy profile: {} iterations, {:?}, {} probes",
            iterations,
            policy,
            Self::probe_count(set, iterations, policy)
        );

        let mut count = 0;
        for iteration in 0..iterations {
            for target_set in 0..set.cache_sets() {
                count += self.sweep(set, iteration, target_set, policy, sink)?;
            }
            log::debug!("iteration {} done", iteration);
        }
        sink.flush()?;
        Ok(count)
    }

    /// Same as `run`, restricted to a single target set.
    pub fn run_target_set<B: Backing, S: RecordSink>(
        &self,
        set: &mut EvictionSet<B>,
        target_set: usize,
        iterations: usize,
        policy: ProbeLinePolicy,
        sink: &mut S,
    ) -> Result<usize, ProfileError> {
        if set.is_released() {
            return Err(ProfileError::Released);
        }
        if target_set >= set.cache_sets() {
            return Err(ProfileError::TargetSetOutOfRange {
                target: target_set,
                sets: set.cache_sets(),
            });
        }
        log::info!(
            "occupancy profile of set {}: {} iterations, {:?}",
            target_set,
            iterations,
            policy
        );

        let mut count = 0;
        for iteration in 0..iterations {
            count += self.sweep(set, iteration, target_set, policy, sink)?;
        }
        sink.flush()?;
        Ok(count)
    }

    fn sweep<B: Backing, S: RecordSink>(
        &self,
        set: &mut EvictionSet<B>,
        iteration: usize,
        target_set: usize,
        policy: ProbeLinePolicy,
        sink: &mut S,
    ) -> Result<usize, ProfileError> {
        let lines = policy.lines_per_set(set);
        let mut count = 0;
        for s_prime in 0..set.cache_sets() {
            for l_prime in 0..lines {
                let line = match policy {
                    ProbeLinePolicy::All => set.line_address(s_prime, l_prime),
                    ProbeLinePolicy::OccupationOnly => set.occupation_line_address(s_prime, l_prime),
                };
                // In range by construction of the loops.
                let Some(line) = line else { continue };

                let cycles = self.probe(set, target_set, line);
                sink.record(&OccupancyRecord {
                    set: target_set,
                    iteration,
                    s_prime,
                    l_prime,
                    cycles,
                })?;
                self.primitives.full_fence();
                count += 1;
            }
        }
        Ok(count)
    }

    #[inline(always)]
    fn probe<B: Backing>(&self, set: &mut EvictionSet<B>, target_set: usize, line: *const u8) -> u64 {
        set.flush_all(&self.primitives);
        set.prime_set_unchecked(&self.primitives, target_set);
        unsafe { self.primitives.timed_read(line) }
    }
}
