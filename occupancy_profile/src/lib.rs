#![deny(unsafe_op_in_unsafe_fn)]

//! PRIME+PROBE occupancy profiling of a set-associative cache, following the PAPP
//! methodology: flush an eviction set, prime one congruence class, time a read of every
//! line of the eviction set, and emit one record per probe.

pub mod config;
pub mod error;
pub mod eviction_set;
pub mod profiler;
pub mod sink;

pub use config::{GeometryPreset, ProfileConfig};
pub use error::{ConfigError, EvictionSetError, ProfileError, SinkError};
pub use eviction_set::{EvictionSet, MemoryRegion};
pub use profiler::{OccupancyProfiler, ProbeLinePolicy};
pub use sink::{CsvSink, OccupancyRecord, RecordSink};
