use cache_utils::address::GeometryError;
use cache_utils::mmap::MmapError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvictionSetError {
    #[error("cannot allocate the eviction set: {0}")]
    Allocation(#[from] MmapError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("an eviction set needs at least one line per set")]
    NoLines,
    #[error(
        "{stride} bytes per set stride exceed one {page} byte huge page, set indexes would not hold across the region"
    )]
    StrideTooLarge { stride: usize, page: usize },
    #[error("region base {base:#x} does not map to set 0, block 0 ({set}, {block})")]
    Misaligned { base: usize, set: u64, block: u64 },
    #[error("{cache_lines} + {warmup_lines} lines per set do not fit in the address space")]
    TooLarge {
        cache_lines: usize,
        warmup_lines: usize,
    },
    #[error("region of {given} bytes is smaller than the {needed} bytes required")]
    Undersized { given: usize, needed: usize },
    #[error("target set {target} out of range, the cache has {sets} sets")]
    TargetSetOutOfRange { target: usize, sets: usize },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sink closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot record probe: {0}")]
    Sink(#[from] SinkError),
    #[error("eviction set has been released")]
    Released,
    #[error("target set {target} out of range, the cache has {sets} sets")]
    TargetSetOutOfRange { target: usize, sets: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("target set {target} out of range, the cache has {sets} sets")]
    TargetSetOutOfRange { target: usize, sets: usize },
}
