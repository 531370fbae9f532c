#![deny(unsafe_op_in_unsafe_fn)]

//! Small experiments that characterise the memory hierarchy and its prefetchers before
//! running an occupancy profile: per-level read latency and the next-line / stride
//! prefetch response to a training walk.

pub mod latency;
pub mod stride;

use cache_utils::mmap::MmapError;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use latency::{measure_latencies, LatencySample, LatencySizes};
pub use stride::{next_line_test, stride_test, TrainingSample, STRIDES};

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Allocation(#[from] MmapError),
    #[error("buffer of {len} bytes is too small, the experiment touches {needed} bytes")]
    BufferTooSmall { needed: usize, len: usize },
    #[error("the training size range is empty")]
    NoTraining,
    #[error("line size must be non-zero")]
    ZeroLineSize,
    #[error("cannot create {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// stderr logger for the experiment binaries, `-v` raises the level, `RUST_LOG` overrides.
pub fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .format_timestamp(None)
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();
}

pub(crate) fn check_line_size(line_size: usize) -> Result<(), ExperimentError> {
    if line_size == 0 {
        Err(ExperimentError::ZeroLineSize)
    } else {
        Ok(())
    }
}

pub(crate) fn check_len(buffer: &[u8], needed: usize) -> Result<(), ExperimentError> {
    if buffer.len() < needed {
        Err(ExperimentError::BufferTooSmall {
            needed,
            len: buffer.len(),
        })
    } else {
        Ok(())
    }
}

/// Serialize `records` as CSV to any writer, the header comes from the serde field names.
pub fn write_records<W: Write, R: Serialize>(
    writer: W,
    records: &[R],
) -> Result<W, ExperimentError> {
    let mut writer = csv::Writer::from_writer(writer);
    for r in records {
        writer.serialize(r)?;
    }
    writer
        .into_inner()
        .map_err(|e| ExperimentError::Csv(e.into_error().into()))
}

/// Write `records` to `path`, creating the parent directories.
pub fn write_csv<P: AsRef<Path>, R: Serialize>(
    path: P,
    records: &[R],
) -> Result<(), ExperimentError> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ExperimentError::Output {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| ExperimentError::Output {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file = write_records(std::io::BufWriter::new(file), records)?;
    file.flush().map_err(|source| ExperimentError::Output {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("{} rows written to {}", records.len(), path.display());
    Ok(())
}
