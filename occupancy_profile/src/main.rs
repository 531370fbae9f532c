use cache_utils::{pin_to_core, NativePrimitives};
use clap::Parser;
use occupancy_profile::{
    ConfigError, CsvSink, EvictionSet, EvictionSetError, GeometryPreset, OccupancyProfiler,
    ProbeLinePolicy, ProfileConfig, ProfileError, SinkError,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

/// Occupancy profile (PAPP) of one cache level, written as Set,Iteration,SPrime,LPrime,Cycles CSV.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration, flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache geometry preset.
    #[arg(long, value_enum)]
    cache: Option<GeometryPreset>,

    #[arg(long)]
    line_size: Option<usize>,

    #[arg(long)]
    sets: Option<usize>,

    /// Associativity of the cache.
    #[arg(long)]
    ways: Option<usize>,

    /// Occupation lines per set (defaults to the associativity).
    #[arg(long)]
    cache_lines: Option<usize>,

    #[arg(short, long)]
    warmup_lines: Option<usize>,

    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    #[arg(long, value_enum)]
    policy: Option<ProbeLinePolicy>,

    /// Profile only this target set (repeatable), one CSV per set.
    #[arg(short = 's', long = "target-set")]
    target_sets: Vec<usize>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pin to this core before allocating.
    #[arg(long)]
    core: Option<usize>,

    /// More output, repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    EvictionSet(#[from] EvictionSetError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("cannot pin to core {core}: {source}")]
    Affinity { core: usize, source: nix::Error },
    #[error("cannot create {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Args {
    fn into_config(self) -> Result<ProfileConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ProfileConfig::from_file(path)?,
            None => ProfileConfig::default(),
        };
        if let Some(preset) = self.cache {
            config.geometry = preset.geometry();
        }
        if let Some(line_size) = self.line_size {
            config.geometry.line_size = line_size;
            config.geometry.block_bits = None;
        }
        if let Some(sets) = self.sets {
            config.geometry.sets = sets;
            config.geometry.set_bits = None;
        }
        if let Some(ways) = self.ways {
            config.geometry.associativity = ways;
        }
        if self.cache_lines.is_some() {
            config.cache_lines = self.cache_lines;
        }
        if let Some(warmup_lines) = self.warmup_lines {
            config.warmup_lines = warmup_lines;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if !self.target_sets.is_empty() {
            config.target_sets = self.target_sets;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if self.core.is_some() {
            config.core = self.core;
        }
        config.validate()?;
        Ok(config)
    }
}

fn create_parent(path: &Path) -> Result<(), Error> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| Error::Output {
                path: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

fn run(config: &ProfileConfig) -> Result<(), Error> {
    if let Some(core) = config.core {
        pin_to_core(core).map_err(|source| Error::Affinity { core, source })?;
    }

    let mut es = EvictionSet::new(&config.geometry, config.cache_lines(), config.warmup_lines)?;
    let profiler = OccupancyProfiler::new(NativePrimitives);

    if config.target_sets.is_empty() {
        create_parent(&config.output)?;
        let mut sink = CsvSink::create(&config.output)?;
        let n = profiler.run(&mut es, config.iterations, config.policy, &mut sink)?;
        log::info!("{} probes written to {}", n, config.output.display());
    } else {
        for &target_set in &config.target_sets {
            let path = config.target_output(target_set);
            create_parent(&path)?;
            let mut sink = CsvSink::create(&path)?;
            let n = profiler.run_target_set(
                &mut es,
                target_set,
                config.iterations,
                config.policy,
                &mut sink,
            )?;
            log::info!("{} probes written to {}", n, path.display());
        }
    }

    es.release();
    log::info!("Finished");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
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

    match args.into_config().and_then(|config| run(&config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
