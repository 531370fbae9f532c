use cache_utils::mmap::MMappedMemory;
use cache_utils::{pin_to_core, NativePrimitives};
use clap::Parser;
use prefetcher_reverse::{init_logger, measure_latencies, write_csv, ExperimentError, LatencySizes};
use std::path::PathBuf;
use std::process::ExitCode;

/// Read latency of one line when it sits in L1, L2, L3 or RAM.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(short = 'n', long, default_value_t = 100_000)]
    samples: usize,

    #[arg(short, long, default_value = "results/timing.csv")]
    output: PathBuf,

    #[arg(long)]
    core: Option<usize>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(args: &Args) -> Result<(), ExperimentError> {
    let sizes = LatencySizes::default();
    let mut target = MMappedMemory::try_new(sizes.buffer_len())?;
    let mut eviction = MMappedMemory::try_new(sizes.buffer_len())?;

    let samples = measure_latencies(
        &NativePrimitives,
        target.slice_mut(),
        eviction.slice_mut(),
        &sizes,
        args.samples,
    )?;
    write_csv(&args.output, &samples)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);

    if let Some(core) = args.core {
        if let Err(e) = pin_to_core(core) {
            log::error!("cannot pin to core {}: {}", core, e);
            return ExitCode::FAILURE;
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
