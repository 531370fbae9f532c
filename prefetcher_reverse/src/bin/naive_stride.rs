use cache_utils::mmap::MMappedMemory;
use cache_utils::{pin_to_core, NativePrimitives};
use clap::Parser;
use prefetcher_reverse::{
    init_logger, next_line_test, stride_test, write_csv, ExperimentError, STRIDES,
};
use std::path::PathBuf;
use std::process::ExitCode;

const BUF_LEN: usize = 1 << 20;
const LINE_SIZE: usize = 64;
const NEXT_LINE_MAX_TRAINING: usize = 64;
const STRIDE_MAX_TRAINING: usize = 32;

/// Look for next-line and stride prefetching: train on a few lines, time the next one.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value_t = 50_000)]
    next_line_samples: usize,

    /// Samples per stride.
    #[arg(long, default_value_t = 5_000)]
    stride_samples: usize,

    /// `next_line.csv` and `strides/<stride>.csv` go there.
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    #[arg(long)]
    core: Option<usize>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(args: &Args) -> Result<(), ExperimentError> {
    let mut target = MMappedMemory::try_new(BUF_LEN)?;
    let mut eviction = MMappedMemory::try_new(BUF_LEN)?;
    let target = target.slice_mut();
    let eviction = eviction.slice_mut();

    log::info!("Testing next line...");
    let results = next_line_test(
        &NativePrimitives,
        target,
        eviction,
        LINE_SIZE,
        args.next_line_samples,
        NEXT_LINE_MAX_TRAINING,
    )?;
    write_csv(args.output_dir.join("next_line.csv"), &results)?;

    log::info!("Testing stride...");
    for stride in STRIDES {
        let results = stride_test(
            &NativePrimitives,
            target,
            eviction,
            LINE_SIZE,
            stride,
            args.stride_samples,
            STRIDE_MAX_TRAINING,
        )?;
        log::info!("Finished stride of {}", stride);
        write_csv(
            args.output_dir.join("strides").join(format!("{}.csv", stride)),
            &results,
        )?;
    }
    Ok(())
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
