//! Demo driver: runs a two-stage loop through the speculative pipeline.
//!
//! Stage 0 walks an input array, keeps a running sum and hands every element
//! to stage 1 through a value channel; the replicated stage 1 writes a derived
//! value per element. The result is checked against a plain sequential run.
//!
//! Run with: `specpipe [--iterations N] [--procs P] [--misspec-at I]`

use std::process::ExitCode;

use clap::Parser;

use specpipe::core::{Runtime, RuntimeConfig, RuntimeContext, RuntimeResult, StageError};
use specpipe::pipeline::{LoopControl, SpeculativeLoop, StageKind, Topology, Worker};
use specpipe::queue::ChannelId;
use specpipe::{HeapClass, MisspecReason};

#[derive(Parser)]
#[command(name = "specpipe")]
#[command(about = "Run a demo loop as a speculative process pipeline")]
#[command(version)]
struct Cli {
    /// Loop trip count
    #[arg(short = 'n', long, default_value_t = 1000)]
    iterations: u64,

    /// Processes, the parent included (default: SPECPIPE_NUM_PROCS or the core count)
    #[arg(short, long)]
    procs: Option<usize>,

    /// Try-commit processes
    #[arg(short, long)]
    try_commits: Option<usize>,

    /// Force a misspeculation in stage 1 at this iteration
    #[arg(long)]
    misspec_at: Option<u64>,

    /// Pin every process to its own core
    #[arg(long)]
    pin: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

const ELEM: usize = std::mem::size_of::<u64>();

fn element(i: u64) -> u64 {
    i.wrapping_mul(2_654_435_761) % 1_000
}

fn derive(v: u64) -> u64 {
    v * 3 + 1
}

struct DemoLoop {
    trip: u64,
    input: usize,
    output: usize,
    sum: usize,
    channel: ChannelId,
    misspec_at: Option<u64>,
}

impl SpeculativeLoop for DemoLoop {
    fn header(&mut self, worker: &mut Worker<'_>) -> Result<LoopControl, StageError> {
        if worker.current_iter() < self.trip {
            Ok(LoopControl::Continue)
        } else {
            Ok(LoopControl::Exit(0))
        }
    }

    fn stage(&mut self, stage: usize, worker: &mut Worker<'_>) -> Result<(), StageError> {
        let i = worker.current_iter();
        let slot = i as usize * ELEM;
        match stage {
            0 => {
                // SAFETY: both live in arenas allocated before the invocation.
                unsafe {
                    let v: u64 = worker.load(self.input + slot);
                    let sum: u64 = worker.load(self.sum);
                    worker.store(self.sum, sum + v);
                    worker.produce(self.channel, v)?;
                }
            }
            _ => {
                let v = worker.consume(self.channel)?;
                if self.misspec_at == Some(i) {
                    return Err(MisspecReason::Explicit(1).into());
                }
                // SAFETY: as above.
                unsafe { worker.store(self.output + slot, derive(v)) };
            }
        }
        Ok(())
    }

    fn recover(&mut self, runtime: &mut Runtime, low: u64, high: u64) -> RuntimeResult<Option<u32>> {
        for i in low..=high {
            if i >= self.trip {
                return Ok(Some(0));
            }
            let slot = i as usize * ELEM;
            // SAFETY: as above.
            unsafe {
                let v: u64 = runtime.load(self.input + slot);
                let sum: u64 = runtime.load(self.sum);
                runtime.store(self.sum, sum + v);
                runtime.store(self.output + slot, derive(v));
            }
        }
        Ok(None)
    }
}

fn run(cli: &Cli) -> RuntimeResult<bool> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(procs) = cli.procs {
        config.num_procs = procs;
    }
    if cli.try_commits.is_some() {
        config.num_try_commit = cli.try_commits;
    }
    config.pin_cores = cli.pin;
    let bytes = cli.iterations as usize * ELEM;
    config.arena_size = config.arena_size.max((bytes + 1).next_multiple_of(config.arena_chunk_size));
    config.validate()?;

    let mut ctx = RuntimeContext::new(config.clone())?;
    let rt = ctx.runtime_mut();
    let input = rt.malloc(HeapClass::ReadOnly, bytes)?;
    let output = rt.calloc(HeapClass::Versioned, cli.iterations as usize, ELEM)?;
    let sum = rt.calloc(HeapClass::Versioned, 1, ELEM)?;
    for i in 0..cli.iterations {
        // SAFETY: inside the input allocation.
        unsafe { rt.store(input + i as usize * ELEM, element(i)) };
    }

    let topology = Topology::partition(&config, &[StageKind::Sequential, StageKind::Parallel])?;
    log::info!("pipeline: {:?} with {} try-commits", topology.stages(), topology.try_commits());
    ctx.begin_invocation(topology)?;
    let channel = ctx.create_queue(0, 1)?;
    let mut body = DemoLoop {
        trip: cli.iterations,
        input,
        output,
        sum,
        channel,
        misspec_at: cli.misspec_at,
    };
    let code = ctx.run(&mut body, 0)?;
    ctx.end_invocation()?;

    let rt = ctx.runtime();
    let mut expected_sum = 0u64;
    let mut ok = true;
    for i in 0..cli.iterations {
        let v = element(i);
        expected_sum += v;
        // SAFETY: inside the output allocation.
        let got: u64 = unsafe { rt.load(output + i as usize * ELEM) };
        if got != derive(v) {
            log::error!("output[{i}] = {got}, expected {}", derive(v));
            ok = false;
        }
    }
    // SAFETY: the sum cell.
    let got_sum: u64 = unsafe { rt.load(sum) };
    println!("exit code {code}, sum {got_sum} (expected {expected_sum})");
    Ok(ok && got_sum == expected_sum)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("pipelined result differs from the sequential one");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
