//! The loop a worker process runs.

use crate::core::context::Runtime;
use crate::core::error::{MisspecReason, RuntimeResult, StageError};

use super::worker::{Step, Worker};

/// Result of evaluating the loop header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Leave the loop with this exit code.
    Exit(u32),
}

/// A loop split into pipeline stages.
///
/// `header` runs in stage 0 only, before the stage body of the same iteration.
/// `recover` re-executes iterations `low..=high` sequentially on committed state
/// and returns the exit code if the loop exits among them.
pub trait SpeculativeLoop {
    fn header(&mut self, worker: &mut Worker<'_>) -> Result<LoopControl, StageError>;

    fn stage(&mut self, stage: usize, worker: &mut Worker<'_>) -> Result<(), StageError>;

    fn recover(&mut self, runtime: &mut Runtime, low: u64, high: u64) -> RuntimeResult<Option<u32>>;
}

/// Run `worker` until it leaves the pipeline.
///
/// Misspeculation is a normal way out; only fatal errors are returned.
pub fn drive<L: SpeculativeLoop + ?Sized>(worker: &mut Worker<'_>, body: &mut L) -> RuntimeResult<()> {
    loop {
        match run_iteration(worker, body) {
            Ok(None) => {}
            Ok(Some(code)) => {
                worker.worker_finishes(code);
                return Ok(());
            }
            Err(StageError::Misspec(reason)) => {
                worker.misspec(reason);
                return Ok(());
            }
            Err(StageError::Fatal(err)) => {
                log::error!("worker {} failed at iteration {}: {err}", worker.wid(), worker.current_iter());
                worker.misspec(MisspecReason::Upstream);
                return Err(err);
            }
        }
    }
}

fn run_iteration<L: SpeculativeLoop + ?Sized>(
    worker: &mut Worker<'_>,
    body: &mut L,
) -> Result<Option<u32>, StageError> {
    match worker.begin_iter()? {
        Step::Finish(code) => return Ok(Some(code)),
        Step::Skip => {
            worker.end_iter()?;
            return Ok(None);
        }
        Step::Run => {}
    }
    if worker.stage() == 0 {
        match body.header(worker)? {
            LoopControl::Continue => worker.announce_iteration()?,
            LoopControl::Exit(code) => return Ok(Some(code)),
        }
    }
    let stage = worker.stage();
    body.stage(stage, worker)?;
    worker.end_iter()?;
    Ok(None)
}
