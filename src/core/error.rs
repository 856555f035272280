// This module defines the error types for the specpipe runtime using the thiserror crate for
// idiomatic Rust error handling. RuntimeError is the fatal error enum: failed memory mappings
// and protection changes, fork failures, exhausted arenas, invalid pipeline topologies or
// configurations, and worker processes that died abnormally. None of these are
// expected on a correct compiler-generated caller and none are recovered from. Recoverable
// failures are a different animal: a Misspeculation records which iteration and worker broke
// sequential semantics and why (MisspecReason), and is funneled through the single misspec()
// primitive so the parent can re-execute the affected iterations sequentially. The module also
// provides RuntimeResult<T> as a convenience alias for Result<T, RuntimeError>.

//! Error types for the specpipe runtime.
//!
//! Using thiserror for both the fatal and the recoverable taxonomy.

use thiserror::Error;

/// Fatal runtime errors. These terminate the invocation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("mmap of {len} bytes failed: {source}")]
    Mmap {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("mprotect of {len} bytes at {addr:#x} failed: {source}")]
    Protect {
        addr: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("address window {base:#x}+{len:#x} is unavailable")]
    WindowUnavailable { base: usize, len: usize },

    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),

    #[error("arena {heap} exhausted: requested {requested} bytes, {remaining} remaining")]
    ArenaExhausted {
        heap: String,
        requested: usize,
        remaining: usize,
    },

    #[error("invalid pipeline topology: {reason}")]
    InvalidTopology { reason: String },

    #[error("invalid runtime configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("worker process {pid} failed: {status}")]
    WorkerFailed { pid: i32, status: String },

    #[error("heap pointer {ptr:#x} does not belong to any arena")]
    ForeignPointer { ptr: usize },
}

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Why an iteration was declared misspeculated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisspecReason {
    #[error("stage {stage} touched {addr:#x} after stage token {token} (reference {reference})")]
    OrderingViolation {
        addr: u64,
        stage: u32,
        token: u8,
        reference: u8,
    },

    #[error("stage {stage} read {addr:#x} validated earlier in the same iteration")]
    SameIterationRead { addr: u64, stage: u32 },

    #[error("predicted value at {addr:#x} did not hold")]
    PredictionMismatch { addr: u64 },

    #[error("value check failed: observed {observed:#x}, expected {expected:#x}")]
    ValueMismatch { observed: u64, expected: u64 },

    #[error("explicit misspeculation (code {0})")]
    Explicit(u32),

    #[error("misspeculation propagated from upstream")]
    Upstream,
}

impl MisspecReason {
    /// Compact code stored in the shared control block.
    pub fn code(&self) -> u32 {
        match self {
            MisspecReason::OrderingViolation { .. } => 1,
            MisspecReason::SameIterationRead { .. } => 2,
            MisspecReason::PredictionMismatch { .. } => 3,
            MisspecReason::ValueMismatch { .. } => 4,
            MisspecReason::Explicit(_) => 5,
            MisspecReason::Upstream => 6,
        }
    }
}

/// A detected violation of sequential semantics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("misspeculation at iteration {iteration} by worker {wid}: {reason}")]
pub struct Misspeculation {
    pub iteration: u64,
    pub wid: u32,
    pub reason: MisspecReason,
}

/// How a stage body (or the runtime on its behalf) stops an iteration early.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Misspec(#[from] MisspecReason),

    #[error(transparent)]
    Fatal(#[from] RuntimeError),
}

impl StageError {
    /// Someone else misspeculated first; this process only has to leave.
    pub fn upstream() -> Self {
        StageError::Misspec(MisspecReason::Upstream)
    }
}
