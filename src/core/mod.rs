// This module is the central hub of the runtime's core infrastructure, shared by every process
// role. It organizes the error types (fatal RuntimeError, recoverable MisspecReason and the
// StageError a stage body returns), the runtime configuration and its environment overrides,
// owning handles over anonymous and fixed-address memory mappings (region), and the parent's
// view of the runtime (context): the Runtime that owns the heap window and the parent's
// allocator, and the RuntimeContext that drives an invocation through spawn, commit, recovery
// and restart. The test_utils module gives tests private heap windows and a fork lock.

//! Core runtime infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - [`RuntimeError`] for fatal failures, with the [`RuntimeResult`] alias
//! - [`MisspecReason`] and [`Misspeculation`] for recoverable ones
//!
//! ## Configuration (`config`)
//! - [`RuntimeConfig`] defaults, `SPECPIPE_*` overrides and validation
//!
//! ## Memory mappings (`region`)
//! - [`MappedRegion`] for shared queues, the control block and the heap window
//!
//! ## Lifecycle (`context`)
//! - [`Runtime`] for sequential code, [`RuntimeContext`] for invocations

pub mod config;
pub mod context;
pub mod error;
pub mod region;
pub mod test_utils;

pub use config::RuntimeConfig;
pub use context::{Runtime, RuntimeContext};
pub use error::{MisspecReason, Misspeculation, RuntimeError, RuntimeResult, StageError};
pub use region::{MappedRegion, Protection, PAGE_SIZE};
