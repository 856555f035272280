//! specpipe - process-based speculative pipelined execution.
//!
//! A loop partitioned into stages by a compiler runs as a pipeline of forked
//! worker processes. Each worker writes speculatively into its private copy of
//! a fixed-address heap window; the pages it touches are found through
//! protection faults, swept at the end of every iteration and shipped over
//! shared-memory queues to later stages and to try-commit processes. The
//! try-commits check every byte against ordering tokens, and the parent
//! commits validated iterations in order. A violation aborts the pipeline,
//! the parent re-executes the broken iterations sequentially and restarts.
//!
//! # Primary Usage
//!
//! ```ignore
//! use specpipe::core::{RuntimeConfig, RuntimeContext};
//! use specpipe::pipeline::{StageKind, Topology};
//!
//! let config = RuntimeConfig::from_env()?;
//! let mut ctx = RuntimeContext::new(config.clone())?;
//! let topology = Topology::partition(&config, &[StageKind::Sequential, StageKind::Parallel])?;
//! ctx.begin_invocation(topology)?;
//! let code = ctx.run(&mut my_loop, 0)?;
//! ctx.end_invocation()?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - errors, configuration, memory mappings, the runtime context
//! - [`queue`] - shared-memory SPSC queues and value channels
//! - [`packet`] - packets, page chunks and the page encoding
//! - [`shadow`] - shadow memory, instrumentation and fault traps
//! - [`heap`] - heap classes, arenas and allocation broadcast
//! - [`pipeline`] - topology, workers, spawning and the worker loop
//! - [`commit`] - try-commit validation and in-order commit
//! - [`predict`] - value prediction

pub mod commit;
pub mod core;
pub mod heap;
pub mod packet;
pub mod pipeline;
pub mod predict;
pub mod queue;
pub mod shadow;

pub use crate::core::{MisspecReason, Runtime, RuntimeConfig, RuntimeContext, RuntimeError, RuntimeResult, StageError};
pub use heap::HeapClass;
pub use pipeline::{LoopControl, SpeculativeLoop, StageKind, StageSpec, Topology, Worker};
