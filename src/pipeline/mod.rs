// This module implements pipeline control: how the processes of one invocation are numbered
// (topology), what they share (the process control block in pcb, the packet queues and chunk
// pools in transport), how they are created and reaped (spawn), and what a stage worker does
// around every iteration (worker, with its packet production in communicate). Stage workers
// forward the pages they touched to later stages and to the try-commit processes at the end of
// every owned iteration, and apply what earlier stages forwarded before starting the next one,
// so memory forwarding lags one iteration behind. The driver runs a SpeculativeLoop inside a
// worker until the loop exits or the iteration misspeculates.

//! Pipeline control: processes, their shared state and the worker loop.

pub mod communicate;
pub mod driver;
pub mod pcb;
pub mod spawn;
pub mod topology;
pub mod transport;
pub mod worker;

pub use driver::{drive, LoopControl, SpeculativeLoop};
pub use pcb::ProcessControlBlock;
pub use spawn::Children;
pub use topology::{StageKind, StageSpec, Topology};
pub use transport::Transport;
pub use worker::{Step, Worker, WorkerEnv};
