// This module implements the validation and commit half of the protocol. Workers never touch
// the committed state directly; everything they swept is first checked by a try-commit process
// (try_commit) against per-byte ordering tokens (token_table, with the legality rule itself in
// rules), and only then handed to the single commit process (committer), which applies whole
// iterations in order to a CommitTarget (target), replays allocation events into the parent's
// heap mirror, verifies established value predictions at the start of every iteration, and
// advances last_committed in the process control block.

//! Try-commit validation and in-order commit.

pub mod committer;
pub mod rules;
pub mod target;
pub mod token_table;
pub mod try_commit;

pub use committer::{CommitOutcome, Committer, Watchdog};
pub use target::{CommitTarget, ProcessMemory, SparseMemory};
pub use token_table::TokenTable;
pub use try_commit::{TryCommit, TryCommitOutcome};
