//! The commit process.
//!
//! Runs in the parent. For every iteration it reads each stage's validated
//! writes from every try-commit, in stage order, and applies them to the
//! [`CommitTarget`] only once the whole iteration has arrived.

use std::collections::VecDeque;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::error::{MisspecReason, RuntimeResult};
use crate::packet::{Packet, PacketKind};
use crate::pipeline::{ProcessControlBlock, Topology, Transport};
use crate::predict::Predictors;
use crate::queue::Stall;

use super::CommitTarget;

/// How the commit loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Stage 0 took the loop exit at `iteration`; every earlier iteration committed.
    Exited { iteration: u64, code: u32 },
    /// Nothing from `iteration` on was committed.
    Misspeculated { iteration: u64 },
}

struct Staged<'b> {
    addr: usize,
    data: &'b [u8],
    shadow: &'b [u8],
}

/// Polled while commit waits; an error ends the commit loop.
pub type Watchdog<'w> = dyn FnMut() -> RuntimeResult<()> + 'w;

pub struct Committer<'a, T: CommitTarget> {
    node: u32,
    topology: &'a Topology,
    pcb: &'a ProcessControlBlock,
    transport: &'a mut Transport,
    predictors: &'a mut Predictors,
    target: &'a mut T,
    first: u64,
    iteration: u64,
    /// Reverse-queue packets per worker not yet accepted by the queue.
    backlog: Vec<VecDeque<Packet>>,
    go_pending: bool,
}

impl<'a, T: CommitTarget> Committer<'a, T> {
    pub fn new(
        first: u64,
        topology: &'a Topology,
        pcb: &'a ProcessControlBlock,
        transport: &'a mut Transport,
        predictors: &'a mut Predictors,
        target: &'a mut T,
    ) -> Self {
        Self {
            node: topology.commit_node(),
            topology,
            pcb,
            transport,
            predictors,
            target,
            first,
            iteration: first,
            backlog: vec![VecDeque::new(); topology.workers()],
            go_pending: false,
        }
    }

    pub fn current_iter(&self) -> u64 {
        self.iteration
    }

    /// Commit iterations until the loop exits or misspeculates.
    pub fn run(&mut self, watchdog: &mut Watchdog<'_>) -> RuntimeResult<CommitOutcome> {
        log::debug!("commit starts at iteration {}", self.first);
        let mut arena = Bump::new();
        let result = loop {
            arena.reset();
            match self.iterate(&arena, watchdog) {
                Ok(Some(outcome)) => break Ok(outcome),
                Ok(None) => self.iteration += 1,
                Err(err) => break Err(err),
            }
        };
        self.transport.close_into(self.node);
        if let Ok(outcome) = &result {
            log::debug!("commit done: {outcome:?}, last committed {:?}", self.pcb.last_committed());
        }
        result
    }

    fn iterate<'b>(
        &mut self,
        arena: &'b Bump,
        watchdog: &mut Watchdog<'_>,
    ) -> RuntimeResult<Option<CommitOutcome>> {
        let iteration = self.iteration;
        if self.pcb.aborts(iteration) {
            return Ok(Some(self.aborted()));
        }

        let mut staged = BumpVec::new_in(arena);
        for stage in 0..self.topology.num_stages() {
            for k in 0..self.topology.try_commits() {
                let tc = self.topology.try_commit_node(k);
                loop {
                    let Some(packet) = self.next_packet(tc, watchdog)? else {
                        return Ok(Some(self.aborted()));
                    };
                    match packet.kind {
                        PacketKind::Eoi if packet.iteration == iteration && packet.aux as usize == stage => {
                            break
                        }
                        PacketKind::Eoi | PacketKind::AllocBatch | PacketKind::Predict => {}
                        PacketKind::Boi => {
                            if packet.iteration == iteration {
                                if let Some(outcome) = self.verify_loop_invariants(iteration) {
                                    return Ok(Some(outcome));
                                }
                            }
                        }
                        PacketKind::Alloc | PacketKind::Free => {
                            self.target.apply_alloc(&packet.alloc_record())?;
                            if iteration == self.first {
                                for queue in &mut self.backlog {
                                    queue.push_back(packet);
                                }
                            }
                        }
                        PacketKind::Data => {
                            let len = packet.len();
                            staged.push(Staged {
                                addr: packet.addr(),
                                data: arena.alloc_slice_copy(&packet.value_bytes()[..len]),
                                shadow: arena.alloc_slice_copy(&packet.shadow_bytes()[..len]),
                            });
                        }
                        PacketKind::Super => {
                            let pool = self.transport.pool(tc)?;
                            let (page, data, shadow) = pool.read(packet.chunk());
                            staged.push(Staged {
                                addr: page,
                                data: arena.alloc_slice_copy(&data[..]),
                                shadow: arena.alloc_slice_copy(&shadow[..]),
                            });
                            pool.release(packet.chunk(), self.node);
                        }
                        PacketKind::Eow => {
                            self.pcb.set_exit_code(packet.aux);
                            return Ok(Some(CommitOutcome::Exited {
                                iteration,
                                code: packet.aux,
                            }));
                        }
                        PacketKind::Misspec => return Ok(Some(self.aborted())),
                    }
                }
            }
        }

        for write in &staged {
            self.target.store(write.addr, write.data, write.shadow)?;
        }
        self.pcb.set_last_committed(iteration);
        log::trace!("committed iteration {iteration} ({} writes)", staged.len());

        if iteration == self.first {
            self.establish_predictors()?;
        }
        Ok(None)
    }

    /// `verify_loop_invariants`: predictions must hold at the start of `iteration`.
    fn verify_loop_invariants(&mut self, iteration: u64) -> Option<CommitOutcome> {
        let target = &*self.target;
        let addr = self
            .predictors
            .verify(iteration, |ptr, size| target.load(ptr, size))
            .map(|p| p.ptr)?;
        let reason = MisspecReason::PredictionMismatch { addr: addr as u64 };
        self.pcb.record_misspec(iteration, self.node, &reason);
        log::warn!("commit: misspeculation at iteration {iteration}: {reason}");
        Some(CommitOutcome::Misspeculated { iteration })
    }

    fn establish_predictors(&mut self) -> RuntimeResult<()> {
        if !self.predictors.is_empty() {
            let target = &*self.target;
            let established = self
                .predictors
                .establish(self.iteration, |ptr, size| target.load(ptr, size));
            for prediction in established {
                log::debug!(
                    "prediction at {:#x}: base {:#x} stride {:#x} from iteration {}",
                    prediction.ptr,
                    prediction.base,
                    prediction.stride,
                    prediction.first
                );
                for queue in &mut self.backlog {
                    queue.push_back(prediction.to_packet());
                }
            }
        }
        self.go_pending = true;
        self.pump()
    }

    /// Push reverse-queue backlog; announce `good_to_go` once all of it is out.
    fn pump(&mut self) -> RuntimeResult<()> {
        for (wid, backlog) in self.backlog.iter_mut().enumerate() {
            if backlog.is_empty() {
                continue;
            }
            let queue = self.transport.link(self.node, wid as u32)?;
            while let Some(&packet) = backlog.front() {
                if queue.is_closed() {
                    backlog.clear();
                } else if queue.try_produce(packet) {
                    backlog.pop_front();
                } else {
                    break;
                }
            }
            queue.flush();
        }
        if self.go_pending && self.backlog.iter().all(VecDeque::is_empty) {
            self.go_pending = false;
            self.pcb.set_good_to_go();
            log::debug!("good to go after iteration {}", self.first);
        }
        Ok(())
    }

    fn next_packet(&mut self, tc: u32, watchdog: &mut Watchdog<'_>) -> RuntimeResult<Option<Packet>> {
        let mut stall = Stall::new();
        loop {
            if let Some(packet) = self.transport.link(tc, self.node)?.try_consume() {
                return Ok(Some(packet));
            }
            if self.pcb.aborts(self.iteration) {
                return Ok(None);
            }
            self.pump()?;
            watchdog()?;
            stall.wait();
        }
    }

    fn aborted(&self) -> CommitOutcome {
        CommitOutcome::Misspeculated {
            iteration: self.pcb.misspec_iter().unwrap_or(self.iteration),
        }
    }
}
