//! The try-commit process.
//!
//! Each try-commit validates the pages hashed to it. Per iteration it drains
//! the owning worker of every stage in stage order, checks each read and
//! write against its [`TokenTable`], and buffers the legal writes in an arena
//! that lives for one iteration. Only once every stage has passed does it
//! forward the writes to commit, each stage's group followed by that stage's
//! `EOI`.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::error::{MisspecReason, RuntimeResult};
use crate::heap::batch::decode_records;
use crate::packet::encode::RUN_MAX;
use crate::packet::{CheckKind, ChunkHandle, Packet, PacketKind};
use crate::pipeline::{ProcessControlBlock, Topology, Transport};
use crate::queue::Stall;

use super::TokenTable;

/// How a try-commit process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryCommitOutcome {
    /// Stage 0 took the loop exit at `iteration`.
    LoopExit { iteration: u64, code: u32 },
    /// Validation failed at `iteration`.
    Misspeculated { iteration: u64 },
    /// Another process misspeculated, or commit went away.
    Stopped { iteration: u64 },
}

/// A validated write waiting for the rest of its iteration.
struct Buffered<'b> {
    stage: usize,
    addr: usize,
    data: &'b [u8],
    shadow: &'b [u8],
}

pub struct TryCommit<'a> {
    node: u32,
    commit: u32,
    topology: &'a Topology,
    pcb: &'a ProcessControlBlock,
    transport: &'a mut Transport,
    tokens: TokenTable,
    iteration: u64,
}

impl<'a> TryCommit<'a> {
    /// Try-commit number `index`, starting at iteration `first`.
    pub fn new(
        index: usize,
        first: u64,
        topology: &'a Topology,
        pcb: &'a ProcessControlBlock,
        transport: &'a mut Transport,
    ) -> Self {
        Self {
            node: topology.try_commit_node(index),
            commit: topology.commit_node(),
            topology,
            pcb,
            transport,
            tokens: TokenTable::new(),
            iteration: first,
        }
    }

    pub fn node(&self) -> u32 {
        self.node
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    pub fn current_iter(&self) -> u64 {
        self.iteration
    }

    /// Validate iterations until one of the stop conditions.
    ///
    /// Always leaves a terminal marker for commit and closes this process's
    /// inbound queues.
    pub fn run(&mut self) -> RuntimeResult<TryCommitOutcome> {
        log::debug!("try-commit {} starts at iteration {}", self.node, self.iteration);
        let mut arena = Bump::new();
        let outcome = loop {
            arena.reset();
            if let Some(outcome) = self.iterate(&arena)? {
                break outcome;
            }
            self.iteration += 1;
        };
        self.finish(outcome);
        Ok(outcome)
    }

    fn iterate<'b>(&mut self, arena: &'b Bump) -> RuntimeResult<Option<TryCommitOutcome>> {
        let iteration = self.iteration;
        if self.pcb.aborts(iteration) {
            return Ok(Some(TryCommitOutcome::Stopped { iteration }));
        }
        self.tokens.begin_iteration(iteration);

        let mut writes = BumpVec::new_in(arena);
        for stage in 0..self.topology.num_stages() {
            if let Some(outcome) = self.drain_stage(stage, arena, &mut writes)? {
                return Ok(Some(outcome));
            }
        }
        if let Some(outcome) = self.emit(&writes)? {
            return Ok(Some(outcome));
        }
        self.transport.flush_from(self.node);
        log::trace!(
            "try-commit {}: iteration {iteration} validated, {} writes",
            self.node,
            writes.len()
        );
        Ok(None)
    }

    fn drain_stage<'b>(
        &mut self,
        stage: usize,
        arena: &'b Bump,
        writes: &mut BumpVec<'b, Buffered<'b>>,
    ) -> RuntimeResult<Option<TryCommitOutcome>> {
        let iteration = self.iteration;
        let owner = self.topology.owner(stage, iteration);
        let kind = self.topology.kind(stage);
        let stopped = Some(TryCommitOutcome::Stopped { iteration });

        loop {
            let pcb = self.pcb;
            let Ok(packet) = self
                .transport
                .link(owner, self.node)?
                .consume_with(|| pcb.aborts(iteration))
            else {
                return Ok(stopped);
            };

            match packet.kind {
                PacketKind::Eoi if packet.iteration == iteration => return Ok(None),
                PacketKind::Eoi | PacketKind::Predict => {}
                PacketKind::Boi => {
                    if !self.send(packet)? {
                        return Ok(stopped);
                    }
                }
                PacketKind::Data => {
                    let len = packet.len();
                    let shadow = packet.shadow_bytes();
                    if let Err(reason) = self.tokens.validate(packet.addr(), &shadow[..len], stage, kind) {
                        return Ok(Some(self.violation(reason)));
                    }
                    if packet.check.has_write() {
                        writes.push(Buffered {
                            stage,
                            addr: packet.addr(),
                            data: arena.alloc_slice_copy(&packet.value_bytes()[..len]),
                            shadow: arena.alloc_slice_copy(&shadow[..len]),
                        });
                    }
                }
                PacketKind::Super => {
                    let handle = packet.chunk();
                    let pool = self.transport.pool(owner)?;
                    let (page, data, shadow) = pool.read(handle);
                    let verdict = self.tokens.validate(page, &shadow[..], stage, kind);
                    if verdict.is_ok() && packet.check.has_write() {
                        writes.push(Buffered {
                            stage,
                            addr: page,
                            data: arena.alloc_slice_copy(&data[..]),
                            shadow: arena.alloc_slice_copy(&shadow[..]),
                        });
                    }
                    pool.release(handle, self.node);
                    if let Err(reason) = verdict {
                        return Ok(Some(self.violation(reason)));
                    }
                }
                PacketKind::AllocBatch => {
                    let handle = packet.chunk();
                    let pool = self.transport.pool(owner)?;
                    let (_, data, _) = pool.read(handle);
                    let records: Vec<_> = decode_records(&data[..], packet.len()).collect();
                    pool.release(handle, self.node);
                    for record in &records {
                        if !self.send(Packet::alloc_event(iteration, record))? {
                            return Ok(stopped);
                        }
                    }
                }
                PacketKind::Alloc | PacketKind::Free => {
                    if !self.send(packet)? {
                        return Ok(stopped);
                    }
                }
                PacketKind::Eow => {
                    let code = packet.aux;
                    self.send(Packet::eow(iteration, code))?;
                    return Ok(Some(TryCommitOutcome::LoopExit { iteration, code }));
                }
                PacketKind::Misspec => return Ok(stopped),
            }
        }
    }

    fn emit(&mut self, writes: &[Buffered<'_>]) -> RuntimeResult<Option<TryCommitOutcome>> {
        let iteration = self.iteration;
        let stopped = Some(TryCommitOutcome::Stopped { iteration });
        for stage in 0..self.topology.num_stages() {
            for write in writes.iter().filter(|w| w.stage == stage) {
                let packet = if write.data.len() <= RUN_MAX {
                    Packet::data(iteration, write.addr, write.data, write.shadow, CheckKind::Write)
                } else {
                    let Some(handle) = self.acquire_chunk()? else {
                        return Ok(stopped);
                    };
                    let pool = self.transport.pool_mut(self.node)?;
                    pool.fill(handle, write.addr, |data, shadow| {
                        data.copy_from_slice(write.data);
                        shadow.copy_from_slice(write.shadow);
                    });
                    pool.publish(handle, 1 << self.commit);
                    Packet::super_page(iteration, write.addr, handle, CheckKind::Write)
                };
                if !self.send(packet)? {
                    return Ok(stopped);
                }
            }
            if !self.send(Packet::eoi(iteration, stage))? {
                return Ok(stopped);
            }
        }
        Ok(None)
    }

    fn acquire_chunk(&mut self) -> RuntimeResult<Option<ChunkHandle>> {
        let mut stall = Stall::new();
        loop {
            if let Some(handle) = self.transport.pool_mut(self.node)?.acquire() {
                return Ok(Some(handle));
            }
            self.transport.flush_from(self.node);
            if self.pcb.aborts(self.iteration) || self.transport.link(self.node, self.commit)?.is_closed() {
                return Ok(None);
            }
            stall.wait();
        }
    }

    /// Send to commit. False once commit is gone or the iteration is wasted.
    fn send(&mut self, packet: Packet) -> RuntimeResult<bool> {
        let pcb = self.pcb;
        let iteration = self.iteration;
        let queue = self.transport.link(self.node, self.commit)?;
        Ok(queue.produce_with(packet, || pcb.aborts(iteration)).is_ok())
    }

    /// `misspec()` on behalf of the try-commit.
    fn violation(&mut self, reason: MisspecReason) -> TryCommitOutcome {
        let iteration = self.iteration;
        self.pcb.record_misspec(iteration, self.node, &reason);
        log::warn!("try-commit {}: misspeculation at iteration {iteration}: {reason}", self.node);
        TryCommitOutcome::Misspeculated { iteration }
    }

    fn finish(&mut self, outcome: TryCommitOutcome) {
        match outcome {
            TryCommitOutcome::LoopExit { .. } => {}
            TryCommitOutcome::Misspeculated { iteration } | TryCommitOutcome::Stopped { iteration } => {
                if let Ok(queue) = self.transport.link(self.node, self.commit) {
                    queue.try_produce(Packet::misspec(iteration, self.node));
                }
            }
        }
        self.transport.flush_from(self.node);
        self.transport.close_into(self.node);
        log::debug!("try-commit {} done: {outcome:?}", self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;
    use crate::pipeline::StageSpec;
    use crate::shadow::bits::*;

    const A: usize = 0x2000_0000_1000;

    struct Rig {
        topology: Topology,
        pcb: ProcessControlBlock,
        transport: Transport,
    }

    fn rig() -> Rig {
        let _ = env_logger::builder().is_test(true).try_init();
        let topology =
            Topology::new(vec![StageSpec::sequential(), StageSpec::parallel(2)], 1).unwrap();
        let config = RuntimeConfig {
            queue_capacity: 256,
            chunk_pool_size: 4,
            ..RuntimeConfig::default()
        };
        let transport = Transport::new(&topology, &config).unwrap();
        Rig {
            topology,
            pcb: ProcessControlBlock::new().unwrap(),
            transport,
        }
    }

    impl Rig {
        fn worker_sends(&mut self, wid: u32, packets: &[Packet]) {
            let tc = self.topology.try_commit_node(0);
            let queue = self.transport.link(wid, tc).unwrap();
            for &p in packets {
                queue.produce(p).unwrap();
            }
            queue.flush();
        }

        fn committed(&mut self) -> Vec<Packet> {
            let (tc, commit) = (self.topology.try_commit_node(0), self.topology.commit_node());
            let queue = self.transport.link(tc, commit).unwrap();
            std::iter::from_fn(|| queue.try_consume()).collect()
        }

        fn run(&mut self) -> TryCommitOutcome {
            TryCommit::new(0, 0, &self.topology, &self.pcb, &mut self.transport)
                .run()
                .unwrap()
        }
    }

    fn write(iter: u64, addr: usize, value: u8) -> Packet {
        Packet::data(iter, addr, &[value], &[WRITE], CheckKind::Write)
    }

    fn read(iter: u64, addr: usize) -> Packet {
        Packet::data(iter, addr, &[0], &[READ | READ_BEFORE_WRITE], CheckKind::Read)
    }

    #[test]
    fn test_forward_flow_commits_in_stage_order() {
        let mut rig = rig();
        // stage 0 (wid 0) writes A in iteration 0; the stage 1 replica owning
        // iteration 1 (wid 2) reads it one iteration later
        rig.worker_sends(0, &[Packet::boi(0), write(0, A, 1), Packet::eoi(0, 0)]);
        rig.worker_sends(0, &[Packet::boi(1), write(1, A + 16, 2), Packet::eoi(1, 0)]);
        rig.worker_sends(0, &[Packet::eow(2, 0)]);
        rig.worker_sends(1, &[write(0, A + 8, 5), Packet::eoi(0, 1)]);
        rig.worker_sends(2, &[read(1, A), write(1, A + 24, 6), Packet::eoi(1, 1)]);

        assert_eq!(rig.run(), TryCommitOutcome::LoopExit { iteration: 2, code: 0 });
        let kinds: Vec<(PacketKind, u64)> = rig.committed().iter().map(|p| (p.kind, p.iteration)).collect();
        use PacketKind::*;
        assert_eq!(
            kinds,
            vec![
                (Boi, 0), (Data, 0), (Eoi, 0), (Data, 0), (Eoi, 0),
                (Boi, 1), (Data, 1), (Eoi, 1), (Data, 1), (Eoi, 1),
                (Eow, 2),
            ]
        );
        assert!(!rig.pcb.misspeculated());
    }

    #[test]
    fn test_same_iteration_read_misspeculates() {
        let mut rig = rig();
        rig.worker_sends(0, &[Packet::boi(0), Packet::eoi(0, 0)]);
        rig.worker_sends(0, &[Packet::boi(1), write(1, A, 3), Packet::eoi(1, 0)]);
        rig.worker_sends(1, &[Packet::eoi(0, 1)]);
        rig.worker_sends(2, &[read(1, A), Packet::eoi(1, 1)]);

        assert_eq!(rig.run(), TryCommitOutcome::Misspeculated { iteration: 1 });
        assert_eq!(rig.pcb.misspec_iter(), Some(1));
        assert_eq!(rig.pcb.misspec_wid(), rig.topology.try_commit_node(0));
        let out = rig.committed();
        // iteration 0 went through, iteration 1 never released its writes
        assert!(out.iter().filter(|p| p.iteration == 1).all(|p| p.kind != PacketKind::Data));
        assert_eq!(out.last().map(|p| p.kind), Some(PacketKind::Misspec));
        assert!(rig.transport.link(0, rig.topology.try_commit_node(0)).unwrap().is_closed());
    }

    #[test]
    fn test_dense_pages_travel_as_chunks() {
        let mut rig = rig();
        let page = A & !0xfff;
        let handle = {
            let pool = rig.transport.pool_mut(0).unwrap();
            let handle = pool.acquire().unwrap();
            pool.fill(handle, page, |data, shadow| {
                data.fill(0xab);
                shadow.fill(WRITE);
            });
            pool.publish(handle, 1 << rig.topology.try_commit_node(0));
            handle
        };
        rig.worker_sends(
            0,
            &[Packet::boi(0), Packet::super_page(0, page, handle, CheckKind::Write), Packet::eoi(0, 0)],
        );
        rig.worker_sends(0, &[Packet::eow(1, 3)]);
        rig.worker_sends(1, &[Packet::eoi(0, 1)]);

        assert_eq!(rig.run(), TryCommitOutcome::LoopExit { iteration: 1, code: 3 });
        assert!(rig.transport.pool(0).unwrap().is_available(handle), "consumer released the chunk");
        let out = rig.committed();
        let sup = out.iter().find(|p| p.kind == PacketKind::Super).unwrap();
        let pool = rig.transport.pool(rig.topology.try_commit_node(0)).unwrap();
        let (addr, data, _) = pool.read(sup.chunk());
        assert_eq!(addr, page);
        assert!(data.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_stops_at_recorded_misspeculation() {
        let mut rig = rig();
        rig.pcb.record_misspec(0, 1, &MisspecReason::Explicit(0));
        assert_eq!(rig.run(), TryCommitOutcome::Stopped { iteration: 0 });
        assert_eq!(rig.committed().last().map(|p| p.kind), Some(PacketKind::Misspec));
    }
}
