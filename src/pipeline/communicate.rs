//! Worker-side packet production: swept pages, events and allocation batches.

use crate::core::error::{RuntimeResult, StageError};
use crate::core::region::PAGE_SIZE;
use crate::packet::encode::{check_of, runs, PageSummary};
use crate::packet::{ChunkHandle, Packet};
use crate::queue::{QueueStop, Stall};

use super::worker::Worker;

impl Worker<'_> {
    fn node_bit(node: u32) -> u64 {
        1u64 << node
    }

    /// Forward one swept page: as a super packet when dense, as runs otherwise.
    pub(super) fn forward_page(
        &mut self,
        page: usize,
        data: &[u8],
        filtered: &[u8],
        summary: PageSummary,
    ) -> Result<(), StageError> {
        let tc = self.topology.try_commit_node(self.topology.try_commit_for_page(page));
        if summary.relevant > self.super_threshold {
            let mut consumers = Self::node_bit(tc);
            if summary.written > 0 {
                consumers |= self.downstream.iter().fold(0, |mask, &w| mask | Self::node_bit(w));
            }
            let Some(handle) = self.acquire_chunk()? else {
                return Err(StageError::upstream());
            };
            let pool = self.transport.pool_mut(self.wid)?;
            pool.fill(handle, page, |chunk_data, chunk_shadow| {
                chunk_data.copy_from_slice(&data[..PAGE_SIZE]);
                chunk_shadow.copy_from_slice(&filtered[..PAGE_SIZE]);
            });
            pool.publish(handle, consumers);

            let packet = Packet::super_page(self.iteration, page, handle, summary.check());
            self.send(tc, packet)?;
            if summary.written > 0 {
                self.send_downstream(packet)?;
            }
            return Ok(());
        }

        for (offset, len) in runs(filtered) {
            let range = offset..offset + len;
            self.forward_packet(page + offset, &data[range.clone()], &filtered[range], tc)?;
        }
        Ok(())
    }

    /// Send one run to its try-commit, and to later stages when it writes.
    pub(super) fn forward_packet(
        &mut self,
        addr: usize,
        value: &[u8],
        shadow: &[u8],
        tc: u32,
    ) -> Result<(), StageError> {
        let check = check_of(shadow);
        let packet = Packet::data(self.iteration, addr, value, shadow, check);
        if check.has_write() {
            self.send_downstream(packet)?;
        }
        self.send(tc, packet)
    }

    /// `BOI`, `EOI` and single allocation events go to every later stage and every try-commit.
    pub(super) fn broadcast_event(&mut self, packet: Packet) -> Result<(), StageError> {
        self.send_downstream(packet)?;
        for i in 0..self.try_commits.len() {
            let tc = self.try_commits[i];
            self.send(tc, packet)?;
        }
        Ok(())
    }

    pub(super) fn send_downstream(&mut self, packet: Packet) -> Result<(), StageError> {
        for i in 0..self.downstream.len() {
            let to = self.downstream[i];
            self.send(to, packet)?;
        }
        Ok(())
    }

    /// A consumer that already left is skipped.
    pub(super) fn send(&mut self, to: u32, packet: Packet) -> Result<(), StageError> {
        let pcb = self.pcb;
        let iteration = self.iteration;
        match self.transport.link(self.wid, to)?.produce_with(packet, || pcb.aborts(iteration)) {
            Ok(()) | Err(QueueStop::Closed) => Ok(()),
            Err(QueueStop::Aborted) => Err(StageError::upstream()),
        }
    }

    /// Wait for a free chunk. Consumers that left give up their chunks.
    pub(super) fn acquire_chunk(&mut self) -> RuntimeResult<Option<ChunkHandle>> {
        let mut stall = Stall::new();
        loop {
            if let Some(handle) = self.transport.pool_mut(self.wid)?.acquire() {
                return Ok(Some(handle));
            }
            self.transport.flush_from(self.wid);
            for to in 0..self.transport.nodes() as u32 {
                if self.transport.has_link(self.wid, to) && self.transport.link(self.wid, to)?.is_closed() {
                    self.transport.pool(self.wid)?.release_all(to);
                }
            }
            if self.pcb.aborts(self.iteration) {
                return Ok(None);
            }
            stall.wait();
        }
    }

    /// Ship the pending allocation records to everyone who mirrors this worker's arenas.
    pub(super) fn flush_alloc_batch(&mut self) -> Result<(), StageError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let tc = self.topology.try_commit_node((self.iteration % self.topology.try_commits() as u64) as usize);
        let mut consumers = Self::node_bit(tc);
        for &w in self.downstream.iter().chain(&self.peers) {
            consumers |= Self::node_bit(w);
        }

        let Some(handle) = self.acquire_chunk()? else {
            return Err(StageError::upstream());
        };
        let Self { transport, batch, wid, .. } = self;
        let pool = transport.pool_mut(*wid)?;
        let mut count = 0;
        pool.fill(handle, 0, |data, _| count = batch.drain_into(&mut data[..]));
        pool.publish(handle, consumers);
        log::trace!("worker {}: {count} allocation records at iteration {}", self.wid, self.iteration);

        let packet = Packet::alloc_batch(self.iteration, handle, count);
        self.send(tc, packet)?;
        self.send_downstream(packet)?;
        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            self.send(peer, packet)?;
        }
        Ok(())
    }
}
