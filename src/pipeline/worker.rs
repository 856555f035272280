//! A stage worker process.
//!
//! [`Worker`] is the handle generated stage code talks to: it brackets every
//! iteration with [`Worker::begin_iter`] / [`Worker::end_iter`], routes heap
//! accesses through the instrumentation, allocates in the worker's own arenas
//! and moves explicit values between stages.

use std::mem;
use std::ptr;

use hashbrown::HashSet;

use crate::core::config::RuntimeConfig;
use crate::core::error::{MisspecReason, RuntimeError, RuntimeResult, StageError};
use crate::core::region::{page_of, PAGE_SIZE};
use crate::heap::batch::decode_records;
use crate::heap::{AllocBatch, AllocRecord, HeapClass, HeapId, HeapMirror};
use crate::packet::encode::{apply_writes, filter_page};
use crate::packet::{Packet, PacketKind};
use crate::predict::Prediction;
use crate::queue::{ChannelId, QueueStop, Stall, ValueQueues, ValueWord};
use crate::shadow::{self, bits, default_scanner, shadow_address, FaultTable, PageScanner};

use super::{ProcessControlBlock, Topology, Transport};

/// What `begin_iter` decided about the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// This worker owns the iteration: run the stage body.
    Run,
    /// Another replica owns it.
    Skip,
    /// The loop exited with this code; leave the pipeline.
    Finish(u32),
}

/// Producer of `wid`'s stage that this worker lags behind.
#[derive(Debug, Clone, Copy)]
struct Upstream {
    wid: u32,
    /// Next iteration this producer owns that has not been drained.
    next: u64,
    replicas: u64,
}

/// Everything a worker borrows from its invocation.
pub struct WorkerEnv<'a> {
    pub topology: &'a Topology,
    pub config: &'a RuntimeConfig,
    pub pcb: &'a ProcessControlBlock,
    pub transport: &'a mut Transport,
    pub values: &'a mut ValueQueues,
    pub mirror: &'a mut HeapMirror,
    pub faults: Option<&'static FaultTable>,
    /// Predictors are registered, so iterations after the first wait for them.
    pub predicting: bool,
}

pub struct Worker<'a> {
    pub(super) wid: u32,
    pub(super) stage: usize,
    replica: usize,
    pub(super) iteration: u64,
    first: u64,
    pub(super) topology: &'a Topology,
    pub(super) pcb: &'a ProcessControlBlock,
    pub(super) transport: &'a mut Transport,
    values: &'a mut ValueQueues,
    pub(super) mirror: &'a mut HeapMirror,
    pub(super) faults: Option<&'static FaultTable>,
    scanner: &'static dyn PageScanner,
    pub(super) super_threshold: usize,
    pub(super) downstream: Vec<u32>,
    pub(super) peers: Vec<u32>,
    pub(super) try_commits: Vec<u32>,
    upstream: Vec<Upstream>,
    predictions: Vec<Prediction>,
    wait_for_predictions: bool,
    pub(super) batch: AllocBatch,
    scratch: Box<[u8]>,
    /// Pages made writable for the runtime since the last re-arm.
    pub(super) unprotected: HashSet<usize>,
}

impl<'a> Worker<'a> {
    /// Worker `wid` entering the pipeline at iteration `first`.
    pub fn new(wid: u32, first: u64, env: WorkerEnv<'a>) -> Self {
        let topology = env.topology;
        let stage = topology.stage_of(wid);
        let upstream = topology
            .upstream_of(wid)
            .filter(|&p| topology.stage_of(p) > 0)
            .map(|p| {
                let replicas = topology.replicas(topology.stage_of(p)) as u64;
                let replica = topology.replica_of(p) as u64;
                Upstream {
                    wid: p,
                    next: first + (replica + replicas - first % replicas) % replicas,
                    replicas,
                }
            })
            .collect();
        Self {
            wid,
            stage,
            replica: topology.replica_of(wid),
            iteration: first,
            first,
            topology,
            pcb: env.pcb,
            transport: env.transport,
            values: env.values,
            mirror: env.mirror,
            faults: env.faults,
            scanner: default_scanner(),
            super_threshold: env.config.super_packet_threshold,
            downstream: topology.downstream_of(wid).collect(),
            peers: topology.peers_of(wid).collect(),
            try_commits: topology.try_commit_nodes().collect(),
            upstream,
            predictions: Vec::new(),
            wait_for_predictions: env.predicting,
            batch: AllocBatch::new(),
            scratch: vec![0; PAGE_SIZE].into_boxed_slice(),
            unprotected: HashSet::new(),
        }
    }

    pub fn wid(&self) -> u32 {
        self.wid
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn current_iter(&self) -> u64 {
        self.iteration
    }

    pub fn owns_iteration(&self) -> bool {
        self.topology.owner(self.stage, self.iteration) == self.wid
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn begin_iter(&mut self) -> Result<Step, StageError> {
        let iteration = self.iteration;
        self.process_reverse_commit_queue()?;

        if self.wait_for_predictions && iteration > self.first {
            let mut stall = Stall::new();
            while !self.pcb.good_to_go() {
                self.process_reverse_commit_queue()?;
                if self.pcb.aborts(iteration) {
                    return Err(StageError::upstream());
                }
                if let Some(code) = self.pcb.exit_code() {
                    return Ok(Step::Finish(code));
                }
                stall.wait();
            }
            self.process_reverse_commit_queue()?;
            self.wait_for_predictions = false;
        }

        if self.pcb.aborts(iteration) {
            return Err(StageError::upstream());
        }
        if self.stage > 0 {
            if let Some(code) = self.drain_upstream()? {
                return Ok(Step::Finish(code));
            }
        }
        if !self.owns_iteration() {
            return Ok(Step::Skip);
        }
        self.install_predictions()?;
        self.rearm()?;
        Ok(Step::Run)
    }

    /// Stage 0: the header chose to run the iteration.
    pub fn announce_iteration(&mut self) -> Result<(), StageError> {
        self.broadcast_event(Packet::boi(self.iteration))?;
        self.transport.flush_from(self.wid);
        Ok(())
    }

    pub fn end_iter(&mut self) -> Result<(), StageError> {
        if self.owns_iteration() {
            self.flush_alloc_batch()?;
            self.sweep()?;
            self.broadcast_event(Packet::eoi(self.iteration, self.stage))?;
            self.transport.flush_from(self.wid);
            log::trace!("worker {}: end of iteration {}", self.wid, self.iteration);
        }
        self.iteration += 1;
        Ok(())
    }

    /// Leave the pipeline at the loop exit. Stage 0 takes the exit, later
    /// stages pass its `EOW` on.
    pub fn worker_finishes(&mut self, code: u32) {
        log::debug!("worker {}: loop exit {code} at iteration {}", self.wid, self.iteration);
        self.depart(Packet::eow(self.iteration, code));
    }

    /// `misspec()`: record a misspeculation of the current iteration and leave.
    pub fn misspec(&mut self, reason: MisspecReason) {
        if reason != MisspecReason::Upstream {
            self.pcb.record_misspec(self.iteration, self.wid, &reason);
            log::warn!(
                "worker {}: misspeculation at iteration {}: {reason}",
                self.wid,
                self.iteration
            );
        }
        self.depart(Packet::misspec(self.iteration, self.wid));
    }

    /// Generated value check.
    pub fn predict(&self, observed: u64, expected: u64) -> Result<(), MisspecReason> {
        if observed == expected {
            Ok(())
        } else {
            Err(MisspecReason::ValueMismatch { observed, expected })
        }
    }

    /// Send a terminal marker to every consumer and close every inbound queue.
    fn depart(&mut self, marker: Packet) {
        let pcb = self.pcb;
        let iteration = self.iteration;
        let wid = self.wid;
        for &to in self.downstream.iter().chain(&self.try_commits) {
            if let Ok(queue) = self.transport.link(wid, to) {
                let _ = queue.produce_with(marker, || pcb.aborts(iteration));
            }
        }
        for &peer in &self.peers {
            if let Ok(queue) = self.transport.link(wid, peer) {
                queue.try_produce(marker);
            }
        }
        self.transport.flush_from(wid);
        self.transport.close_into(wid);
        for queue in self.values.incoming(wid) {
            queue.close();
        }
        for queue in self.values.outgoing(wid) {
            queue.flush();
        }
        log::debug!("worker {wid} leaves at iteration {iteration}: {:?}", marker.kind);
    }

    fn process_reverse_commit_queue(&mut self) -> Result<(), StageError> {
        let commit = self.topology.commit_node();
        loop {
            let Some(packet) = self.transport.link(commit, self.wid)?.try_consume() else {
                return Ok(());
            };
            self.absorb(commit, &packet)?;
        }
    }

    fn next_packet(&mut self, from: u32) -> Result<Packet, StageError> {
        let pcb = self.pcb;
        let iteration = self.iteration;
        self.transport
            .link(from, self.wid)?
            .consume_with(|| pcb.aborts(iteration))
            .map_err(|_| StageError::upstream())
    }

    /// Lagged forwarding: catch up with every earlier stage.
    fn drain_upstream(&mut self) -> Result<Option<u32>, StageError> {
        let iteration = self.iteration;
        let head = self.topology.first_wid(0);
        loop {
            let packet = self.next_packet(head)?;
            match packet.kind {
                PacketKind::Boi if packet.iteration == iteration => break,
                PacketKind::Eow => return Ok(Some(packet.aux)),
                PacketKind::Misspec => return Err(StageError::upstream()),
                _ => self.absorb(head, &packet)?,
            }
        }

        for i in 0..self.upstream.len() {
            let Upstream { wid, replicas, .. } = self.upstream[i];
            while self.upstream[i].next < iteration {
                let until = self.upstream[i].next;
                loop {
                    let packet = self.next_packet(wid)?;
                    match packet.kind {
                        PacketKind::Eoi if packet.iteration == until => break,
                        PacketKind::Eow => return Ok(Some(packet.aux)),
                        PacketKind::Misspec => return Err(StageError::upstream()),
                        _ => self.absorb(wid, &packet)?,
                    }
                }
                self.upstream[i].next += replicas;
            }
        }

        // replicas of this stage only announce allocations
        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            loop {
                let Some(packet) = self.transport.link(peer, self.wid)?.try_consume() else {
                    break;
                };
                self.absorb(peer, &packet)?;
            }
        }
        Ok(None)
    }

    /// Apply one packet received from `from`.
    fn absorb(&mut self, from: u32, packet: &Packet) -> Result<(), StageError> {
        match packet.kind {
            PacketKind::Data if packet.check.has_write() => {
                let len = packet.len();
                make_writable(self.faults, &mut self.unprotected, packet.addr())?;
                // SAFETY: a forwarded run stays inside one page of the heap window,
                // made writable above.
                unsafe {
                    apply_writes(packet.addr(), &packet.value_bytes()[..len], &packet.shadow_bytes()[..len])
                };
            }
            PacketKind::Super => {
                let Self { transport, faults, unprotected, wid, .. } = self;
                let pool = transport.pool(from)?;
                let (page, data, shadow) = pool.read(packet.chunk());
                let applied = if packet.check.has_write() {
                    make_writable(*faults, unprotected, page).map(|()| {
                        // SAFETY: the chunk holds one whole page of the heap window.
                        unsafe { apply_writes(page, &data[..], &shadow[..]) }
                    })
                } else {
                    Ok(())
                };
                pool.release(packet.chunk(), *wid);
                applied?;
            }
            PacketKind::AllocBatch => {
                let Self { transport, mirror, wid, .. } = self;
                let pool = transport.pool(from)?;
                let (_, data, _) = pool.read(packet.chunk());
                let replayed = decode_records(&data[..], packet.len()).try_for_each(|r| mirror.apply(&r));
                pool.release(packet.chunk(), *wid);
                replayed?;
            }
            PacketKind::Alloc | PacketKind::Free => self.mirror.apply(&packet.alloc_record())?,
            PacketKind::Predict => {
                if let Some(prediction) = Prediction::from_packet(packet) {
                    self.predictions.push(prediction);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn install_predictions(&mut self) -> RuntimeResult<()> {
        let iteration = self.iteration;
        for i in 0..self.predictions.len() {
            let prediction = self.predictions[i];
            if iteration < prediction.first {
                continue;
            }
            make_writable(self.faults, &mut self.unprotected, prediction.ptr)?;
            make_writable(self.faults, &mut self.unprotected, prediction.ptr + prediction.size - 1)?;
            let bytes = prediction.value_at(iteration).to_le_bytes();
            for (k, &byte) in bytes[..prediction.size].iter().enumerate() {
                let addr = prediction.ptr + k;
                // SAFETY: both the page and its shadow were made writable above.
                unsafe {
                    ptr::write(addr as *mut u8, byte);
                    *(shadow_address(addr) as *mut u8) |= bits::PREDICTED;
                }
            }
        }
        Ok(())
    }

    fn rearm(&mut self) -> RuntimeResult<()> {
        if let Some(faults) = self.faults {
            faults.clear_touched();
            faults.rearm()?;
        }
        self.unprotected.clear();
        Ok(())
    }

    fn sweep(&mut self) -> Result<(), StageError> {
        let mut filtered = mem::take(&mut self.scratch);
        let swept = self.sweep_pages(&mut filtered);
        self.scratch = filtered;
        if let Some(faults) = self.faults {
            faults.clear_touched();
        }
        swept
    }

    /// Faulted heap pages, then every page of every tracked region.
    fn sweep_pages(&mut self, filtered: &mut [u8]) -> Result<(), StageError> {
        let layout = *self.mirror.layout();
        let touched = self.faults.map(FaultTable::touched_pages).unwrap_or_default();
        for page in touched {
            let Some(id) = layout.locate(page) else {
                continue;
            };
            // SAFETY: a touched page had its shadow mapped by the fault handler.
            let shadow = unsafe { shadow::shadow_page_mut(page) };
            self.sweep_page(page, shadow, id.class, filtered)?;
            shadow[0] = 0;
        }
        for index in 0..self.mirror.regions().len() {
            let region = self.mirror.regions()[index];
            for page in region.pages() {
                // SAFETY: tracked regions have their shadow mapped from registration on.
                let shadow = unsafe { shadow::shadow_page_mut(page) };
                self.sweep_page(page, shadow, region.class, filtered)?;
            }
        }
        Ok(())
    }

    /// Forward what `shadow` records about `page` and clear its access bits.
    fn sweep_page(
        &mut self,
        page: usize,
        shadow: &mut [u8],
        class: HeapClass,
        filtered: &mut [u8],
    ) -> Result<(), StageError> {
        if self.scanner.count_matching(shadow, bits::BYTE_MASK) == 0 {
            return Ok(());
        }
        if class.propagates() {
            let summary = filter_page(shadow, class.checks_reads(), filtered);
            if summary.relevant > 0 {
                // SAFETY: swept pages are readable until the next re-arm.
                let data = unsafe { std::slice::from_raw_parts(page as *const u8, PAGE_SIZE) };
                self.forward_page(page, data, filtered, summary)?;
            }
        }
        shadow.fill(0);
        Ok(())
    }

    /// Read a `T` from tracked memory, recording the access.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `T` inside the heap window or a tracked region.
    pub unsafe fn load<T: Copy>(&self, addr: usize) -> T {
        // SAFETY: forwarded to the caller.
        unsafe {
            let value = ptr::read_unaligned(addr as *const T);
            shadow::ver_read(addr, mem::size_of::<T>());
            value
        }
    }

    /// Write a `T` to tracked memory, recording the access.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for writes of `T` inside the heap window or a tracked region.
    pub unsafe fn store<T: Copy>(&mut self, addr: usize, value: T) {
        // SAFETY: forwarded to the caller.
        unsafe {
            shadow::ver_write(addr, mem::size_of::<T>());
            ptr::write_unaligned(addr as *mut T, value);
        }
    }

    /// # Safety
    ///
    /// Both ranges must be valid tracked memory.
    pub unsafe fn memmove(&mut self, dst: usize, src: usize, len: usize) {
        // SAFETY: forwarded to the caller.
        unsafe { shadow::ver_memmove(dst, src, len) }
    }

    /// `ver_malloc` in this worker's arena of `class`.
    pub fn malloc(&mut self, class: HeapClass, size: usize) -> Result<usize, StageError> {
        let id = HeapId::new(class, self.wid as usize);
        let ptr = self.mirror.alloc(id, size)?;
        if self.batch.push(AllocRecord::alloc(id, ptr, size)) {
            self.flush_alloc_batch()?;
        }
        Ok(ptr)
    }

    /// Arena memory is never reused, so fresh allocations are already zero.
    pub fn calloc(&mut self, class: HeapClass, count: usize, size: usize) -> Result<usize, StageError> {
        let bytes = count.checked_mul(size).ok_or_else(|| RuntimeError::InvalidConfig {
            reason: format!("calloc of {count} x {size} bytes overflows"),
        })?;
        self.malloc(class, bytes)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of the heap window.
    pub unsafe fn realloc(&mut self, class: HeapClass, ptr: usize, size: usize) -> Result<usize, StageError> {
        let fresh = self.malloc(class, size)?;
        if ptr != 0 {
            let old = self.mirror.size_of(ptr).ok_or(RuntimeError::ForeignPointer { ptr })?;
            // SAFETY: both allocations are live heap window memory.
            unsafe { shadow::ver_memmove(fresh, ptr, old.min(size)) };
            self.free(ptr)?;
        }
        Ok(fresh)
    }

    pub fn free(&mut self, ptr: usize) -> Result<(), StageError> {
        if ptr == 0 {
            return Ok(());
        }
        let id = self.mirror.free(ptr)?;
        if self.batch.push(AllocRecord::free(id, ptr)) {
            self.flush_alloc_batch()?;
        }
        Ok(())
    }

    fn value_endpoint(&mut self, channel: ChannelId, from: u32, to: u32) -> RuntimeResult<&mut crate::queue::Queue<ValueWord>> {
        self.values
            .endpoint(channel, from, to)
            .ok_or_else(|| RuntimeError::InvalidTopology {
                reason: format!("value channel {} has no queue {from} -> {to}", channel.0),
            })
    }

    fn channel_stages(&self, channel: ChannelId) -> RuntimeResult<(usize, usize)> {
        let c = self.values.channel(channel).ok_or_else(|| RuntimeError::InvalidTopology {
            reason: format!("unknown value channel {}", channel.0),
        })?;
        Ok((c.from_stage, c.to_stage))
    }

    fn push_value(&mut self, channel: ChannelId, to: u32, value: u64) -> Result<(), StageError> {
        let pcb = self.pcb;
        let iteration = self.iteration;
        let wid = self.wid;
        let queue = self.value_endpoint(channel, wid, to)?;
        let word = ValueWord { iteration, value };
        match queue.produce_with(word, || pcb.aborts(iteration)) {
            Ok(()) => {
                queue.flush();
                Ok(())
            }
            Err(QueueStop::Closed) => Ok(()),
            Err(QueueStop::Aborted) => Err(StageError::upstream()),
        }
    }

    fn pull_value(&mut self, channel: ChannelId) -> Result<ValueWord, StageError> {
        let (from_stage, _) = self.channel_stages(channel)?;
        let from = self.topology.owner(from_stage, self.iteration);
        let pcb = self.pcb;
        let iteration = self.iteration;
        let wid = self.wid;
        self.value_endpoint(channel, from, wid)?
            .consume_with(|| pcb.aborts(iteration))
            .map_err(|_| StageError::upstream())
    }

    /// Send `value` to the consumer stage's owner of this iteration.
    pub fn produce(&mut self, channel: ChannelId, value: u64) -> Result<(), StageError> {
        let (_, to_stage) = self.channel_stages(channel)?;
        let to = self.topology.owner(to_stage, self.iteration);
        self.push_value(channel, to, value)
    }

    /// Send `value` to every replica of the consumer stage.
    pub fn produce_replicated(&mut self, channel: ChannelId, value: u64) -> Result<(), StageError> {
        let (_, to_stage) = self.channel_stages(channel)?;
        let topology = self.topology;
        for to in topology.stage_workers(to_stage) {
            self.push_value(channel, to, value)?;
        }
        Ok(())
    }

    pub fn consume(&mut self, channel: ChannelId) -> Result<u64, StageError> {
        Ok(self.pull_value(channel)?.value)
    }

    /// Consume a replicated value, skipping words of iterations this replica did not own.
    pub fn consume_replicated(&mut self, channel: ChannelId) -> Result<u64, StageError> {
        loop {
            let word = self.pull_value(channel)?;
            if word.iteration >= self.iteration {
                return Ok(word.value);
            }
        }
    }
}

/// Give the runtime write access to `addr`'s page without marking it touched.
pub(super) fn make_writable(
    faults: Option<&FaultTable>,
    unprotected: &mut HashSet<usize>,
    addr: usize,
) -> RuntimeResult<()> {
    let page = page_of(addr);
    if let Some(faults) = faults {
        if unprotected.insert(page) {
            faults.unprotect_page(page)?;
        }
    }
    Ok(())
}
