//! The parent's view of the runtime.
//!
//! [`Runtime`] owns the heap window and the parent's allocator; it is what
//! sequential code (before the loop, after it, and during recovery) uses.
//! [`RuntimeContext`] adds the invocation lifecycle on top: it forks the
//! stage workers and try-commit processes, runs commit in the parent, and
//! restarts the pipeline after recovery.

use std::ptr;

use crate::commit::{CommitOutcome, CommitTarget, Committer, ProcessMemory, TryCommit};
use crate::heap::{HeapClass, HeapId, HeapLayout, HeapMirror, TrackedRegion};
use crate::pipeline::{drive, Children, ProcessControlBlock, SpeculativeLoop, Topology, Transport, Worker, WorkerEnv};
use crate::predict::{PredictorId, PredictorSpec, Predictors};
use crate::queue::{ChannelId, ValueQueues};
use crate::shadow::{protect, shadow_address, FaultTable, SHADOW_BIT};

use super::config::RuntimeConfig;
use super::error::{RuntimeError, RuntimeResult};
use super::region::{self, page_of, MappedRegion, Protection, PAGE_SIZE};

/// The heap window, its shadow and the parent's allocator.
pub struct Runtime {
    config: RuntimeConfig,
    layout: HeapLayout,
    mirror: HeapMirror,
    _window: MappedRegion,
    _shadow: MappedRegion,
    /// Shadow of every tracked region outside the window.
    tracked_shadow: Vec<MappedRegion>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let layout = HeapLayout::from_config(&config);
        let window = MappedRegion::reserve_fixed(layout.base, layout.len())?;
        let shadow = MappedRegion::reserve_fixed(shadow_address(layout.base), layout.len())?;
        log::debug!(
            "heap window {:#x}+{:#x}, {} slots of {} arenas",
            layout.base,
            layout.len(),
            layout.slots,
            HeapClass::COUNT
        );
        Ok(Self {
            mirror: HeapMirror::new(layout, config.arena_chunk_size, true),
            config,
            layout,
            _window: window,
            _shadow: shadow,
            tracked_shadow: Vec::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn mirror(&self) -> &HeapMirror {
        &self.mirror
    }

    /// Track `addr..addr + len` in place: memory that exists before the loop,
    /// such as globals or the caller's stack frame, which stage code then reads
    /// and writes through the instrumentation.
    ///
    /// The range grows to whole pages and its shadow is mapped read/write now,
    /// so workers forked later inherit it. Pages already tracked with the same
    /// class are skipped; versioned memory only comes from the allocator.
    pub fn register_region(&mut self, addr: usize, len: usize, class: HeapClass) -> RuntimeResult<()> {
        let invalid = |reason: String| RuntimeError::InvalidConfig { reason };
        if class == HeapClass::Versioned {
            return Err(invalid("versioned memory must come from the allocator".to_string()));
        }
        let (begin, end) = addr
            .checked_add(len)
            .filter(|_| len > 0)
            .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
            .map(|end| (page_of(addr), end))
            .ok_or_else(|| invalid(format!("cannot track {len} bytes at {addr:#x}")))?;
        if begin & SHADOW_BIT != (end - 1) & SHADOW_BIT {
            return Err(invalid(format!("{begin:#x}..{end:#x} straddles the shadow bit")));
        }
        let shadow_base = shadow_address(self.layout.base);
        let overlaps = |base: usize| begin < base + self.layout.len() && base < end;
        if overlaps(self.layout.base) || overlaps(shadow_base) {
            return Err(invalid(format!("{begin:#x}..{end:#x} overlaps the heap window")));
        }
        if let Some(other) = self.mirror.regions().iter().find(|r| r.overlaps(begin, end) && r.class != class) {
            return Err(invalid(format!(
                "{begin:#x}..{end:#x} overlaps {} memory at {:#x}..{:#x}",
                other.class.name(),
                other.begin,
                other.end
            )));
        }

        let mut page = begin;
        while page < end {
            if let Some(existing) = self.mirror.tracked(page) {
                page = existing.end;
                continue;
            }
            let run_end = self
                .mirror
                .regions()
                .iter()
                .filter(|r| r.begin > page)
                .map(|r| r.begin)
                .fold(end, usize::min);
            let shadow = MappedRegion::reserve_fixed(shadow_address(page), run_end - page)?;
            region::protect(shadow.addr(), shadow.len(), Protection::ReadWrite)?;
            self.tracked_shadow.push(shadow);
            self.mirror.track(TrackedRegion {
                begin: page,
                end: run_end,
                class,
            });
            page = run_end;
        }
        Ok(())
    }

    fn main_heap(&self, class: HeapClass) -> HeapId {
        HeapId::new(class, self.layout.main_slot())
    }

    pub fn malloc(&mut self, class: HeapClass, size: usize) -> RuntimeResult<usize> {
        self.mirror.alloc(self.main_heap(class), size)
    }

    pub fn calloc(&mut self, class: HeapClass, count: usize, size: usize) -> RuntimeResult<usize> {
        let bytes = count.checked_mul(size).ok_or_else(|| RuntimeError::InvalidConfig {
            reason: format!("calloc of {count} x {size} bytes overflows"),
        })?;
        self.malloc(class, bytes)
    }

    pub fn realloc(&mut self, class: HeapClass, old: usize, size: usize) -> RuntimeResult<usize> {
        let fresh = self.malloc(class, size)?;
        if old != 0 {
            let len = self.mirror.size_of(old).ok_or(RuntimeError::ForeignPointer { ptr: old })?;
            // SAFETY: both are live allocations in backing mapped read/write.
            unsafe { ptr::copy_nonoverlapping(old as *const u8, fresh as *mut u8, len.min(size)) };
            self.free(old)?;
        }
        Ok(fresh)
    }

    pub fn free(&mut self, ptr: usize) -> RuntimeResult<()> {
        if ptr != 0 {
            self.mirror.free(ptr)?;
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `addr` must lie in an allocation of the heap window.
    pub unsafe fn load<T: Copy>(&self, addr: usize) -> T {
        // SAFETY: forwarded to the caller.
        unsafe { ptr::read_unaligned(addr as *const T) }
    }

    /// # Safety
    ///
    /// `addr` must lie in an allocation of the heap window.
    pub unsafe fn store<T: Copy>(&mut self, addr: usize, value: T) {
        // SAFETY: forwarded to the caller.
        unsafe { ptr::write_unaligned(addr as *mut T, value) }
    }

    /// Little-endian value of `len` bytes at `addr`; zero outside the backing.
    pub fn load_value(&mut self, addr: usize, len: usize) -> u64 {
        ProcessMemory::new(&mut self.mirror).load(addr, len)
    }
}

/// Per-invocation shared state.
struct Invocation {
    topology: Topology,
    pcb: ProcessControlBlock,
    transport: Transport,
    values: ValueQueues,
    children: Children,
}

pub struct RuntimeContext {
    runtime: Runtime,
    predictors: Predictors,
    invocation: Option<Invocation>,
}

fn no_invocation() -> RuntimeError {
    RuntimeError::InvalidConfig {
        reason: "no invocation in progress".to_string(),
    }
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            runtime: Runtime::new(config)?,
            predictors: Predictors::new(),
            invocation: None,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    fn invocation(&self) -> RuntimeResult<&Invocation> {
        self.invocation.as_ref().ok_or_else(no_invocation)
    }

    pub fn topology(&self) -> RuntimeResult<&Topology> {
        Ok(&self.invocation()?.topology)
    }

    pub fn pcb(&self) -> RuntimeResult<&ProcessControlBlock> {
        Ok(&self.invocation()?.pcb)
    }

    pub fn last_committed(&self) -> Option<u64> {
        self.invocation.as_ref().and_then(|inv| inv.pcb.last_committed())
    }

    pub fn misspec_iter(&self) -> Option<u64> {
        self.invocation.as_ref().and_then(|inv| inv.pcb.misspec_iter())
    }

    /// Set up the shared state for a loop split as `topology`.
    pub fn begin_invocation(&mut self, topology: Topology) -> RuntimeResult<()> {
        if self.invocation.is_some() {
            return Err(RuntimeError::InvalidConfig {
                reason: "an invocation is already in progress".to_string(),
            });
        }
        let config = self.runtime.config();
        if topology.workers() > config.worker_budget() {
            return Err(RuntimeError::InvalidTopology {
                reason: format!(
                    "{} workers exceed the budget of {}",
                    topology.workers(),
                    config.worker_budget()
                ),
            });
        }
        if config.pin_cores {
            crate::pipeline::spawn::pin_to_core(topology.commit_node() as usize);
        }
        let invocation = Invocation {
            pcb: ProcessControlBlock::new()?,
            transport: Transport::new(&topology, config)?,
            values: ValueQueues::new(config.value_queue_capacity),
            children: Children::new(),
            topology,
        };
        log::debug!(
            "invocation begins: {} stages, {} workers, {} try-commits",
            invocation.topology.num_stages(),
            invocation.topology.workers(),
            invocation.topology.try_commits()
        );
        self.invocation = Some(invocation);
        Ok(())
    }

    /// [`Runtime::register_region`], before any invocation forks its workers.
    pub fn register_region(&mut self, addr: usize, len: usize, class: HeapClass) -> RuntimeResult<()> {
        if self.invocation.is_some() {
            return Err(RuntimeError::InvalidConfig {
                reason: "regions must be registered before the invocation begins".to_string(),
            });
        }
        self.runtime.register_region(addr, len, class)
    }

    pub fn register_predictor(&mut self, spec: PredictorSpec) -> RuntimeResult<PredictorId> {
        self.predictors.register(spec)
    }

    /// A value channel from every replica of `from_stage` to every replica of `to_stage`.
    pub fn create_queue(&mut self, from_stage: usize, to_stage: usize) -> RuntimeResult<ChannelId> {
        let inv = self.invocation.as_mut().ok_or_else(no_invocation)?;
        inv.values.create_queue(&inv.topology, from_stage, to_stage)
    }

    /// Fork every stage worker and every try-commit process, in node order.
    ///
    /// Children enter at iteration `first`.
    pub fn spawn_workers_callback<L: SpeculativeLoop + ?Sized>(
        &mut self,
        first: u64,
        body: &mut L,
    ) -> RuntimeResult<()> {
        let inv = self.invocation.as_mut().ok_or_else(no_invocation)?;
        let Invocation {
            topology,
            pcb,
            transport,
            values,
            children,
        } = inv;
        let (topology, pcb): (&Topology, &ProcessControlBlock) = (topology, pcb);
        let config = &self.runtime.config;
        let mirror = &mut self.runtime.mirror;
        let predicting = !self.predictors.is_empty();
        let pin = |node: u32| config.pin_cores.then_some(node as usize);

        for wid in 0..topology.workers() as u32 {
            children.spawn(wid, pin(wid), || {
                let faults = init_worker(mirror, config)?;
                let env = WorkerEnv {
                    topology,
                    config,
                    pcb,
                    transport: &mut *transport,
                    values: &mut *values,
                    mirror: &mut *mirror,
                    faults: Some(faults),
                    predicting,
                };
                let mut worker = Worker::new(wid, first, env);
                drive(&mut worker, &mut *body)
            })?;
        }
        for index in 0..topology.try_commits() {
            let node = topology.try_commit_node(index);
            children.spawn(node, pin(node), || {
                let outcome = TryCommit::new(index, first, topology, pcb, &mut *transport).run()?;
                log::debug!("try-commit {node} done: {outcome:?}");
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Run commit in the parent until the loop exits or misspeculates.
    pub fn commit(&mut self, first: u64) -> RuntimeResult<CommitOutcome> {
        let inv = self.invocation.as_mut().ok_or_else(no_invocation)?;
        let Invocation {
            topology,
            pcb,
            transport,
            children,
            ..
        } = inv;
        let mut target = ProcessMemory::new(&mut self.runtime.mirror);
        let mut committer = Committer::new(first, topology, pcb, transport, &mut self.predictors, &mut target);
        let mut watchdog = || children.poll();
        committer.run(&mut watchdog)
    }

    pub fn join_children(&mut self) -> RuntimeResult<()> {
        let inv = self.invocation.as_mut().ok_or_else(no_invocation)?;
        inv.children.join()
    }

    /// Reset the shared state so the pipeline can restart after recovery.
    pub fn recovery_finished(&mut self, exit: Option<u32>) -> RuntimeResult<()> {
        let inv = self.invocation.as_mut().ok_or_else(no_invocation)?;
        log::debug!(
            "recovery finished after misspeculation at {:?} (exit {exit:?})",
            inv.pcb.misspec_iter()
        );
        inv.transport.reset();
        inv.values.reset();
        inv.pcb.reset();
        self.predictors.reset();
        Ok(())
    }

    /// Run the loop speculatively from iteration `first` to its exit.
    ///
    /// Misspeculated iterations are re-executed by [`SpeculativeLoop::recover`]
    /// and the pipeline restarts right after them.
    pub fn run<L: SpeculativeLoop + ?Sized>(&mut self, body: &mut L, first: u64) -> RuntimeResult<u32> {
        let mut first = first;
        loop {
            let memory = ProcessMemory::new(&mut self.runtime.mirror);
            self.predictors.snapshot(|ptr, size| memory.load(ptr, size));

            let spawned = self.spawn_workers_callback(first, body);
            let outcome = spawned.and_then(|()| self.commit(first));
            if outcome.is_err() {
                if let Some(inv) = self.invocation.as_mut() {
                    inv.children.kill_all();
                }
            }
            let joined = self.join_children();
            let outcome = outcome?;
            joined?;

            match outcome {
                CommitOutcome::Exited { iteration, code } => {
                    log::debug!("loop exited with {code} at iteration {iteration}");
                    return Ok(code);
                }
                CommitOutcome::Misspeculated { iteration } => {
                    let low = self.last_committed().map_or(first, |c| c + 1);
                    let high = self.misspec_iter().unwrap_or(iteration).max(low);
                    log::debug!("recovering iterations {low}..={high}");
                    let exit = body.recover(&mut self.runtime, low, high)?;
                    self.recovery_finished(exit)?;
                    if let Some(code) = exit {
                        return Ok(code);
                    }
                    first = high + 1;
                    log::debug!("pipeline restarts at iteration {first}");
                }
            }
        }
    }

    /// Tear the invocation down. Registered predictors go with it.
    pub fn end_invocation(&mut self) -> RuntimeResult<()> {
        let mut inv = self.invocation.take().ok_or_else(no_invocation)?;
        inv.children.kill_all();
        let joined = inv.children.join();
        self.predictors = Predictors::new();
        log::debug!("invocation ends");
        joined
    }
}

/// `init_worker`: the lazy mirror and fault table of a fresh worker process.
fn init_worker(mirror: &mut HeapMirror, config: &RuntimeConfig) -> RuntimeResult<&'static FaultTable> {
    mirror.set_eager(false);
    let extents = mirror.extents();
    // SAFETY: the mirror lives until this process exits and never reallocates its extents.
    let table = unsafe {
        FaultTable::new(
            *mirror.layout(),
            extents.as_ptr(),
            extents.len(),
            config.touched_page_capacity,
        )
        .with_regions(mirror.regions())
    };
    protect::install(table)
}
