//! The process control block.
//!
//! One shared record per invocation, visible to every process. Only
//! [`ProcessControlBlock::record_misspec`] sets the misspeculation state.
//! The iteration, worker and reason of the earliest misspeculation change
//! together under a short spin lock; [`ProcessControlBlock::aborts`] only
//! reads the iteration and never takes it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::core::error::{MisspecReason, RuntimeResult};
use crate::core::region::MappedRegion;

/// `misspec_iter` / `last_committed` value meaning "none".
pub const NONE: u64 = u64::MAX;

#[repr(C)]
struct Shared {
    misspec_iter: CachePadded<AtomicU64>,
    misspeculated: AtomicU32,
    misspec_wid: AtomicU32,
    misspec_reason: AtomicU32,
    record_lock: AtomicU32,
    exit_code: AtomicU32,
    has_exit: AtomicU32,
    last_committed: CachePadded<AtomicU64>,
    good_to_go: CachePadded<AtomicU32>,
}

pub struct ProcessControlBlock {
    region: MappedRegion,
}

impl ProcessControlBlock {
    pub fn new() -> RuntimeResult<Self> {
        let pcb = Self {
            region: MappedRegion::shared(std::mem::size_of::<Shared>())?,
        };
        pcb.reset();
        Ok(pcb)
    }

    fn shared(&self) -> &Shared {
        // SAFETY: the mapping holds one `Shared`, all atomics.
        unsafe { &*(self.region.as_ptr() as *const Shared) }
    }

    /// Zero the record for a new run. No other process may be live.
    pub fn reset(&self) {
        let s = self.shared();
        s.misspec_iter.store(NONE, Ordering::Relaxed);
        s.misspeculated.store(0, Ordering::Relaxed);
        s.misspec_wid.store(0, Ordering::Relaxed);
        s.misspec_reason.store(0, Ordering::Relaxed);
        s.record_lock.store(0, Ordering::Relaxed);
        s.exit_code.store(0, Ordering::Relaxed);
        s.has_exit.store(0, Ordering::Relaxed);
        s.last_committed.store(NONE, Ordering::Relaxed);
        s.good_to_go.store(0, Ordering::Release);
    }

    /// Record a misspeculation at `iteration`. The earliest one wins; returns
    /// true if this call lowered the misspeculated iteration.
    pub fn record_misspec(&self, iteration: u64, wid: u32, reason: &MisspecReason) -> bool {
        let s = self.shared();
        let lowered = self.locked(|| {
            if iteration >= s.misspec_iter.load(Ordering::Acquire) {
                return false;
            }
            s.misspec_wid.store(wid, Ordering::Relaxed);
            s.misspec_reason.store(reason.code(), Ordering::Relaxed);
            s.misspec_iter.store(iteration, Ordering::Release);
            true
        });
        s.misspeculated.store(1, Ordering::Release);
        lowered
    }

    /// Iteration, worker and reason code of the earliest misspeculation,
    /// all from the same [`ProcessControlBlock::record_misspec`] call.
    pub fn misspec_origin(&self) -> Option<(u64, u32, u32)> {
        let s = self.shared();
        self.locked(|| match s.misspec_iter.load(Ordering::Acquire) {
            NONE => None,
            iter => Some((
                iter,
                s.misspec_wid.load(Ordering::Relaxed),
                s.misspec_reason.load(Ordering::Relaxed),
            )),
        })
    }

    fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let lock = &self.shared().record_lock;
        let backoff = Backoff::new();
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        let result = f();
        lock.store(0, Ordering::Release);
        result
    }

    pub fn misspeculated(&self) -> bool {
        self.shared().misspeculated.load(Ordering::Acquire) != 0
    }

    /// Earliest misspeculated iteration, if any.
    pub fn misspec_iter(&self) -> Option<u64> {
        match self.shared().misspec_iter.load(Ordering::Acquire) {
            NONE => None,
            iter => Some(iter),
        }
    }

    /// Work at `iteration` is wasted: something at or before it misspeculated.
    #[inline]
    pub fn aborts(&self, iteration: u64) -> bool {
        self.shared().misspec_iter.load(Ordering::Acquire) <= iteration
    }

    pub fn misspec_wid(&self) -> u32 {
        self.misspec_origin().map_or(0, |(_, wid, _)| wid)
    }

    pub fn misspec_reason_code(&self) -> u32 {
        self.misspec_origin().map_or(0, |(_, _, code)| code)
    }

    pub fn last_committed(&self) -> Option<u64> {
        match self.shared().last_committed.load(Ordering::Acquire) {
            NONE => None,
            iter => Some(iter),
        }
    }

    pub fn set_last_committed(&self, iteration: u64) {
        self.shared().last_committed.store(iteration, Ordering::Release);
    }

    pub fn set_exit_code(&self, code: u32) {
        let s = self.shared();
        s.exit_code.store(code, Ordering::Relaxed);
        s.has_exit.store(1, Ordering::Release);
    }

    pub fn exit_code(&self) -> Option<u32> {
        let s = self.shared();
        (s.has_exit.load(Ordering::Acquire) != 0).then(|| s.exit_code.load(Ordering::Relaxed))
    }

    pub fn good_to_go(&self) -> bool {
        self.shared().good_to_go.load(Ordering::Acquire) != 0
    }

    pub fn set_good_to_go(&self) {
        self.shared().good_to_go.store(1, Ordering::Release);
    }
}
