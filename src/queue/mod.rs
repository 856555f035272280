// This module implements the transport the whole runtime is built on: a single-producer
// single-consumer ring buffer living in a shared anonymous mapping, so that the two endpoints
// may be different processes forked from the creator. The shared part is only the two
// published indices, a consumer-closed flag and the slots; each endpoint additionally keeps
// private cursors and a cached copy of the other side's index so the common case touches no
// shared cache line. The producer writes slots ahead of its published head and makes them
// visible in bursts with flush; it publishes whatever it has before it ever stalls on a full
// ring. Stalls spin with crossbeam's Backoff and fall back to short sleeps, polling an abort
// predicate so a blocked endpoint can bail out when the pipeline misspeculates.

//! Shared-memory SPSC queue.

pub mod values;

pub use values::{ChannelId, ValueQueues, ValueWord};

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::region::MappedRegion;

/// Sleep once spinning has not helped.
const STALL_SLEEP: Duration = Duration::from_micros(50);

/// Why a blocking queue operation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStop {
    /// The consumer closed the queue; the value was dropped.
    Closed,
    /// The abort predicate fired.
    Aborted,
}

#[repr(C)]
struct Header {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    closed: CachePadded<AtomicU32>,
}

/// Busy-wait helper shared by every stall in the runtime.
pub struct Stall {
    backoff: Backoff,
}

impl Stall {
    pub fn new() -> Self {
        Self {
            backoff: Backoff::new(),
        }
    }

    pub fn wait(&mut self) {
        if self.backoff.is_completed() {
            thread::sleep(STALL_SLEEP);
        } else {
            self.backoff.snooze();
        }
    }
}

impl Default for Stall {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity SPSC ring of `T`.
pub struct Queue<T: Copy> {
    region: MappedRegion,
    mask: u64,
    capacity: u64,
    // producer side
    local_head: u64,
    published_head: u64,
    cached_tail: u64,
    // consumer side
    local_tail: u64,
    cached_head: u64,
    _marker: PhantomData<T>,
}

// SAFETY: the queue owns its mapping; `T: Copy + Send` values are moved by bit copy.
unsafe impl<T: Copy + Send> Send for Queue<T> {}

impl<T: Copy> Queue<T> {
    /// Create a queue with `capacity` slots. Must be a power of two.
    pub fn create(capacity: usize) -> RuntimeResult<Self> {
        if !capacity.is_power_of_two() {
            return Err(RuntimeError::InvalidConfig {
                reason: format!("queue capacity {capacity} is not a power of two"),
            });
        }
        let region = MappedRegion::shared(Self::slots_offset() + capacity * mem::size_of::<T>())?;
        Ok(Self {
            region,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            local_head: 0,
            published_head: 0,
            cached_tail: 0,
            local_tail: 0,
            cached_head: 0,
            _marker: PhantomData,
        })
    }

    fn slots_offset() -> usize {
        mem::size_of::<Header>().next_multiple_of(mem::align_of::<T>().max(8))
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping starts with a zero-initialised header (all-zero atomics are valid).
        unsafe { &*(self.region.as_ptr() as *const Header) }
    }

    fn slot(&self, index: u64) -> *mut T {
        // SAFETY: masked index stays within the `capacity` slots mapped after the header.
        unsafe {
            (self.region.as_ptr().add(Self::slots_offset()) as *mut T).add((index & self.mask) as usize)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn has_room(&mut self) -> bool {
        if self.local_head - self.cached_tail < self.capacity {
            return true;
        }
        self.cached_tail = self.header().tail.load(Ordering::Acquire);
        self.local_head - self.cached_tail < self.capacity
    }

    fn write(&mut self, value: T) {
        // SAFETY: `has_room` guarantees the consumer is done with this slot.
        unsafe { ptr::write_volatile(self.slot(self.local_head), value) };
        self.local_head += 1;
        if self.local_head - self.published_head >= self.capacity / 4 {
            self.flush();
        }
    }

    /// Enqueue `value`, stalling while the ring is full.
    pub fn produce(&mut self, value: T) -> Result<(), QueueStop> {
        self.produce_with(value, || false)
    }

    /// As [`Queue::produce`], giving up when `abort` returns true.
    pub fn produce_with<F>(&mut self, value: T, mut abort: F) -> Result<(), QueueStop>
    where
        F: FnMut() -> bool,
    {
        if self.is_closed() {
            return Err(QueueStop::Closed);
        }
        if !self.has_room() {
            self.flush();
            let mut stall = Stall::new();
            while !self.has_room() {
                if self.is_closed() {
                    return Err(QueueStop::Closed);
                }
                if abort() {
                    return Err(QueueStop::Aborted);
                }
                stall.wait();
            }
        }
        self.write(value);
        Ok(())
    }

    /// Enqueue without stalling. Returns false if the ring is full or closed.
    pub fn try_produce(&mut self, value: T) -> bool {
        if self.is_closed() || !self.has_room() {
            return false;
        }
        self.write(value);
        true
    }

    /// Publish everything produced so far.
    pub fn flush(&mut self) {
        if self.published_head != self.local_head {
            self.header().head.store(self.local_head, Ordering::Release);
            self.published_head = self.local_head;
        }
    }

    fn has_data(&mut self) -> bool {
        if self.local_tail != self.cached_head {
            return true;
        }
        self.cached_head = self.header().head.load(Ordering::Acquire);
        self.local_tail != self.cached_head
    }

    fn read(&mut self) -> T {
        // SAFETY: `has_data` saw the producer publish this slot.
        let value = unsafe { ptr::read_volatile(self.slot(self.local_tail)) };
        self.local_tail += 1;
        self.header().tail.store(self.local_tail, Ordering::Release);
        value
    }

    /// Dequeue, stalling until the producer publishes a value.
    pub fn consume(&mut self) -> T {
        let mut stall = Stall::new();
        while !self.has_data() {
            stall.wait();
        }
        self.read()
    }

    /// As [`Queue::consume`], giving up when `abort` returns true.
    pub fn consume_with<F>(&mut self, mut abort: F) -> Result<T, QueueStop>
    where
        F: FnMut() -> bool,
    {
        let mut stall = Stall::new();
        while !self.has_data() {
            if abort() {
                return Err(QueueStop::Aborted);
            }
            stall.wait();
        }
        Ok(self.read())
    }

    pub fn try_consume(&mut self) -> Option<T> {
        if self.has_data() {
            Some(self.read())
        } else {
            None
        }
    }

    /// Consumer side: abandon everything published but unread.
    pub fn clear(&mut self) {
        self.cached_head = self.header().head.load(Ordering::Acquire);
        self.local_tail = self.cached_head;
        self.header().tail.store(self.local_tail, Ordering::Release);
    }

    /// Consumer side: stop accepting values. Pending and future values are dropped.
    pub fn close(&mut self) {
        self.header().closed.store(1, Ordering::Release);
        self.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    /// Return to the freshly created state. Both endpoints must be quiescent.
    pub fn reset(&mut self) {
        let header = self.header();
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.closed.store(0, Ordering::Release);
        self.local_head = 0;
        self.published_head = 0;
        self.cached_tail = 0;
        self.local_tail = 0;
        self.cached_head = 0;
    }
}
