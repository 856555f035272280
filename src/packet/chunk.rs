//! Pooled page-sized packet chunks.
//!
//! Each producing process owns one [`ChunkPool`]: a fixed slab of chunks in
//! shared memory, addressed by index. A chunk's `sign` word holds one bit per
//! consumer that has yet to read it; the producer may refill a chunk only when
//! the word is zero, and each consumer clears its own bit once done.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::RuntimeResult;
use crate::core::region::{MappedRegion, PAGE_SIZE};

/// Index of a chunk inside its producer's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle(pub u32);

#[repr(C)]
pub struct PacketChunk {
    sign: AtomicU64,
    page: AtomicU64,
    data: [u8; PAGE_SIZE],
    shadow: [u8; PAGE_SIZE],
}

pub struct ChunkPool {
    region: MappedRegion,
    count: usize,
    cursor: usize,
}

impl ChunkPool {
    pub fn new(count: usize) -> RuntimeResult<Self> {
        let region = MappedRegion::shared(count * mem::size_of::<PacketChunk>())?;
        Ok(Self {
            region,
            count,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn raw(&self, handle: ChunkHandle) -> *mut PacketChunk {
        assert!((handle.0 as usize) < self.count, "chunk handle {} out of range", handle.0);
        // SAFETY: index checked against the slab size.
        unsafe { (self.region.as_ptr() as *mut PacketChunk).add(handle.0 as usize) }
    }

    fn chunk(&self, handle: ChunkHandle) -> &PacketChunk {
        // SAFETY: zeroed memory is a valid chunk; shared fields are atomics or
        // plain bytes guarded by the sign protocol.
        unsafe { &*self.raw(handle) }
    }

    /// No consumer still holds the chunk.
    pub fn is_available(&self, handle: ChunkHandle) -> bool {
        self.chunk(handle).sign.load(Ordering::Acquire) == 0
    }

    /// `get_available_packet_chunk`: the next chunk whose sign word is zero.
    pub fn acquire(&mut self) -> Option<ChunkHandle> {
        for step in 0..self.count {
            let index = (self.cursor + step) % self.count;
            let handle = ChunkHandle(index as u32);
            if self.is_available(handle) {
                self.cursor = (index + 1) % self.count;
                return Some(handle);
            }
        }
        None
    }

    /// Producer side: fill an acquired chunk.
    pub fn fill<F>(&mut self, handle: ChunkHandle, page: usize, fill: F)
    where
        F: FnOnce(&mut [u8; PAGE_SIZE], &mut [u8; PAGE_SIZE]),
    {
        debug_assert!(self.is_available(handle));
        let raw = self.raw(handle);
        // SAFETY: sign is zero, so no consumer reads the chunk; `&mut self` makes
        // this the only producer-side borrow.
        unsafe {
            (*raw).page.store(page as u64, Ordering::Relaxed);
            fill(&mut *ptr::addr_of_mut!((*raw).data), &mut *ptr::addr_of_mut!((*raw).shadow));
        }
    }

    /// Producer side: hand the chunk to the consumers in `consumers` (bit per node).
    pub fn publish(&self, handle: ChunkHandle, consumers: u64) {
        self.chunk(handle).sign.store(consumers, Ordering::Release);
    }

    /// Consumer side: the page address, data and shadow of a published chunk.
    pub fn read(&self, handle: ChunkHandle) -> (usize, &[u8; PAGE_SIZE], &[u8; PAGE_SIZE]) {
        let chunk = self.chunk(handle);
        (chunk.page.load(Ordering::Relaxed) as usize, &chunk.data, &chunk.shadow)
    }

    /// Consumer side: clear `node`'s bit.
    pub fn release(&self, handle: ChunkHandle, node: u32) {
        self.chunk(handle).sign.fetch_and(!(1u64 << node), Ordering::AcqRel);
    }

    /// Clear `node`'s bit on every chunk, for a consumer that went away.
    pub fn release_all(&self, node: u32) {
        for index in 0..self.count {
            self.release(ChunkHandle(index as u32), node);
        }
    }

    pub fn pending(&self, handle: ChunkHandle) -> u64 {
        self.chunk(handle).sign.load(Ordering::Acquire)
    }

    /// Mark every chunk free. No process may be using the pool.
    pub fn reset(&mut self) {
        for index in 0..self.count {
            self.chunk(ChunkHandle(index as u32)).sign.store(0, Ordering::Relaxed);
        }
        self.cursor = 0;
    }
}
