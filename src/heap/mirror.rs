//! Per-process arena cursors.
//!
//! Every process keeps its own [`HeapMirror`]: the cursors of the arenas it
//! allocates in, plus a replayed view of everybody else's. Replaying the same
//! broadcast sequence always yields the same cursors, which is what lets each
//! process extend its view of another worker's heap without shared state.

use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::region::{protect, Protection};

use super::{AllocOp, AllocRecord, HeapId, HeapLayout, TrackedRegion, ALLOC_ALIGN};

/// Bump cursor of one arena.
///
/// `next` is the allocation cursor, `nextchunk` marks how far backing has been
/// registered: `begin <= next <= nextchunk <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaCursor {
    pub begin: usize,
    pub end: usize,
    pub next: usize,
    pub nextchunk: usize,
}

impl ArenaCursor {
    pub fn used(&self) -> usize {
        self.next - self.begin
    }

    pub fn remaining(&self) -> usize {
        self.end - self.next
    }
}

pub struct HeapMirror {
    layout: HeapLayout,
    chunk_size: usize,
    cursors: Vec<ArenaCursor>,
    /// `nextchunk` of every arena, published for the fault handler.
    extents: Box<[AtomicUsize]>,
    /// Map backing read/write as it is registered (parent only).
    eager: bool,
    frees: usize,
    /// Requested size of every live allocation seen by this mirror.
    sizes: HashMap<usize, usize>,
    /// Memory outside the window tracked in place.
    regions: Vec<TrackedRegion>,
}

impl HeapMirror {
    pub fn new(layout: HeapLayout, chunk_size: usize, eager: bool) -> Self {
        let cursors: Vec<ArenaCursor> = (0..layout.arena_count())
            .map(|index| {
                let begin = layout.base + index * layout.arena_size;
                ArenaCursor {
                    begin,
                    end: begin + layout.arena_size,
                    next: begin,
                    nextchunk: begin,
                }
            })
            .collect();
        let extents = cursors.iter().map(|c| AtomicUsize::new(c.nextchunk)).collect();
        Self {
            layout,
            chunk_size,
            cursors,
            extents,
            eager,
            frees: 0,
            sizes: HashMap::new(),
            regions: Vec::new(),
        }
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn cursor(&self, id: HeapId) -> &ArenaCursor {
        &self.cursors[self.layout.arena_index(id.class, id.slot)]
    }

    pub fn cursors(&self) -> &[ArenaCursor] {
        &self.cursors
    }

    /// Registered extents for [`crate::shadow::FaultTable::new`].
    pub fn extents(&self) -> &[AtomicUsize] {
        &self.extents
    }

    pub fn regions(&self) -> &[TrackedRegion] {
        &self.regions
    }

    /// The tracked region holding `addr`, if any.
    pub fn tracked(&self, addr: usize) -> Option<&TrackedRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Add a region outside the window. Callers map its shadow first and keep
    /// regions disjoint.
    pub fn track(&mut self, region: TrackedRegion) {
        log::debug!(
            "tracking {} memory {:#x}..{:#x}",
            region.class.name(),
            region.begin,
            region.end
        );
        self.regions.push(region);
    }

    pub fn set_eager(&mut self, eager: bool) {
        self.eager = eager;
    }

    pub fn free_count(&self) -> usize {
        self.frees
    }

    /// Bump-allocate `size` bytes in arena `id`. 16-byte aligned; never reuses memory.
    pub fn alloc(&mut self, id: HeapId, size: usize) -> RuntimeResult<usize> {
        if id.slot >= self.layout.slots {
            return Err(RuntimeError::InvalidConfig {
                reason: format!("heap slot {} out of range", id.slot),
            });
        }
        let index = self.layout.arena_index(id.class, id.slot);
        let cursor = self.cursors[index];
        let ptr = cursor.next;
        let end = round_size(size)
            .filter(|&rounded| rounded <= cursor.remaining())
            .and_then(|rounded| ptr.checked_add(rounded))
            .ok_or_else(|| RuntimeError::ArenaExhausted {
                heap: id.to_string(),
                requested: size,
                remaining: cursor.remaining(),
            })?;
        self.extend_to(index, end)?;
        self.sizes.insert(ptr, size);
        Ok(ptr)
    }

    /// Replay a broadcast record (`update_ver_malloc`).
    ///
    /// Cursors only move forward, so a record seen twice is harmless.
    pub fn apply(&mut self, record: &AllocRecord) -> RuntimeResult<()> {
        let ptr = record.ptr as usize;
        let id = self
            .layout
            .locate(ptr)
            .ok_or(RuntimeError::ForeignPointer { ptr })?;
        if record.heap_id() != Some(id) {
            return Err(RuntimeError::ForeignPointer { ptr });
        }
        match record.op() {
            Some(AllocOp::Alloc) => {
                let index = self.layout.arena_index(id.class, id.slot);
                let arena_end = self.cursors[index].end;
                let size = usize::try_from(record.size).unwrap_or(usize::MAX);
                let end = round_size(size)
                    .and_then(|rounded| ptr.checked_add(rounded))
                    .filter(|&end| end <= arena_end)
                    .ok_or_else(|| RuntimeError::ArenaExhausted {
                        heap: id.to_string(),
                        requested: size,
                        remaining: arena_end.saturating_sub(ptr),
                    })?;
                self.extend_to(index, end)?;
                self.sizes.insert(ptr, size);
                Ok(())
            }
            Some(AllocOp::Free) => {
                if self.sizes.remove(&ptr).is_some() {
                    self.frees += 1;
                }
                Ok(())
            }
            None => Err(RuntimeError::ForeignPointer { ptr }),
        }
    }

    /// Check `ptr` belongs to a registered part of some arena.
    pub fn free(&mut self, ptr: usize) -> RuntimeResult<HeapId> {
        let id = self.owner_of(ptr)?;
        self.sizes.remove(&ptr);
        self.frees += 1;
        Ok(id)
    }

    /// Requested size of the live allocation at `ptr`.
    pub fn size_of(&self, ptr: usize) -> Option<usize> {
        self.sizes.get(&ptr).copied()
    }

    pub fn owner_of(&self, ptr: usize) -> RuntimeResult<HeapId> {
        let id = self
            .layout
            .locate(ptr)
            .ok_or(RuntimeError::ForeignPointer { ptr })?;
        if ptr >= self.cursor(id).next {
            return Err(RuntimeError::ForeignPointer { ptr });
        }
        Ok(id)
    }

    /// `addr..addr + len` lies in the registered backing of a single arena,
    /// or inside one tracked region.
    pub fn is_backed(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        match self.layout.locate(addr) {
            Some(id) => end <= self.cursor(id).nextchunk,
            None => self.tracked(addr).is_some_and(|r| end <= r.end),
        }
    }

    fn extend_to(&mut self, index: usize, next: usize) -> RuntimeResult<()> {
        let cursor = &mut self.cursors[index];
        if next <= cursor.next {
            return Ok(());
        }
        cursor.next = next;

        let mut grown = cursor.nextchunk;
        while grown < cursor.next {
            grown = (grown + self.chunk_size).min(cursor.end);
        }
        if grown > cursor.nextchunk {
            if self.eager {
                protect(cursor.nextchunk, grown - cursor.nextchunk, Protection::ReadWrite)?;
            }
            log::trace!(
                "arena {} backing {:#x}..{:#x}",
                index,
                cursor.nextchunk,
                grown
            );
            cursor.nextchunk = grown;
            self.extents[index].store(grown, Ordering::Release);
        }
        Ok(())
    }
}

/// `size` rounded up to [`ALLOC_ALIGN`], `None` if that overflows.
fn round_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(ALLOC_ALIGN)
}
