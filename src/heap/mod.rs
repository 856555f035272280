// This module describes the runtime's heap window: one contiguous fixed-address reservation
// divided into arenas, one per (heap class, slot). A slot belongs to one allocating process:
// stage workers use their wid as slot, and the last slot is the parent's. Because every
// process reserves the same window at the same address, an address identifies its arena by
// arithmetic alone, in every process, with no shared state. Allocation inside an arena is a
// bump of a private cursor (mirror), and every other process that must see the allocation
// replays the allocator's broadcast records against its own mirror (batch). The heap class
// decides what the fault handler grants and what the end-of-iteration sweep propagates.

//! Heap classes, window layout and arena cursors.

pub mod batch;
pub mod mirror;

pub use batch::{AllocBatch, AllocOp, AllocRecord, RECORDS_PER_BATCH};
pub use mirror::{ArenaCursor, HeapMirror};

use std::fmt;

use crate::core::config::RuntimeConfig;
use crate::core::region::{Protection, PAGE_SIZE};

/// Allocation alignment inside every arena.
pub const ALLOC_ALIGN: usize = 16;

/// Heap family of an allocation.
///
/// `Versioned` is the per-worker duplicated heap; the rest are the global
/// separation classes picked by the compiler from the access pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HeapClass {
    Versioned = 0,
    ReadOnly = 1,
    NoReadBeforeWrite = 2,
    StagePrivate = 3,
    Unclassified = 4,
}

impl HeapClass {
    pub const COUNT: usize = 5;

    pub const ALL: [HeapClass; Self::COUNT] = [
        HeapClass::Versioned,
        HeapClass::ReadOnly,
        HeapClass::NoReadBeforeWrite,
        HeapClass::StagePrivate,
        HeapClass::Unclassified,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Protection the fault handler grants on first touch.
    pub fn protection(self) -> Protection {
        match self {
            HeapClass::ReadOnly => Protection::Read,
            _ => Protection::ReadWrite,
        }
    }

    /// Whether read-before-write bytes need an ordering check.
    pub fn checks_reads(self) -> bool {
        !matches!(self, HeapClass::NoReadBeforeWrite)
    }

    /// Whether touched pages travel to later stages and try-commit at all.
    pub fn propagates(self) -> bool {
        !matches!(self, HeapClass::StagePrivate | HeapClass::ReadOnly)
    }

    pub fn name(self) -> &'static str {
        match self {
            HeapClass::Versioned => "versioned",
            HeapClass::ReadOnly => "read-only",
            HeapClass::NoReadBeforeWrite => "no-read-before-write",
            HeapClass::StagePrivate => "stage-private",
            HeapClass::Unclassified => "unclassified",
        }
    }
}

/// One arena: a heap class and the slot of the process that allocates in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    pub class: HeapClass,
    pub slot: usize,
}

impl HeapId {
    pub const fn new(class: HeapClass, slot: usize) -> Self {
        Self { class, slot }
    }

    /// Wire form: class in the top byte, slot below.
    pub fn pack(self) -> u32 {
        ((self.class as u32) << 24) | (self.slot as u32 & 0x00ff_ffff)
    }

    pub fn unpack(raw: u32) -> Option<Self> {
        let class = HeapClass::from_index((raw >> 24) as usize)?;
        Some(Self::new(class, (raw & 0x00ff_ffff) as usize))
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class.name(), self.slot)
    }
}

/// Address arithmetic of the heap window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub base: usize,
    pub arena_size: usize,
    pub slots: usize,
}

impl HeapLayout {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            base: config.window_base,
            arena_size: config.arena_size,
            slots: config.heap_slots(),
        }
    }

    pub const fn len(&self) -> usize {
        HeapClass::COUNT * self.slots * self.arena_size
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn arena_count(&self) -> usize {
        HeapClass::COUNT * self.slots
    }

    /// Slot of the parent process.
    pub const fn main_slot(&self) -> usize {
        self.slots - 1
    }

    #[inline]
    pub const fn arena_index(&self, class: HeapClass, slot: usize) -> usize {
        class.index() * self.slots + slot
    }

    #[inline]
    pub const fn arena_begin(&self, class: HeapClass, slot: usize) -> usize {
        self.base + self.arena_index(class, slot) * self.arena_size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len()
    }

    /// The arena owning `addr`, if it falls in the window.
    pub fn locate(&self, addr: usize) -> Option<HeapId> {
        if !self.contains(addr) {
            return None;
        }
        let index = (addr - self.base) / self.arena_size;
        let class = HeapClass::from_index(index / self.slots)?;
        Some(HeapId::new(class, index % self.slots))
    }

    pub fn id_of_index(&self, index: usize) -> Option<HeapId> {
        let class = HeapClass::from_index(index / self.slots)?;
        Some(HeapId::new(class, index % self.slots))
    }
}

/// Memory outside the heap window that workers track in place, such as
/// globals and the stack frame around a loop. Page aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedRegion {
    pub begin: usize,
    pub end: usize,
    pub class: HeapClass,
}

impl TrackedRegion {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn overlaps(&self, begin: usize, end: usize) -> bool {
        begin < self.end && self.begin < end
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    pub fn pages(&self) -> impl Iterator<Item = usize> {
        (self.begin..self.end).step_by(PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> HeapLayout {
        HeapLayout {
            base: 0x2000_0000_0000,
            arena_size: 1 << 20,
            slots: 4,
        }
    }

    #[test]
    fn test_locate_inverts_arena_begin() {
        let l = layout();
        for class in HeapClass::ALL {
            for slot in 0..l.slots {
                let begin = l.arena_begin(class, slot);
                assert_eq!(l.locate(begin), Some(HeapId::new(class, slot)));
                assert_eq!(l.locate(begin + l.arena_size - 1), Some(HeapId::new(class, slot)));
            }
        }
        assert_eq!(l.locate(l.base + l.len()), None);
        assert_eq!(l.locate(l.base - 1), None);
    }

    #[test]
    fn test_heap_id_wire_form() {
        let id = HeapId::new(HeapClass::StagePrivate, 7);
        assert_eq!(HeapId::unpack(id.pack()), Some(id));
        assert_eq!(HeapId::unpack(0xff00_0000), None);
        assert_eq!(id.to_string(), "stage-private/7");
    }

    #[test]
    fn test_class_policy() {
        assert_eq!(HeapClass::ReadOnly.protection(), Protection::Read);
        assert_eq!(HeapClass::Versioned.protection(), Protection::ReadWrite);
        assert!(!HeapClass::NoReadBeforeWrite.checks_reads());
        assert!(HeapClass::Unclassified.checks_reads());
        assert!(!HeapClass::StagePrivate.propagates());
        assert!(HeapClass::Versioned.propagates());
    }

    #[test]
    fn test_tracked_region_pages() {
        let region = TrackedRegion {
            begin: 0x5000_0000,
            end: 0x5000_3000,
            class: HeapClass::Unclassified,
        };
        assert_eq!(region.pages().collect::<Vec<_>>(), vec![0x5000_0000, 0x5000_1000, 0x5000_2000]);
        assert!(region.contains(0x5000_2fff));
        assert!(!region.contains(0x5000_3000));
        assert!(region.overlaps(0x4fff_f000, 0x5000_1000));
        assert!(!region.overlaps(0x5000_3000, 0x5000_4000));
        assert_eq!(region.len(), 3 * PAGE_SIZE);
    }
}
