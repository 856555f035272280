// This module defines the envelopes that travel over the transport queues. Every packet has
// the same fixed-size repr(C) layout so it can be bit-copied through shared memory: an
// address, up to eight value bytes, a meta word, the iteration it belongs to, a size, an
// auxiliary word and its kind. For data packets the meta word carries the shadow bytes that
// belong to the value bytes, so value and validity always travel together. A super packet
// instead names a packet chunk (chunk), one full page of data plus its shadow drawn from the
// producer's pool. Helpers for turning a swept page into packets and writing received bytes
// back into memory sit in encode.

//! Packets, packet chunks and page encoding.

pub mod chunk;
pub mod encode;

pub use chunk::{ChunkHandle, ChunkPool, PacketChunk};

use crate::heap::AllocRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Up to eight bytes of value and shadow.
    Data = 0,
    /// A whole page in a chunk; `aux` is the chunk handle.
    Super = 1,
    /// Begin of iteration.
    Boi = 2,
    /// End of iteration; `aux` is the stage.
    Eoi = 3,
    /// End of worker; `aux` is the loop exit code.
    Eow = 4,
    /// Misspeculation; `aux` is the wid that gave up.
    Misspec = 5,
    Alloc = 6,
    Free = 7,
    /// Allocation records in a chunk; `aux` is the handle, `size` the count.
    AllocBatch = 8,
    /// An established predictor; see [`crate::predict::Prediction`].
    Predict = 9,
}

impl PacketKind {
    /// Terminal markers end a producer's stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, PacketKind::Eow | PacketKind::Misspec)
    }
}

/// What a data packet asks the validator to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CheckKind {
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl CheckKind {
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => CheckKind::None,
            (true, false) => CheckKind::Read,
            (false, true) => CheckKind::Write,
            (true, true) => CheckKind::ReadWrite,
        }
    }

    pub fn has_write(self) -> bool {
        matches!(self, CheckKind::Write | CheckKind::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Packet {
    pub ptr: u64,
    pub value: u64,
    pub meta: u64,
    pub iteration: u64,
    pub size: u32,
    pub aux: u32,
    pub kind: PacketKind,
    pub check: CheckKind,
}

impl Packet {
    pub const fn event(kind: PacketKind, iteration: u64, ptr: u64, size: u32, value: u64) -> Self {
        Self {
            ptr,
            value,
            meta: 0,
            iteration,
            size,
            aux: 0,
            kind,
            check: CheckKind::None,
        }
    }

    pub fn data(iteration: u64, addr: usize, value: &[u8], shadow: &[u8], check: CheckKind) -> Self {
        debug_assert!(value.len() <= 8 && value.len() == shadow.len());
        Self {
            ptr: addr as u64,
            value: pack_bytes(value),
            meta: pack_bytes(shadow),
            iteration,
            size: value.len() as u32,
            aux: 0,
            kind: PacketKind::Data,
            check,
        }
    }

    pub fn super_page(iteration: u64, page: usize, chunk: ChunkHandle, check: CheckKind) -> Self {
        Self {
            aux: chunk.0,
            check,
            ..Self::event(PacketKind::Super, iteration, page as u64, crate::core::region::PAGE_SIZE as u32, 0)
        }
    }

    pub fn boi(iteration: u64) -> Self {
        Self::event(PacketKind::Boi, iteration, 0, 0, 0)
    }

    pub fn eoi(iteration: u64, stage: usize) -> Self {
        Self {
            aux: stage as u32,
            ..Self::event(PacketKind::Eoi, iteration, 0, 0, 0)
        }
    }

    pub fn eow(iteration: u64, exit_code: u32) -> Self {
        Self {
            aux: exit_code,
            ..Self::event(PacketKind::Eow, iteration, 0, 0, 0)
        }
    }

    pub fn misspec(iteration: u64, wid: u32) -> Self {
        Self {
            aux: wid,
            ..Self::event(PacketKind::Misspec, iteration, 0, 0, 0)
        }
    }

    pub fn alloc_batch(iteration: u64, chunk: ChunkHandle, count: usize) -> Self {
        Self {
            aux: chunk.0,
            ..Self::event(PacketKind::AllocBatch, iteration, 0, count as u32, 0)
        }
    }

    /// A single allocation event (try-commit to commit, commit to workers).
    pub fn alloc_event(iteration: u64, record: &AllocRecord) -> Self {
        let kind = if record.op == crate::heap::AllocOp::Free as u32 {
            PacketKind::Free
        } else {
            PacketKind::Alloc
        };
        Self {
            aux: record.heap,
            ..Self::event(kind, iteration, record.ptr, 0, record.size)
        }
    }

    /// Inverse of [`Packet::alloc_event`].
    pub fn alloc_record(&self) -> AllocRecord {
        let op = match self.kind {
            PacketKind::Free => crate::heap::AllocOp::Free,
            _ => crate::heap::AllocOp::Alloc,
        };
        AllocRecord {
            ptr: self.ptr,
            size: self.value,
            heap: self.aux,
            op: op as u32,
        }
    }

    pub fn chunk(&self) -> ChunkHandle {
        ChunkHandle(self.aux)
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn value_bytes(&self) -> [u8; 8] {
        self.value.to_le_bytes()
    }

    pub fn shadow_bytes(&self) -> [u8; 8] {
        self.meta.to_le_bytes()
    }
}

fn pack_bytes(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapClass, HeapId};

    #[test]
    fn test_packet_is_compact() {
        assert_eq!(std::mem::size_of::<Packet>(), 48);
    }

    #[test]
    fn test_data_packet_pairs_value_and_shadow() {
        let p = Packet::data(3, 0x1000, &[1, 2, 3], &[2, 2, 6], CheckKind::Write);
        assert_eq!(p.len(), 3);
        assert_eq!(&p.value_bytes()[..3], &[1, 2, 3]);
        assert_eq!(&p.shadow_bytes()[..4], &[2, 2, 6, 0]);
        assert_eq!(p.iteration, 3);
    }

    #[test]
    fn test_alloc_events_carry_records() {
        let heap = HeapId::new(HeapClass::Unclassified, 2);
        let record = AllocRecord::alloc(heap, 0x2000, 48);
        let p = Packet::alloc_event(1, &record);
        assert_eq!(p.kind, PacketKind::Alloc);
        assert_eq!(p.alloc_record(), record);

        let free = AllocRecord::free(heap, 0x2000);
        assert_eq!(Packet::alloc_event(1, &free).alloc_record(), free);
        assert!(Packet::eow(0, 1).kind.is_terminal());
        assert!(!Packet::eoi(0, 1).kind.is_terminal());
    }
}
