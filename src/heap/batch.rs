//! Allocation broadcast records.
//!
//! A worker does not announce each allocation on its own: records accumulate in
//! an [`AllocBatch`] and travel a page at a time inside a packet chunk.

use crate::core::region::PAGE_SIZE;

use super::HeapId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AllocOp {
    Alloc = 0,
    Free = 1,
}

/// One announced allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AllocRecord {
    pub ptr: u64,
    pub size: u64,
    pub heap: u32,
    pub op: u32,
}

/// Encoded size of one record.
pub const RECORD_BYTES: usize = 24;

/// Records that fit in one page.
pub const RECORDS_PER_BATCH: usize = PAGE_SIZE / RECORD_BYTES;

impl AllocRecord {
    pub fn alloc(heap: HeapId, ptr: usize, size: usize) -> Self {
        Self {
            ptr: ptr as u64,
            size: size as u64,
            heap: heap.pack(),
            op: AllocOp::Alloc as u32,
        }
    }

    pub fn free(heap: HeapId, ptr: usize) -> Self {
        Self {
            ptr: ptr as u64,
            size: 0,
            heap: heap.pack(),
            op: AllocOp::Free as u32,
        }
    }

    pub fn op(&self) -> Option<AllocOp> {
        match self.op {
            0 => Some(AllocOp::Alloc),
            1 => Some(AllocOp::Free),
            _ => None,
        }
    }

    pub fn heap_id(&self) -> Option<HeapId> {
        HeapId::unpack(self.heap)
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.ptr.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..20].copy_from_slice(&self.heap.to_le_bytes());
        out[20..24].copy_from_slice(&self.op.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf[..range.len()].copy_from_slice(&bytes[range]);
            u64::from_le_bytes(buf)
        };
        Self {
            ptr: word(0..8),
            size: word(8..16),
            heap: word(16..20) as u32,
            op: word(20..24) as u32,
        }
    }
}

/// Buffer of records awaiting broadcast.
#[derive(Debug, Default)]
pub struct AllocBatch {
    records: Vec<AllocRecord>,
}

impl AllocBatch {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(RECORDS_PER_BATCH),
        }
    }

    /// Append a record. Returns true once the batch is full and must be sent.
    pub fn push(&mut self, record: AllocRecord) -> bool {
        self.records.push(record);
        self.records.len() >= RECORDS_PER_BATCH
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encode into a page buffer and empty the batch. Returns the record count.
    pub fn drain_into(&mut self, page: &mut [u8]) -> usize {
        let count = self.records.len();
        for (record, out) in self.records.drain(..).zip(page.chunks_exact_mut(RECORD_BYTES)) {
            record.encode(out);
        }
        count
    }
}

/// Decode `count` records from a page buffer.
pub fn decode_records(page: &[u8], count: usize) -> impl Iterator<Item = AllocRecord> + '_ {
    page.chunks_exact(RECORD_BYTES)
        .take(count.min(RECORDS_PER_BATCH))
        .map(AllocRecord::decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapClass;

    #[test]
    fn test_batch_fills_at_a_page() {
        assert_eq!(RECORDS_PER_BATCH, 170);
        assert_eq!(std::mem::size_of::<AllocRecord>(), RECORD_BYTES);

        let heap = HeapId::new(HeapClass::Versioned, 1);
        let mut batch = AllocBatch::new();
        for i in 0..RECORDS_PER_BATCH - 1 {
            assert!(!batch.push(AllocRecord::alloc(heap, 0x1000 + i * 16, 16)));
        }
        assert!(batch.push(AllocRecord::free(heap, 0x1000)));

        let mut page = vec![0u8; PAGE_SIZE];
        let count = batch.drain_into(&mut page);
        assert_eq!(count, RECORDS_PER_BATCH);
        assert!(batch.is_empty());

        let records: Vec<_> = decode_records(&page, count).collect();
        assert_eq!(records[3], AllocRecord::alloc(heap, 0x1030, 16));
        assert_eq!(records[count - 1].op(), Some(AllocOp::Free));
        assert_eq!(records[0].heap_id(), Some(heap));
    }
}
