//! Where committed state lands.

use hashbrown::HashMap;

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::heap::{AllocRecord, HeapMirror};
use crate::packet::encode::apply_writes;
use crate::shadow::bits;

/// Memory the commit process applies validated iterations to.
pub trait CommitTarget {
    /// Write the bytes of `data` whose shadow byte carries `WRITE` to `addr..`.
    fn store(&mut self, addr: usize, data: &[u8], shadow: &[u8]) -> RuntimeResult<()>;

    /// Replay an allocation event.
    fn apply_alloc(&mut self, record: &AllocRecord) -> RuntimeResult<()>;

    /// Little-endian value of `len` (at most eight) bytes at `addr`.
    fn load(&self, addr: usize, len: usize) -> u64;
}

/// The parent's own heap window.
pub struct ProcessMemory<'a> {
    mirror: &'a mut HeapMirror,
}

impl<'a> ProcessMemory<'a> {
    /// `mirror` must map its backing eagerly.
    pub fn new(mirror: &'a mut HeapMirror) -> Self {
        Self { mirror }
    }
}

impl CommitTarget for ProcessMemory<'_> {
    fn store(&mut self, addr: usize, data: &[u8], shadow: &[u8]) -> RuntimeResult<()> {
        if !self.mirror.is_backed(addr, data.len()) {
            return Err(RuntimeError::ForeignPointer { ptr: addr });
        }
        // SAFETY: the range lies in backing the eager mirror mapped read/write.
        unsafe { apply_writes(addr, data, shadow) };
        Ok(())
    }

    fn apply_alloc(&mut self, record: &AllocRecord) -> RuntimeResult<()> {
        self.mirror.apply(record)
    }

    fn load(&self, addr: usize, len: usize) -> u64 {
        let len = len.min(8);
        if !self.mirror.is_backed(addr, len) {
            return 0;
        }
        let mut buf = [0u8; 8];
        // SAFETY: backed and mapped read/write in the parent.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len) };
        u64::from_le_bytes(buf)
    }
}

/// Byte map standing in for process memory, for driving the protocol in-process.
#[derive(Debug, Default)]
pub struct SparseMemory {
    bytes: HashMap<usize, u8>,
    allocations: Vec<AllocRecord>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn byte(&self, addr: usize) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }

    pub fn set(&mut self, addr: usize, value: u64, len: usize) {
        for (i, b) in value.to_le_bytes()[..len].iter().enumerate() {
            self.bytes.insert(addr + i, *b);
        }
    }

    pub fn allocations(&self) -> &[AllocRecord] {
        &self.allocations
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl CommitTarget for SparseMemory {
    fn store(&mut self, addr: usize, data: &[u8], shadow: &[u8]) -> RuntimeResult<()> {
        for (i, (&value, &shadow)) in data.iter().zip(shadow).enumerate() {
            if shadow & bits::WRITE != 0 {
                self.bytes.insert(addr + i, value);
            }
        }
        Ok(())
    }

    fn apply_alloc(&mut self, record: &AllocRecord) -> RuntimeResult<()> {
        self.allocations.push(*record);
        Ok(())
    }

    fn load(&self, addr: usize, len: usize) -> u64 {
        let mut buf = [0u8; 8];
        for (i, b) in buf.iter_mut().enumerate().take(len.min(8)) {
            *b = self.byte(addr + i).unwrap_or(0);
        }
        u64::from_le_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::bits::*;

    #[test]
    fn test_sparse_memory_honours_shadow() {
        let mut memory = SparseMemory::new();
        memory.set(0x100, 0xffff_ffff, 4);
        memory
            .store(0x100, &[1, 2, 3, 4], &[WRITE, READ, WRITE | READ_BEFORE_WRITE, 0])
            .unwrap();
        assert_eq!(memory.load(0x100, 4), 0xff03_ff01);
        assert_eq!(memory.load(0x200, 8), 0);
    }
}
