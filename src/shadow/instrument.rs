//! Read/write instrumentation.
//!
//! Generated code brackets every access that might cross a stage boundary with
//! `ver_read*`/`ver_write*`. The updates work on eight shadow lanes at a time
//! with masks, so the hot path takes no per-byte branch.

use std::ptr;

use super::bits::{self, lanes};
use super::shadow_address;

/// Lane mask covering the low `len` bytes of a word.
#[inline]
const fn lane_mask(len: usize) -> u64 {
    if len >= 8 {
        u64::MAX
    } else {
        (1u64 << (len * 8)) - 1
    }
}

/// Shadow word after a read of the masked lanes.
///
/// Sets `READ` everywhere and `READ_BEFORE_WRITE` only on lanes not yet written.
#[inline]
pub const fn read_word(shadow: u64, mask: u64) -> u64 {
    let written = (shadow >> 1) & lanes(bits::READ_BEFORE_WRITE);
    let first_read = !written & lanes(bits::READ_BEFORE_WRITE);
    shadow | ((lanes(bits::READ) | first_read) & mask)
}

/// Shadow word after a write of the masked lanes. Clears `PREDICTED`.
#[inline]
pub const fn write_word(shadow: u64, mask: u64) -> u64 {
    (shadow | (lanes(bits::WRITE) & mask)) & !(lanes(bits::PREDICTED) & mask)
}

fn update(shadow: &mut [u8], op: fn(u64, u64) -> u64) {
    let mut chunks = shadow.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]));
        chunk.copy_from_slice(&op(word, u64::MAX).to_le_bytes());
    }

    let tail = chunks.into_remainder();
    if !tail.is_empty() {
        let mut buf = [0u8; 8];
        buf[..tail.len()].copy_from_slice(tail);
        let word = op(u64::from_le_bytes(buf), lane_mask(tail.len()));
        tail.copy_from_slice(&word.to_le_bytes()[..tail.len()]);
    }
}

/// Record a read over a slice of shadow bytes.
pub fn mark_read(shadow: &mut [u8]) {
    update(shadow, read_word);
}

/// Record a write over a slice of shadow bytes.
pub fn mark_write(shadow: &mut [u8]) {
    update(shadow, write_word);
}

/// Record a read of `len` bytes at heap address `addr`.
///
/// # Safety
///
/// `addr..addr + len` must lie inside the heap window of a worker process with
/// the fault handler installed (shadow pages are mapped on demand).
#[inline]
pub unsafe fn ver_read(addr: usize, len: usize) {
    // SAFETY: forwarded to the caller.
    let shadow = unsafe { std::slice::from_raw_parts_mut(shadow_address(addr) as *mut u8, len) };
    mark_read(shadow);
}

/// Record a write of `len` bytes at heap address `addr`.
///
/// # Safety
///
/// As for [`ver_read`].
#[inline]
pub unsafe fn ver_write(addr: usize, len: usize) {
    // SAFETY: forwarded to the caller.
    let shadow = unsafe { std::slice::from_raw_parts_mut(shadow_address(addr) as *mut u8, len) };
    mark_write(shadow);
}

macro_rules! sized_access {
    ($($read:ident, $write:ident, $len:literal;)*) => {$(
        #[doc = concat!("`ver_read` of ", stringify!($len), " bytes.")]
        ///
        /// # Safety
        ///
        /// As for [`ver_read`].
        #[inline]
        pub unsafe fn $read(addr: usize) {
            // SAFETY: forwarded to the caller.
            unsafe { ver_read(addr, $len) }
        }

        #[doc = concat!("`ver_write` of ", stringify!($len), " bytes.")]
        ///
        /// # Safety
        ///
        /// As for [`ver_read`].
        #[inline]
        pub unsafe fn $write(addr: usize) {
            // SAFETY: forwarded to the caller.
            unsafe { ver_write(addr, $len) }
        }
    )*};
}

sized_access! {
    ver_read1, ver_write1, 1;
    ver_read2, ver_write2, 2;
    ver_read4, ver_write4, 4;
    ver_read8, ver_write8, 8;
}

/// Instrumented `memmove`: reads `src`, copies, writes `dst`.
///
/// # Safety
///
/// Both ranges must be valid heap window memory as for [`ver_read`].
pub unsafe fn ver_memmove(dst: usize, src: usize, len: usize) {
    // SAFETY: forwarded to the caller.
    unsafe {
        ver_read(src, len);
        ptr::copy(src as *const u8, dst as *mut u8, len);
        ver_write(dst, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::bits::*;

    #[test]
    fn test_read_then_write() {
        let mut shadow = [0u8; 3];
        mark_read(&mut shadow);
        assert!(shadow.iter().all(|&s| s == READ | READ_BEFORE_WRITE));
        mark_write(&mut shadow);
        assert!(shadow.iter().all(|&s| s == READ | READ_BEFORE_WRITE | WRITE));
    }

    #[test]
    fn test_write_then_read_is_not_read_before_write() {
        let mut shadow = [0u8; 8];
        mark_write(&mut shadow[2..6]);
        mark_read(&mut shadow);
        assert_eq!(shadow[0], READ | READ_BEFORE_WRITE);
        assert_eq!(shadow[1], READ | READ_BEFORE_WRITE);
        for s in &shadow[2..6] {
            assert_eq!(*s, WRITE | READ);
        }
        assert_eq!(shadow[6], READ | READ_BEFORE_WRITE);
    }

    #[test]
    fn test_masks_leave_neighbours_alone() {
        let mut shadow = [0u8; 16];
        shadow[0] = TOUCHED;
        mark_write(&mut shadow[0..1]);
        assert_eq!(shadow[0], TOUCHED | WRITE);
        assert!(shadow[1..].iter().all(|&s| s == 0));

        mark_read(&mut shadow[9..12]);
        assert_eq!(&shadow[8..13], &[0, READ | READ_BEFORE_WRITE, READ | READ_BEFORE_WRITE, READ | READ_BEFORE_WRITE, 0]);
    }

    #[test]
    fn test_write_clears_prediction() {
        let mut shadow = [PREDICTED; 4];
        mark_read(&mut shadow[..2]);
        mark_write(&mut shadow[1..]);
        assert_eq!(shadow[0], PREDICTED | READ | READ_BEFORE_WRITE);
        assert_eq!(shadow[1], READ | READ_BEFORE_WRITE | WRITE);
        assert_eq!(shadow[3], WRITE);
    }

    #[test]
    fn test_word_ops_match_bytewise_definition() {
        for byte in 0u8..=255 {
            let word = lanes(byte);
            let read = read_word(word, u64::MAX).to_le_bytes()[0];
            let mut expected = byte | READ;
            if byte & WRITE == 0 {
                expected |= READ_BEFORE_WRITE;
            }
            assert_eq!(read, expected, "read of {byte:#x}");

            let write = write_word(word, u64::MAX).to_le_bytes()[0];
            assert_eq!(write, (byte | WRITE) & !PREDICTED, "write of {byte:#x}");
        }
    }
}
