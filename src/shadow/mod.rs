// This module owns the per-byte access metadata ("shadow") of every tracked heap byte. Each
// real byte in the heap window has exactly one shadow byte, located by a pure XOR transform of
// its address, so the mapping is the same for all heap classes and is its own inverse. Shadow
// bytes record whether the byte was read, written, read before being written this iteration,
// or carries a predicted value; the first shadow byte of each page additionally carries the
// TOUCHED flag the fault handler sets. Submodules hold the instrumentation entry points used by
// generated code (instrument), the zero/non-zero page scanners used by the end-of-iteration
// sweep (scan), and the page-fault machinery that discovers first-touch pages (protect).

//! Shadow memory: address transform, bit layout, instrumentation, scanning, protection.

pub mod instrument;
pub mod protect;
pub mod scan;

pub use instrument::{ver_memmove, ver_read, ver_write};
pub use protect::{FaultTable, Region};
pub use scan::{default_scanner, PageScanner, ScalarScanner};

use crate::core::region::{page_of, PAGE_SIZE};

/// The address bit that separates real memory from its shadow.
pub const SHADOW_BIT: usize = 1 << 44;

/// Shadow byte bit layout.
pub mod bits {
    /// Read happened before any write this iteration.
    pub const READ_BEFORE_WRITE: u8 = 0x01;
    /// Written this iteration.
    pub const WRITE: u8 = 0x02;
    /// Read this iteration.
    pub const READ: u8 = 0x04;
    /// Holds a predicted value; reads are exempt from ordering checks.
    pub const PREDICTED: u8 = 0x08;
    /// Low four bits carry meaning for the byte itself.
    pub const BYTE_MASK: u8 = 0x0f;
    /// Set on the first shadow byte of a page once the page faulted this iteration.
    pub const TOUCHED: u8 = 0x80;

    /// Broadcast a shadow byte into all eight lanes of a word.
    pub const fn lanes(byte: u8) -> u64 {
        (byte as u64) * 0x0101_0101_0101_0101
    }
}

/// Shadow address of a real heap address.
#[inline]
pub const fn shadow_address(addr: usize) -> usize {
    addr ^ SHADOW_BIT
}

/// Real address of a shadow address. Inverse of [`shadow_address`].
#[inline]
pub const fn real_address(shadow: usize) -> usize {
    shadow ^ SHADOW_BIT
}

/// The shadow bytes of one whole page.
///
/// # Safety
///
/// `page` must be a page of the heap window whose shadow page is mapped read/write
/// in this process and not otherwise borrowed.
pub unsafe fn shadow_page_mut<'a>(page: usize) -> &'a mut [u8] {
    debug_assert_eq!(page, page_of(page));
    // SAFETY: forwarded to the caller.
    unsafe { std::slice::from_raw_parts_mut(shadow_address(page) as *mut u8, PAGE_SIZE) }
}

/// Each byte's relevance once the end-of-iteration sweep looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Nothing to propagate.
    Ignore,
    /// Read before written: the validator must check ordering.
    ReadBeforeWrite,
    /// Written: the value must propagate (and may also need a read check).
    Write,
}

/// Classify one shadow byte for propagation.
#[inline]
pub fn classify(shadow: u8, check_reads: bool) -> Access {
    if shadow & bits::WRITE != 0 {
        Access::Write
    } else if check_reads
        && shadow & bits::READ_BEFORE_WRITE != 0
        && shadow & bits::PREDICTED == 0
    {
        Access::ReadBeforeWrite
    } else {
        Access::Ignore
    }
}
