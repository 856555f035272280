//! Turning swept pages into packets and received packets back into memory.

use std::ptr;

use crate::core::region::PAGE_SIZE;
use crate::shadow::{bits, classify, Access};

use super::CheckKind;

/// Bytes per normal packet.
pub const RUN_MAX: usize = 8;

/// What the sweep found in one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    /// Bytes the validator must see.
    pub relevant: usize,
    /// Bytes later stages must apply.
    pub written: usize,
    pub read_checks: usize,
}

impl PageSummary {
    pub fn check(&self) -> CheckKind {
        CheckKind::from_flags(self.read_checks > 0, self.written > 0)
    }
}

/// Keep only the bits that matter for propagation. `out` gets one byte per
/// input byte: zero when irrelevant, the low shadow bits otherwise.
pub fn filter_page(shadow: &[u8], check_reads: bool, out: &mut [u8]) -> PageSummary {
    let mut summary = PageSummary::default();
    for (dst, &src) in out.iter_mut().zip(shadow) {
        *dst = match classify(src, check_reads) {
            Access::Ignore => 0,
            Access::ReadBeforeWrite => {
                summary.read_checks += 1;
                src & bits::BYTE_MASK
            }
            Access::Write => {
                summary.written += 1;
                if check_reads && src & bits::PREDICTED == 0 {
                    src & bits::BYTE_MASK
                } else {
                    src & bits::BYTE_MASK & !bits::READ_BEFORE_WRITE
                }
            }
        };
        if *dst != 0 {
            summary.relevant += 1;
        }
    }
    summary
}

/// Split a filtered page into runs of at most eight bytes. Each run starts and
/// ends on a relevant byte; irrelevant bytes inside a run carry zero shadow.
pub fn runs(filtered: &[u8]) -> impl Iterator<Item = (usize, usize)> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        while offset < filtered.len() && filtered[offset] == 0 {
            offset += 1;
        }
        if offset >= filtered.len() {
            return None;
        }
        let start = offset;
        let limit = (start + RUN_MAX).min(filtered.len());
        let mut end = start + 1;
        for i in start + 1..limit {
            if filtered[i] != 0 {
                end = i + 1;
            }
        }
        offset = limit;
        Some((start, end - start))
    })
}

/// Check kind of a run of filtered shadow bytes.
pub fn check_of(shadow: &[u8]) -> CheckKind {
    let read = shadow.iter().any(|&b| b & bits::READ_BEFORE_WRITE != 0);
    let write = shadow.iter().any(|&b| b & bits::WRITE != 0);
    CheckKind::from_flags(read, write)
}

/// Write the bytes of `data` whose shadow carries `WRITE` to `addr..`.
///
/// # Safety
///
/// `addr..addr + data.len()` must be writable memory of this process.
pub unsafe fn apply_writes(addr: usize, data: &[u8], shadow: &[u8]) {
    debug_assert!(data.len() <= PAGE_SIZE);
    let mut i = 0;
    while i < data.len() {
        if shadow[i] & bits::WRITE == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < data.len() && shadow[i] & bits::WRITE != 0 {
            i += 1;
        }
        // SAFETY: forwarded to the caller.
        unsafe {
            ptr::copy_nonoverlapping(data[start..i].as_ptr(), (addr + start) as *mut u8, i - start);
        }
    }
}
