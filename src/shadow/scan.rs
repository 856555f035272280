//! Zero / non-zero page scanning.
//!
//! The end-of-iteration sweep asks two questions of every touched shadow page:
//! is anything set at all, and how many bytes are. [`ScalarScanner`] is the
//! reference; [`Sse2Scanner`] answers the same questions sixteen bytes at a time.

/// Page scanning strategy.
pub trait PageScanner: Sync {
    /// True if every byte is zero.
    fn is_zero(&self, bytes: &[u8]) -> bool;

    /// Number of bytes with any bit of `mask` set.
    fn count_matching(&self, bytes: &[u8], mask: u8) -> usize;
}

/// Byte-at-a-time reference implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarScanner;

impl PageScanner for ScalarScanner {
    fn is_zero(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| b == 0)
    }

    fn count_matching(&self, bytes: &[u8], mask: u8) -> usize {
        bytes.iter().filter(|&&b| b & mask != 0).count()
    }
}

/// SSE2 implementation, x86_64 only.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sse2Scanner;

#[cfg(target_arch = "x86_64")]
impl PageScanner for Sse2Scanner {
    fn is_zero(&self, bytes: &[u8]) -> bool {
        use std::arch::x86_64::*;

        let mut chunks = bytes.chunks_exact(16);
        // SAFETY: SSE2 is part of the x86_64 baseline; loads are unaligned.
        let acc = unsafe {
            let mut acc = _mm_setzero_si128();
            for chunk in &mut chunks {
                let v = _mm_loadu_si128(chunk.as_ptr() as *const __m128i);
                acc = _mm_or_si128(acc, v);
            }
            _mm_movemask_epi8(_mm_cmpeq_epi8(acc, _mm_setzero_si128()))
        };
        acc == 0xffff && chunks.remainder().iter().all(|&b| b == 0)
    }

    fn count_matching(&self, bytes: &[u8], mask: u8) -> usize {
        use std::arch::x86_64::*;

        let mut chunks = bytes.chunks_exact(16);
        let mut count = 0usize;
        // SAFETY: as above.
        unsafe {
            let m = _mm_set1_epi8(mask as i8);
            let zero = _mm_setzero_si128();
            for chunk in &mut chunks {
                let v = _mm_loadu_si128(chunk.as_ptr() as *const __m128i);
                let hits = _mm_cmpeq_epi8(_mm_and_si128(v, m), zero);
                count += 16 - (_mm_movemask_epi8(hits) as u32).count_ones() as usize;
            }
        }
        count + ScalarScanner.count_matching(chunks.remainder(), mask)
    }
}

/// The fastest scanner available on this target.
pub fn default_scanner() -> &'static dyn PageScanner {
    #[cfg(target_arch = "x86_64")]
    {
        &Sse2Scanner
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        &ScalarScanner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region::PAGE_SIZE;

    fn pages() -> Vec<Vec<u8>> {
        let mut pages = vec![vec![0u8; PAGE_SIZE]];
        let mut sparse = vec![0u8; PAGE_SIZE];
        sparse[PAGE_SIZE - 1] = 0x02;
        pages.push(sparse);
        let mut first = vec![0u8; PAGE_SIZE];
        first[0] = 0x80;
        pages.push(first);
        pages.push((0..PAGE_SIZE).map(|i| (i * 7 % 11) as u8).collect());
        pages.push(vec![0x0f; 37]);
        pages
    }

    #[test]
    fn test_scalar_reference() {
        let page = &pages()[3];
        let expected = page.iter().filter(|&&b| b & 0x02 != 0).count();
        assert_eq!(ScalarScanner.count_matching(page, 0x02), expected);
        assert!(ScalarScanner.is_zero(&pages()[0]));
        assert!(!ScalarScanner.is_zero(&pages()[1]));
    }

    #[test]
    fn test_default_scanner_agrees_with_scalar() {
        let fast = default_scanner();
        for page in pages() {
            assert_eq!(fast.is_zero(&page), ScalarScanner.is_zero(&page));
            for mask in [0x01, 0x02, 0x03, 0x80, 0xff] {
                assert_eq!(
                    fast.count_matching(&page, mask),
                    ScalarScanner.count_matching(&page, mask)
                );
            }
        }
    }
}
