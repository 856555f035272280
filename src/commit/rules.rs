//! The per-byte ordering rule.
//!
//! A validated write by stage `s` leaves the token `s + 1` on the byte. A later
//! access by stage `s'` is legal only if the stored token is below
//! `reference_token(s')`: `s' + 1` for a parallel stage, `s' + 2` for a
//! sequential one. Read-before-write bytes are additionally illegal when the
//! byte was written earlier in the same iteration, because writes reach later
//! stages one iteration late.

use crate::pipeline::StageKind;

/// Token a stage must strictly dominate.
#[inline]
pub fn reference_token(stage: usize, kind: StageKind) -> u8 {
    let bump = match kind {
        StageKind::Sequential => 1,
        StageKind::Parallel => 0,
    };
    (stage + 1 + bump) as u8
}

/// Token left behind by a validated write of `stage`.
#[inline]
pub fn written_token(stage: usize) -> u8 {
    (stage + 1) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The stored token is at or above the stage's reference.
    Ordering { token: u8, reference: u8 },
    /// Read a byte some stage validated earlier in this iteration.
    SameIteration,
}

/// Check a write of `stage` over a byte holding `token`.
#[inline]
pub fn check_write(token: u8, stage: usize, kind: StageKind) -> Result<(), Violation> {
    let reference = reference_token(stage, kind);
    if token >= reference {
        return Err(Violation::Ordering { token, reference });
    }
    Ok(())
}

/// Check a read-before-write of `stage`; `fresh` says the byte was validated
/// as written earlier in the current iteration.
#[inline]
pub fn check_read(token: u8, fresh: bool, stage: usize, kind: StageKind) -> Result<(), Violation> {
    check_write(token, stage, kind)?;
    if fresh {
        return Err(Violation::SameIteration);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageKind::*;

    /// Whether stage `reader` of a pipeline is guaranteed to observe a write
    /// made by stage `writer`, `distance` iterations earlier.
    ///
    /// Writes forward from earlier to later stages at the next iteration
    /// boundary; a sequential stage also sees its own earlier iterations.
    /// Replicas of a parallel stage never see each other's memory.
    fn visible(kinds: &[StageKind], writer: usize, reader: usize, distance: u64) -> bool {
        if distance == 0 {
            return false;
        }
        writer < reader || (writer == reader && kinds[reader] == Sequential)
    }

    fn pipelines(max_len: usize) -> Vec<Vec<StageKind>> {
        let mut out = Vec::new();
        for len in 1..=max_len {
            for mask in 0..(1u32 << (len - 1)) {
                let mut kinds = vec![Sequential];
                for bit in 0..len - 1 {
                    kinds.push(if mask & (1 << bit) != 0 { Parallel } else { Sequential });
                }
                out.push(kinds);
            }
        }
        out
    }

    #[test]
    fn test_rule_matches_visibility_for_every_interleaving() {
        // Every pipeline shape up to five stages with sequential and parallel
        // stages interleaved in all orders, every writer/reader pair, with the
        // write in the same or an earlier iteration.
        for kinds in pipelines(5) {
            for writer in 0..kinds.len() {
                for reader in 0..kinds.len() {
                    for distance in 0..=2u64 {
                        let token = written_token(writer);
                        let fresh = distance == 0;
                        let legal = check_read(token, fresh, reader, kinds[reader]).is_ok();
                        assert_eq!(
                            legal,
                            visible(&kinds, writer, reader, distance),
                            "{kinds:?}: stage {writer} write, stage {reader} read, distance {distance}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_tokens_never_decrease_on_accepted_writes() {
        for kinds in pipelines(5) {
            // every sequence of three writers, applied in order
            let n = kinds.len();
            for a in 0..n {
                for b in 0..n {
                    for c in 0..n {
                        let mut token = 0u8;
                        for stage in [a, b, c] {
                            if check_write(token, stage, kinds[stage]).is_ok() {
                                let next = written_token(stage);
                                assert!(next >= token, "{kinds:?}: {token} -> {next}");
                                token = next;
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_untouched_bytes_are_always_legal() {
        for kinds in pipelines(4) {
            for (stage, kind) in kinds.iter().enumerate() {
                assert!(check_write(0, stage, *kind).is_ok());
                assert!(check_read(0, false, stage, *kind).is_ok());
            }
        }
    }

    #[test]
    fn test_engineered_backward_write_is_rejected() {
        // stage 2 writes, stage 1 then writes or reads the same byte
        let token = written_token(2);
        assert_eq!(
            check_write(token, 1, Parallel),
            Err(Violation::Ordering { token: 3, reference: 2 })
        );
        assert!(check_read(token, false, 1, Sequential).is_err());
        assert!(check_read(token, false, 2, Sequential).is_ok());
    }
}
