//! Ordering tokens kept by a try-commit process.
//!
//! One [`TokenPage`] per page the try-commit has ever validated. Tokens live as
//! long as the try-commit process; the `fresh` bitmap is per iteration and is
//! cleared lazily the first time a page is touched in a new iteration.

use hashbrown::HashMap;

use crate::core::error::MisspecReason;
use crate::core::region::{page_of, PAGE_SIZE};
use crate::pipeline::StageKind;
use crate::shadow::bits::{PREDICTED, READ_BEFORE_WRITE};
use crate::shadow::{classify, Access};

use super::rules::{self, Violation};

pub struct TokenPage {
    tokens: [u8; PAGE_SIZE],
    fresh: [u64; PAGE_SIZE / 64],
    epoch: u64,
}

impl TokenPage {
    fn new(epoch: u64) -> Box<Self> {
        Box::new(Self {
            tokens: [0; PAGE_SIZE],
            fresh: [0; PAGE_SIZE / 64],
            epoch,
        })
    }

    fn is_fresh(&self, offset: usize) -> bool {
        self.fresh[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn mark_fresh(&mut self, offset: usize) {
        self.fresh[offset / 64] |= 1 << (offset % 64);
    }
}

#[derive(Default)]
pub struct TokenTable {
    pages: HashMap<usize, Box<TokenPage>>,
    epoch: u64,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start validating iteration `iter`.
    pub fn begin_iteration(&mut self, iter: u64) {
        self.epoch = iter;
    }

    pub fn token(&self, addr: usize) -> u8 {
        self.pages
            .get(&page_of(addr))
            .map_or(0, |page| page.tokens[addr - page_of(addr)])
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn page(&mut self, page: usize) -> &mut TokenPage {
        let epoch = self.epoch;
        let entry = self.pages.entry(page).or_insert_with(|| TokenPage::new(epoch));
        if entry.epoch != epoch {
            entry.fresh = [0; PAGE_SIZE / 64];
            entry.epoch = epoch;
        }
        entry
    }

    /// Validate the accesses of `stage` described by `shadow`, which covers
    /// `addr..addr + shadow.len()` inside one page. All bytes are checked before
    /// any token moves, so a rejected run leaves the table unchanged.
    pub fn validate(
        &mut self,
        addr: usize,
        shadow: &[u8],
        stage: usize,
        kind: StageKind,
    ) -> Result<(), MisspecReason> {
        let base = page_of(addr);
        debug_assert!(addr - base + shadow.len() <= PAGE_SIZE);
        let page = self.page(base);
        let start = addr - base;

        for (i, &bits) in shadow.iter().enumerate() {
            let offset = start + i;
            let token = page.tokens[offset];
            let verdict = match classify(bits, true) {
                Access::Ignore => Ok(()),
                Access::Write => {
                    if bits & (READ_BEFORE_WRITE | PREDICTED) == READ_BEFORE_WRITE {
                        rules::check_read(token, page.is_fresh(offset), stage, kind)
                            .and(rules::check_write(token, stage, kind))
                    } else {
                        rules::check_write(token, stage, kind)
                    }
                }
                Access::ReadBeforeWrite => rules::check_read(token, page.is_fresh(offset), stage, kind),
            };
            if let Err(violation) = verdict {
                let addr = (base + offset) as u64;
                return Err(match violation {
                    Violation::Ordering { token, reference } => MisspecReason::OrderingViolation {
                        addr,
                        stage: stage as u32,
                        token,
                        reference,
                    },
                    Violation::SameIteration => MisspecReason::SameIterationRead {
                        addr,
                        stage: stage as u32,
                    },
                });
            }
        }

        let written = rules::written_token(stage);
        for (i, &bits) in shadow.iter().enumerate() {
            if classify(bits, true) == Access::Write {
                page.tokens[start + i] = written;
                page.mark_fresh(start + i);
            }
        }
        Ok(())
    }

    /// Forget every token (new try-commit generation).
    pub fn reset(&mut self) {
        self.pages.clear();
        self.epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::bits::*;

    const A: usize = 0x2000_0000_1000;

    #[test]
    fn test_forward_flow_across_iterations() {
        let mut table = TokenTable::new();
        table.begin_iteration(0);
        table.validate(A, &[WRITE; 8], 0, StageKind::Sequential).unwrap();
        assert_eq!(table.token(A + 3), 1);

        table.begin_iteration(1);
        // the parallel stage reads what stage 0 wrote one iteration earlier
        table
            .validate(A, &[READ | READ_BEFORE_WRITE; 8], 1, StageKind::Parallel)
            .unwrap();
        // and stage 0 keeps rewriting its own bytes
        table.validate(A, &[READ | READ_BEFORE_WRITE | WRITE; 8], 0, StageKind::Sequential).unwrap();
    }

    #[test]
    fn test_same_iteration_read_is_caught() {
        let mut table = TokenTable::new();
        table.begin_iteration(4);
        table.validate(A + 8, &[WRITE; 8], 0, StageKind::Sequential).unwrap();
        let err = table
            .validate(A + 8, &[READ | READ_BEFORE_WRITE; 8], 1, StageKind::Parallel)
            .unwrap_err();
        assert_eq!(err, MisspecReason::SameIterationRead { addr: (A + 8) as u64, stage: 1 });
    }

    #[test]
    fn test_backward_flow_is_caught_and_leaves_tokens() {
        let mut table = TokenTable::new();
        table.begin_iteration(0);
        table.validate(A + 1, &[WRITE], 1, StageKind::Parallel).unwrap();
        table.begin_iteration(1);
        let err = table
            .validate(A + 1, &[READ | READ_BEFORE_WRITE], 0, StageKind::Sequential)
            .unwrap_err();
        assert!(matches!(err, MisspecReason::OrderingViolation { token: 2, reference: 2, .. }));

        // a partially legal run is rejected as a whole
        assert!(table.validate(A, &[WRITE, WRITE], 0, StageKind::Sequential).is_err());
        assert_eq!(table.token(A), 0);
        assert_eq!(table.token(A + 1), 2);
    }

    #[test]
    fn test_predicted_reads_are_exempt() {
        let mut table = TokenTable::new();
        table.begin_iteration(0);
        table.validate(A, &[WRITE], 2, StageKind::Sequential).unwrap();
        table.begin_iteration(1);
        table
            .validate(A, &[READ | READ_BEFORE_WRITE | PREDICTED], 0, StageKind::Sequential)
            .unwrap();
        // a predicted read followed by a write only answers for the write
        table.validate(A, &[WRITE], 1, StageKind::Sequential).unwrap_err();
        table
            .validate(A + 1, &[WRITE], 1, StageKind::Sequential)
            .unwrap();
        table
            .validate(A + 1, &[READ | READ_BEFORE_WRITE | PREDICTED | WRITE], 1, StageKind::Sequential)
            .unwrap();
    }
}
