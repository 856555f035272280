//! Stage layout and process numbering.
//!
//! Process ids ("nodes") are dense: stage workers first in stage order with
//! the replicas of one stage consecutive, then the try-commit processes, and
//! the commit process (the parent) last.

use crate::core::config::{RuntimeConfig, MAX_PROCESSES};
use crate::core::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Runs in one process, once per iteration, in order.
    Sequential,
    /// Replicated; replica `r` runs iterations `i` with `i mod replicas == r`.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub replicas: usize,
}

impl StageSpec {
    pub const fn sequential() -> Self {
        Self {
            kind: StageKind::Sequential,
            replicas: 1,
        }
    }

    pub const fn parallel(replicas: usize) -> Self {
        Self {
            kind: StageKind::Parallel,
            replicas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    stages: Vec<StageSpec>,
    first_wid: Vec<u32>,
    workers: usize,
    try_commits: usize,
}

impl Topology {
    pub fn new(stages: Vec<StageSpec>, try_commits: usize) -> RuntimeResult<Self> {
        let fail = |reason: String| Err(RuntimeError::InvalidTopology { reason });

        let Some(first) = stages.first() else {
            return fail("a pipeline needs at least one stage".to_string());
        };
        if first.kind != StageKind::Sequential {
            return fail("stage 0 evaluates the loop header and must be sequential".to_string());
        }
        for (index, stage) in stages.iter().enumerate() {
            match stage.kind {
                StageKind::Sequential if stage.replicas != 1 => {
                    return fail(format!("sequential stage {index} has {} replicas", stage.replicas));
                }
                StageKind::Parallel if stage.replicas == 0 => {
                    return fail(format!("parallel stage {index} has no replicas"));
                }
                _ => {}
            }
        }
        if try_commits == 0 {
            return fail("at least one try-commit process is required".to_string());
        }

        let mut first_wid = Vec::with_capacity(stages.len());
        let mut workers = 0usize;
        for stage in &stages {
            first_wid.push(workers as u32);
            workers += stage.replicas;
        }
        if workers + try_commits + 1 > MAX_PROCESSES {
            return fail(format!(
                "{workers} workers and {try_commits} try-commits exceed {MAX_PROCESSES} processes"
            ));
        }

        Ok(Self {
            stages,
            first_wid,
            workers,
            try_commits,
        })
    }

    /// Split the configuration's worker budget across stages of the given kinds.
    ///
    /// Sequential stages get one process; the rest is shared evenly between the
    /// parallel stages, earlier stages taking the remainder.
    pub fn partition(config: &RuntimeConfig, kinds: &[StageKind]) -> RuntimeResult<Self> {
        let budget = config.worker_budget();
        let sequential = kinds.iter().filter(|k| **k == StageKind::Sequential).count();
        let parallel = kinds.len() - sequential;
        if budget < kinds.len() {
            return Err(RuntimeError::InvalidTopology {
                reason: format!("{} stages need more than {budget} worker processes", kinds.len()),
            });
        }

        let spare = budget - sequential;
        let mut handed = 0usize;
        let stages = kinds
            .iter()
            .map(|kind| match kind {
                StageKind::Sequential => StageSpec::sequential(),
                StageKind::Parallel => {
                    let extra = usize::from(handed < spare % parallel);
                    handed += 1;
                    StageSpec::parallel(spare / parallel + extra)
                }
            })
            .collect();
        Self::new(stages, config.try_commit_count())
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, stage: usize) -> StageSpec {
        self.stages[stage]
    }

    pub fn kind(&self, stage: usize) -> StageKind {
        self.stages[stage].kind
    }

    pub fn replicas(&self, stage: usize) -> usize {
        self.stages[stage].replicas
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn try_commits(&self) -> usize {
        self.try_commits
    }

    /// Workers, try-commits and the commit process.
    pub fn nodes(&self) -> usize {
        self.workers + self.try_commits + 1
    }

    pub fn commit_node(&self) -> u32 {
        (self.workers + self.try_commits) as u32
    }

    pub fn try_commit_node(&self, index: usize) -> u32 {
        (self.workers + index) as u32
    }

    pub fn try_commit_nodes(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.try_commits).map(|k| self.try_commit_node(k))
    }

    pub fn is_worker(&self, node: u32) -> bool {
        (node as usize) < self.workers
    }

    pub fn first_wid(&self, stage: usize) -> u32 {
        self.first_wid[stage]
    }

    pub fn stage_workers(&self, stage: usize) -> impl Iterator<Item = u32> {
        let first = self.first_wid[stage];
        first..first + self.stages[stage].replicas as u32
    }

    pub fn stage_of(&self, wid: u32) -> usize {
        self.first_wid.partition_point(|&first| first <= wid) - 1
    }

    pub fn replica_of(&self, wid: u32) -> usize {
        (wid - self.first_wid[self.stage_of(wid)]) as usize
    }

    /// The worker of `stage` responsible for iteration `iter`.
    pub fn owner(&self, stage: usize, iter: u64) -> u32 {
        self.first_wid[stage] + (iter % self.stages[stage].replicas as u64) as u32
    }

    /// The try-commit process validating `page`.
    pub fn try_commit_for_page(&self, page: usize) -> usize {
        let hashed = ((page >> 12) as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        ((hashed >> 32) % self.try_commits as u64) as usize
    }

    /// Token a stage must dominate: `stage + 1`, plus one for sequential stages.
    pub fn reference_token(&self, stage: usize) -> u8 {
        crate::commit::rules::reference_token(stage, self.kind(stage))
    }

    /// Workers in stages after `wid`'s stage.
    pub fn downstream_of(&self, wid: u32) -> impl Iterator<Item = u32> {
        let next = self.first_wid.get(self.stage_of(wid) + 1).copied();
        next.unwrap_or(self.workers as u32)..self.workers as u32
    }

    /// Other replicas of `wid`'s stage.
    pub fn peers_of(&self, wid: u32) -> impl Iterator<Item = u32> {
        self.stage_workers(self.stage_of(wid)).filter(move |&peer| peer != wid)
    }

    /// Workers in stages before `wid`'s stage.
    pub fn upstream_of(&self, wid: u32) -> impl Iterator<Item = u32> {
        0..self.first_wid[self.stage_of(wid)]
    }
}
