//! Runtime configuration.
//!
//! The code generator's only configuration input is the processor count; the
//! remaining knobs size the shared structures. Everything has a default,
//! [`RuntimeConfig::from_env`] overrides from the environment, and the demo
//! binary overrides again from the command line.

use std::env;

use super::error::{RuntimeError, RuntimeResult};
use super::region::PAGE_SIZE;
use crate::shadow::SHADOW_BIT;

/// Environment variable holding the externally provided processor count.
pub const ENV_NUM_PROCS: &str = "SPECPIPE_NUM_PROCS";

/// Environment variable overriding the number of try-commit processes.
pub const ENV_TRY_COMMIT: &str = "SPECPIPE_TRY_COMMIT";

/// Environment variable overriding the base of the heap window (hex or decimal).
pub const ENV_WINDOW_BASE: &str = "SPECPIPE_WINDOW_BASE";

/// Upper bound on processes in one invocation (workers + try-commits + parent).
///
/// Chunk `sign` bitmaps hold one bit per consuming process in a `u64`.
pub const MAX_PROCESSES: usize = 63;

/// Default base of the heap window. Bit 44 must be clear across the window.
pub const DEFAULT_WINDOW_BASE: usize = 0x2000_0000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Total processes available, the parent (commit) process included.
    pub num_procs: usize,
    /// Try-commit processes; `None` derives it from `num_procs`.
    pub num_try_commit: Option<usize>,
    /// Packets per transport queue. Power of two.
    pub queue_capacity: usize,
    /// Words per explicit value queue. Power of two.
    pub value_queue_capacity: usize,
    /// Packet chunks per producing worker.
    pub chunk_pool_size: usize,
    /// Bytes reserved per (heap class, slot) arena.
    pub arena_size: usize,
    /// Bytes of backing committed at a time as an arena grows.
    pub arena_chunk_size: usize,
    /// Fixed address of the heap window.
    pub window_base: usize,
    /// Capacity of the per-worker touched-page list.
    pub touched_page_capacity: usize,
    /// Relevant bytes in a page above which it travels as one super packet.
    pub super_packet_threshold: usize,
    /// Pin each process to a core.
    pub pin_cores: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let procs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(3, MAX_PROCESSES);
        Self {
            num_procs: procs,
            num_try_commit: None,
            queue_capacity: 1 << 14,
            value_queue_capacity: 1 << 12,
            chunk_pool_size: 256,
            arena_size: 256 << 20,
            arena_chunk_size: 1 << 20,
            window_base: DEFAULT_WINDOW_BASE,
            touched_page_capacity: 1 << 14,
            super_packet_threshold: 256,
            pin_cores: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `SPECPIPE_*` environment variables.
    pub fn from_env() -> RuntimeResult<Self> {
        let mut config = Self::default();

        if let Some(procs) = read_env_number(ENV_NUM_PROCS)? {
            config.num_procs = procs;
        }
        if let Some(tc) = read_env_number(ENV_TRY_COMMIT)? {
            config.num_try_commit = Some(tc);
        }
        if let Some(base) = read_env_number(ENV_WINDOW_BASE)? {
            config.window_base = base;
        }

        config.validate()?;
        Ok(config)
    }

    /// Try-commit processes this configuration yields.
    pub fn try_commit_count(&self) -> usize {
        self.num_try_commit
            .unwrap_or_else(|| ((self.num_procs.saturating_sub(1)) / 4).max(1))
    }

    /// Processes left for stage workers once the parent and try-commits are counted.
    pub fn worker_budget(&self) -> usize {
        self.num_procs
            .saturating_sub(1)
            .saturating_sub(self.try_commit_count())
    }

    /// Heap slots: one per possible worker plus the parent's.
    pub fn heap_slots(&self) -> usize {
        self.worker_budget() + 1
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        let fail = |reason: String| Err(RuntimeError::InvalidConfig { reason });

        if self.num_procs < 3 {
            return fail(format!("need at least 3 processes, got {}", self.num_procs));
        }
        if self.num_procs > MAX_PROCESSES {
            return fail(format!(
                "at most {MAX_PROCESSES} processes supported, got {}",
                self.num_procs
            ));
        }
        if self.try_commit_count() == 0 || self.worker_budget() == 0 {
            return fail(format!(
                "{} processes leave no room for {} try-commit processes and a worker",
                self.num_procs,
                self.try_commit_count()
            ));
        }
        if !self.queue_capacity.is_power_of_two() || self.queue_capacity < 16 {
            return fail(format!("queue capacity {} is not a power of two >= 16", self.queue_capacity));
        }
        if !self.value_queue_capacity.is_power_of_two() {
            return fail(format!(
                "value queue capacity {} is not a power of two",
                self.value_queue_capacity
            ));
        }
        if self.chunk_pool_size == 0 {
            return fail("chunk pool must hold at least one chunk".to_string());
        }
        if self.arena_chunk_size == 0 || self.arena_chunk_size % PAGE_SIZE != 0 {
            return fail(format!("arena chunk size {} is not page aligned", self.arena_chunk_size));
        }
        if self.arena_size < self.arena_chunk_size || self.arena_size % self.arena_chunk_size != 0 {
            return fail(format!(
                "arena size {} is not a multiple of the chunk size {}",
                self.arena_size, self.arena_chunk_size
            ));
        }
        if self.window_base % PAGE_SIZE != 0 {
            return fail(format!("window base {:#x} is not page aligned", self.window_base));
        }

        let len = self.window_len();
        let last = self.window_base.checked_add(len).map(|end| end - 1);
        match last {
            Some(last) if self.window_base & SHADOW_BIT == 0 && last & SHADOW_BIT == 0 => {}
            _ => {
                return fail(format!(
                    "window {:#x}+{len:#x} crosses the shadow bit",
                    self.window_base
                ))
            }
        }
        if (self.window_base | SHADOW_BIT) + len > 0x7fff_ffff_f000 {
            return fail(format!("shadow of window {:#x} leaves user space", self.window_base));
        }
        if self.super_packet_threshold == 0 || self.super_packet_threshold > PAGE_SIZE {
            return fail(format!("super packet threshold {} out of range", self.super_packet_threshold));
        }
        Ok(())
    }

    /// Bytes spanned by the heap window.
    pub fn window_len(&self) -> usize {
        crate::heap::HeapClass::COUNT * self.heap_slots() * self.arena_size
    }
}

fn read_env_number(name: &str) -> RuntimeResult<Option<usize>> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map(Some).map_err(|_| RuntimeError::InvalidConfig {
        reason: format!("{name}={raw} is not a number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> RuntimeConfig {
        RuntimeConfig {
            num_procs: 6,
            arena_size: 4 << 20,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_default_is_valid() {
        RuntimeConfig::default().validate().unwrap();
        small().validate().unwrap();
    }

    #[test]
    fn test_partition_counts() {
        let config = small();
        assert_eq!(config.try_commit_count(), 1);
        assert_eq!(config.worker_budget(), 4);
        assert_eq!(config.heap_slots(), 5);

        let config = RuntimeConfig {
            num_procs: 17,
            ..small()
        };
        assert_eq!(config.try_commit_count(), 4);
        assert_eq!(config.worker_budget(), 12);

        let config = RuntimeConfig {
            num_try_commit: Some(2),
            ..small()
        };
        assert_eq!(config.worker_budget(), 3);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            RuntimeConfig { num_procs: 2, ..small() },
            RuntimeConfig { num_procs: 64, ..small() },
            RuntimeConfig { queue_capacity: 1000, ..small() },
            RuntimeConfig { chunk_pool_size: 0, ..small() },
            RuntimeConfig { arena_size: (4 << 20) + 4096, ..small() },
            RuntimeConfig { window_base: SHADOW_BIT, ..small() },
            RuntimeConfig { num_try_commit: Some(5), ..small() },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(RuntimeError::InvalidConfig { .. })),
                "accepted {config:?}"
            );
        }
    }
}
