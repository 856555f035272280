//! Test utilities for runtime-level tests.
//!
//! Tests in one binary share an address space, so every [`TestContext`] hands
//! out its own heap window base. Tests that fork take [`fork_lock`] first:
//! forking while another test thread holds a lock the child needs would leave
//! the child stuck.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::config::RuntimeConfig;
use super::context::{Runtime, RuntimeContext};
use super::error::RuntimeResult;

/// First window handed out to tests, clear of the default base.
const TEST_WINDOW_BASE: usize = 0x2400_0000_0000;
const TEST_WINDOW_STRIDE: usize = 1 << 34;
const TEST_WINDOWS: usize = 192;

static NEXT_WINDOW: AtomicUsize = AtomicUsize::new(0);
static FORK_LOCK: Mutex<()> = Mutex::new(());

/// A heap window base no other test context of this process uses.
pub fn unique_window_base() -> usize {
    let index = NEXT_WINDOW.fetch_add(1, Ordering::Relaxed) % TEST_WINDOWS;
    TEST_WINDOW_BASE + index * TEST_WINDOW_STRIDE
}

/// Serialise tests that fork.
pub fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A small configuration on a private window.
pub struct TestContext {
    config: RuntimeConfig,
}

impl TestContext {
    /// Six processes: four workers, one try-commit and the parent.
    pub fn new() -> Self {
        Self::with_procs(6, 1)
    }

    pub fn with_procs(num_procs: usize, try_commits: usize) -> Self {
        let config = RuntimeConfig {
            num_procs,
            num_try_commit: Some(try_commits),
            queue_capacity: 1 << 10,
            value_queue_capacity: 1 << 8,
            chunk_pool_size: 32,
            arena_size: 4 << 20,
            arena_chunk_size: 1 << 20,
            window_base: unique_window_base(),
            touched_page_capacity: 1 << 10,
            super_packet_threshold: 256,
            pin_cores: false,
        };
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.config
    }

    pub fn runtime(&self) -> RuntimeResult<Runtime> {
        Runtime::new(self.config.clone())
    }

    pub fn context(&self) -> RuntimeResult<RuntimeContext> {
        RuntimeContext::new(self.config.clone())
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
