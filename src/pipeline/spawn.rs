//! Forking and reaping pipeline processes.
//!
//! Children never return into the caller's stack: whatever their role does,
//! they leave through `_exit` with a status the parent can classify.

use std::io;
use std::panic::{self, AssertUnwindSafe};

use crate::core::error::{RuntimeError, RuntimeResult};

/// Exit status of a child whose role returned normally.
pub const EXIT_OK: i32 = 0;
/// Exit status of a child whose role returned a fatal error.
pub const EXIT_FATAL: i32 = 1;
/// Exit status of a child that panicked.
pub const EXIT_PANIC: i32 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: libc::pid_t,
    pub node: u32,
    /// Raw `waitpid` status once reaped.
    status: Option<libc::c_int>,
}

impl ChildProcess {
    pub fn is_reaped(&self) -> bool {
        self.status.is_some()
    }
}

/// Restrict the calling process to one core.
pub fn pin_to_core(core: usize) {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    // SAFETY: a zeroed cpu_set_t is the empty set; CPU_SET stays inside it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core % cores, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::debug!("pinning to core {core} failed: {}", io::Error::last_os_error());
        }
    }
}

/// Every child of one run, in spawn order.
#[derive(Debug, Default)]
pub struct Children {
    procs: Vec<ChildProcess>,
}

impl Children {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = libc::pid_t> + '_ {
        self.procs.iter().map(|c| c.pid)
    }

    /// Fork a child for `node` that runs `role` and exits.
    ///
    /// `pin` picks the core the child binds to.
    pub fn spawn<F>(&mut self, node: u32, pin: Option<usize>, role: F) -> RuntimeResult<libc::pid_t>
    where
        F: FnOnce() -> RuntimeResult<()>,
    {
        // SAFETY: the child only runs `role` and then `_exit`s.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(RuntimeError::Fork(io::Error::last_os_error()));
        }
        if pid == 0 {
            if let Some(core) = pin {
                pin_to_core(core);
            }
            let status = match panic::catch_unwind(AssertUnwindSafe(role)) {
                Ok(Ok(())) => EXIT_OK,
                Ok(Err(err)) => {
                    log::error!("node {node} failed: {err}");
                    EXIT_FATAL
                }
                Err(_) => EXIT_PANIC,
            };
            // SAFETY: leaving without running the parent's destructors or atexit hooks.
            unsafe { libc::_exit(status) }
        }
        log::debug!("spawned node {node} as pid {pid}");
        self.procs.push(ChildProcess { pid, node, status: None });
        Ok(pid)
    }

    /// Reap children that already exited. An abnormal exit kills the rest.
    pub fn poll(&mut self) -> RuntimeResult<()> {
        for i in 0..self.procs.len() {
            if self.procs[i].is_reaped() {
                continue;
            }
            let pid = self.procs[i].pid;
            let mut status = 0;
            // SAFETY: plain waitpid on our own child.
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                self.procs[i].status = Some(status);
                if !exited_cleanly(status) {
                    let node = self.procs[i].node;
                    log::error!("node {node} (pid {pid}) died: {}", describe(status));
                    self.kill_all();
                    return Err(RuntimeError::WorkerFailed {
                        pid,
                        status: describe(status),
                    });
                }
            }
        }
        Ok(())
    }

    /// `join_children`: wait for every child. The first abnormal exit is reported
    /// after all of them are reaped.
    pub fn join(&mut self) -> RuntimeResult<()> {
        let mut failure = None;
        for child in &mut self.procs {
            if child.status.is_none() {
                let mut status = 0;
                // SAFETY: plain waitpid on our own child.
                let rc = unsafe { libc::waitpid(child.pid, &mut status, 0) };
                if rc != child.pid {
                    log::error!("waitpid({}) failed: {}", child.pid, io::Error::last_os_error());
                    status = 0;
                }
                child.status = Some(status);
            }
            if let Some(status) = child.status {
                if !exited_cleanly(status) && failure.is_none() {
                    failure = Some(RuntimeError::WorkerFailed {
                        pid: child.pid,
                        status: describe(status),
                    });
                }
            }
        }
        log::debug!("joined {} children", self.procs.len());
        self.procs.clear();
        failure.map_or(Ok(()), Err)
    }

    /// SIGKILL every child not yet reaped.
    pub fn kill_all(&mut self) {
        for child in self.procs.iter().filter(|c| !c.is_reaped()) {
            // SAFETY: signalling our own child.
            unsafe { libc::kill(child.pid, libc::SIGKILL) };
        }
    }
}

fn exited_cleanly(status: libc::c_int) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == EXIT_OK
}

fn describe(status: libc::c_int) -> String {
    if libc::WIFEXITED(status) {
        match libc::WEXITSTATUS(status) {
            EXIT_PANIC => "panicked".to_string(),
            code => format!("exited with status {code}"),
        }
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("wait status {status:#x}")
    }
}
