//! Per-platform process enumeration and kill primitives.

use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessRecord};

#[cfg(target_os = "aix")]
mod aix;
#[cfg(any(target_os = "aix", target_os = "solaris", target_os = "illumos"))]
mod addr_space;
#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "freebsd")]
mod freebsd;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod solaris;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod sysctl;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// Capability interface over one OS family's process facilities.
///
/// `enumerate` is a blocking sweep of the whole process table; the kill
/// primitives operate on a single pid and must be idempotent (killing an
/// already-dead process is a no-op, not an error).
pub trait PlatformBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lists every readable process at this instant. Per-process read
    /// failures exclude that one process; an `Err` means the platform's
    /// process listing itself is unavailable.
    fn enumerate(&self) -> Result<Vec<ProcessRecord>>;

    /// Whether the OS exposes a real parent/child relationship.
    fn has_lineage(&self) -> bool {
        true
    }

    /// Requests graceful termination. `Ok(false)` means the platform has no
    /// graceful primitive (or could not deliver one), so the caller should
    /// escalate immediately instead of waiting.
    fn soft_kill(&self, pid: Pid) -> io::Result<bool>;

    /// Unconditional, uncatchable termination.
    fn hard_kill(&self, pid: Pid) -> io::Result<()>;

    /// Platform-level "kill the whole tree" primitive, used only on backends
    /// without lineage.
    fn kill_tree(&self, pid: Pid) -> io::Result<()> {
        self.hard_kill(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool;
}

/// Backend for platforms without process introspection, and the fallback
/// when enumeration is unavailable: reports an empty tree, kills nothing.
pub struct NoopBackend;

impl PlatformBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        Ok(Vec::new())
    }

    fn has_lineage(&self) -> bool {
        false
    }

    fn soft_kill(&self, _pid: Pid) -> io::Result<bool> {
        Ok(false)
    }

    fn hard_kill(&self, _pid: Pid) -> io::Result<()> {
        Ok(())
    }

    fn is_alive(&self, _pid: Pid) -> bool {
        false
    }
}

/// Selects the backend for the OS this program runs on.
#[allow(unused_variables)]
pub fn detect(config: &Config) -> Arc<dyn PlatformBackend> {
    #[cfg(target_os = "linux")]
    return Arc::new(linux::LinuxBackend);

    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    return Arc::new(solaris::SolarisBackend::new(config));

    #[cfg(target_os = "aix")]
    return Arc::new(aix::AixBackend::new(config));

    #[cfg(target_os = "macos")]
    return Arc::new(darwin::DarwinBackend);

    #[cfg(target_os = "freebsd")]
    return Arc::new(freebsd::FreeBsdBackend);

    #[cfg(windows)]
    return Arc::new(windows::WindowsBackend);

    #[cfg(not(any(
        target_os = "linux",
        target_os = "solaris",
        target_os = "illumos",
        target_os = "aix",
        target_os = "macos",
        target_os = "freebsd",
        windows
    )))]
    {
        debug!("No process-tree backend for this platform, using the no-op backend");
        Arc::new(NoopBackend)
    }
}
