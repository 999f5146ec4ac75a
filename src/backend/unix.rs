//! Signal-based kill primitives shared by every Unix backend.

use std::io;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid as NixPid;

use crate::snapshot::Pid;

/// Sends SIGTERM. An already-gone process is not an error; the caller's wait
/// loop will observe the death immediately.
pub(crate) fn soft_kill(pid: Pid) -> io::Result<bool> {
    match kill(NixPid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Sends SIGKILL, treating an already-dead process as a no-op.
pub(crate) fn hard_kill(pid: Pid) -> io::Result<()> {
    match kill(NixPid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Probes for existence with the null signal. EPERM still means the process
/// exists, we just may not signal it.
pub(crate) fn is_alive(pid: Pid) -> bool {
    match kill(NixPid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id() as Pid));
    }

    #[test]
    fn test_nonexistent_process_is_not_alive() {
        // pid_max on Linux defaults to 4194304; this pid cannot exist
        assert!(!is_alive(999_999_999));
    }

    #[test]
    fn test_kill_primitives_are_idempotent_on_dead_pids() {
        assert!(soft_kill(999_999_999).unwrap());
        hard_kill(999_999_999).unwrap();
    }
}
