//! Linux backend over /proc.
//!
//! Enumeration takes ppid and comm from `stat`; argv and environment are
//! NUL-separated blobs (`cmdline`, `environ`) read lazily on first access.

use std::collections::BTreeMap;
use std::io;

use crate::backend::{PlatformBackend, unix};
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessDetails, ProcessRecord};

pub struct LinuxBackend;

impl PlatformBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let processes = procfs::process::all_processes().context("Failed to list /proc")?;

        let mut records = Vec::new();
        for process in processes {
            let Ok(process) = process else {
                // raced with an exit between readdir and open
                continue;
            };
            let pid = process.pid();
            let stat = match process.stat() {
                Ok(stat) => stat,
                Err(err) => {
                    debug!("Excluding pid {pid} from the snapshot: {err}");
                    continue;
                }
            };
            if stat.pid != pid {
                debug!("Excluding pid {pid}: stat reports pid {}", stat.pid);
                continue;
            }
            let parent_pid = (stat.ppid != 0).then_some(stat.ppid);
            records.push(ProcessRecord::new(
                pid,
                parent_pid,
                Some(stat.comm),
                None,
                Box::new(LinuxDetails { pid }),
            ));
        }
        Ok(records)
    }

    fn soft_kill(&self, pid: Pid) -> io::Result<bool> {
        unix::soft_kill(pid)
    }

    fn hard_kill(&self, pid: Pid) -> io::Result<()> {
        unix::hard_kill(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        unix::is_alive(pid)
    }
}

struct LinuxDetails {
    pid: Pid,
}

impl ProcessDetails for LinuxDetails {
    fn arguments(&self) -> Vec<String> {
        // failures (permission denied, process exited) yield empty data
        procfs::process::Process::new(self.pid)
            .and_then(|process| process.cmdline())
            .unwrap_or_default()
    }

    fn environment(&self) -> BTreeMap<String, String> {
        procfs::process::Process::new(self.pid)
            .and_then(|process| process.environ())
            .map(|environ| {
                environ
                    .into_iter()
                    .map(|(key, value)| {
                        (
                            key.to_string_lossy().into_owned(),
                            value.to_string_lossy().into_owned(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use std::process::{Child, Command, Stdio};
    use std::time::{Duration, Instant};

    fn own_pid() -> Pid {
        std::process::id() as Pid
    }

    fn enumerate() -> Snapshot {
        Snapshot::from_records(LinuxBackend.enumerate().unwrap())
    }

    #[test]
    fn test_snapshot_contains_this_process() {
        let snapshot = enumerate();
        let me = snapshot.get(own_pid()).expect("own pid missing");
        assert_eq!(me.pid(), own_pid());
        assert!(me.name().is_some());
    }

    #[test]
    fn test_own_parent_resolves_to_real_ppid() {
        let snapshot = enumerate();
        let ppid = std::os::unix::process::parent_id() as Pid;
        let me = snapshot.get(own_pid()).unwrap();
        assert_eq!(me.parent_pid(), Some(ppid));
        if let Some(parent) = snapshot.parent_of(own_pid()) {
            assert_eq!(parent.pid(), ppid);
        }
    }

    #[test]
    fn test_own_arguments_are_readable() {
        let snapshot = enumerate();
        let args = snapshot.get(own_pid()).unwrap().arguments();
        assert!(!args.is_empty());
    }

    #[test]
    fn test_child_environment_is_visible() {
        let mut child = Command::new("sleep")
            .arg("30")
            .env("TREEKILL_MARKER", "fingerprint-value")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        // give the child a moment to finish exec'ing so /proc shows its env
        std::thread::sleep(Duration::from_millis(100));

        let snapshot = enumerate();
        let record = snapshot.get(child.id() as Pid).expect("child not found");
        assert_eq!(record.parent_pid(), Some(own_pid()));
        assert_eq!(
            record.environment().get("TREEKILL_MARKER").map(String::as_str),
            Some("fingerprint-value")
        );

        child.kill().unwrap();
        child.wait().unwrap();
    }

    fn wait_until_reaped(child: &mut Child) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                _ => panic!("child was not terminated"),
            }
        }
    }

    #[test]
    fn test_soft_kill_terminates_a_real_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as Pid;

        assert!(LinuxBackend.is_alive(pid));
        assert!(LinuxBackend.soft_kill(pid).unwrap());
        wait_until_reaped(&mut child);
        assert!(!LinuxBackend.is_alive(pid));

        // idempotent on the now-dead pid
        LinuxBackend.hard_kill(pid).unwrap();
    }
}
