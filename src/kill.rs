use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::PlatformBackend;
use crate::ext::{KillVeto, ProcessKiller, VetoCause, first_veto, run_killer_chain};
use crate::prelude::*;
use crate::snapshot::{Pid, Snapshot};

/// Result of one kill protocol run for one process.
///
/// `Attempted` does not promise the process is gone; take a fresh snapshot to
/// verify. A process that could not be found or read never produces an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillOutcome {
    Attempted,
    Vetoed(VetoCause),
}

/// Marker error for a caller-cancelled graceful wait. The process's OS state
/// is left untouched when this is returned.
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kill was cancelled by the caller")
    }
}

impl std::error::Error for Interrupted {}

/// Cooperative cancellation flag shared between a kill in progress and the
/// caller that may want to abort it.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn next_poll_interval(current: Duration) -> Duration {
    (current * 2).min(MAX_POLL_INTERVAL)
}

/// Everything one kill needs, assembled by [`crate::ProcessTree`] when the
/// kill starts: the chains are stable copies, so concurrent registrations do
/// not affect a kill in flight.
pub(crate) struct KillContext<'a> {
    pub backend: &'a dyn PlatformBackend,
    pub snapshot: &'a Snapshot,
    pub killers: Vec<Arc<dyn ProcessKiller>>,
    pub vetoes: Vec<Arc<dyn KillVeto>>,
    pub soft_kill_wait: Duration,
    pub cancel: Cancellation,
}

impl KillContext<'_> {
    /// Runs the graceful-then-forceful protocol on a single process:
    /// veto check, graceful signal, bounded wait, unconditional kill, killer
    /// chain.
    pub fn kill(&self, pid: Pid) -> Result<KillOutcome> {
        let Some(record) = self.snapshot.get(pid) else {
            // Gone since the snapshot was taken; nothing to do.
            debug!("pid {pid} is not part of the snapshot, skipping");
            return Ok(KillOutcome::Attempted);
        };

        if let Some(cause) = first_veto(&self.vetoes, record) {
            return Ok(KillOutcome::Vetoed(cause));
        }

        debug!("Killing pid {pid}");
        let mut exited = false;
        match self.backend.soft_kill(pid) {
            Ok(true) => exited = self.wait_for_exit(pid)?,
            Ok(false) => {
                // No graceful primitive; escalate immediately.
            }
            Err(err) => {
                debug!("Graceful termination of pid {pid} failed: {err}");
            }
        }

        if !exited {
            if let Err(err) = self.backend.hard_kill(pid) {
                debug!("Force kill of pid {pid} failed: {err}");
            }
        }

        // Always consult the killer chain, to catch processes that shrug off
        // standard signals.
        run_killer_chain(&self.killers, record);
        Ok(KillOutcome::Attempted)
    }

    /// Kills a process and its descendants, children first, so a dying
    /// parent cannot orphan live children. Each process gets its own full
    /// soft-kill deadline. On backends without lineage the root alone is
    /// escalated and the platform's kill-tree primitive finishes the job.
    pub fn kill_recursively(&self, pid: Pid) -> Result<KillOutcome> {
        if self.backend.has_lineage() {
            debug!("Recursively killing pid {pid}");
            for child in self.snapshot.children(pid) {
                self.kill_recursively(child.pid())?;
            }
            self.kill(pid)
        } else {
            let outcome = self.kill(pid)?;
            if outcome == KillOutcome::Attempted {
                if let Err(err) = self.backend.kill_tree(pid) {
                    debug!("Kill-tree primitive failed for pid {pid}: {err}");
                }
            }
            Ok(outcome)
        }
    }

    /// Polls for process death with exponential backoff until the process is
    /// gone or the soft-kill deadline elapses. Checks for cancellation on
    /// every iteration.
    fn wait_for_exit(&self, pid: Pid) -> Result<bool> {
        let deadline = Instant::now() + self.soft_kill_wait;
        let mut interval = INITIAL_POLL_INTERVAL;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupted.into());
            }
            if !self.backend.is_alive(pid) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(interval);
            interval = next_poll_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeBackend, KillEvent};
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_millis(10), Duration::from_millis(20))]
    #[case(Duration::from_millis(320), Duration::from_millis(640))]
    #[case(Duration::from_millis(640), Duration::from_secs(1))]
    #[case(Duration::from_secs(1), Duration::from_secs(1))]
    fn test_poll_interval_doubles_up_to_cap(#[case] current: Duration, #[case] next: Duration) {
        assert_eq!(next_poll_interval(current), next);
    }

    fn context<'a>(backend: &'a FakeBackend, snapshot: &'a Snapshot) -> KillContext<'a> {
        KillContext {
            backend,
            snapshot,
            killers: Vec::new(),
            vetoes: Vec::new(),
            soft_kill_wait: Duration::from_millis(120),
            cancel: Cancellation::new(),
        }
    }

    #[test]
    fn test_soft_kill_suffices_for_a_cooperative_process() {
        let backend = FakeBackend::new().with_proc(10, None);
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);

        assert_eq!(ctx.kill(10).unwrap(), KillOutcome::Attempted);
        assert_eq!(backend.events(), vec![KillEvent::Soft(10)]);
        assert!(!backend.is_alive(10));
    }

    #[test]
    fn test_escalates_to_hard_kill_within_bounded_wait() {
        let backend = FakeBackend::new().with_proc(10, None).ignoring_soft_kill(10);
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);

        let start = Instant::now();
        assert_eq!(ctx.kill(10).unwrap(), KillOutcome::Attempted);
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(120), "waited {elapsed:?}");
        // deadline plus at most one poll interval, with generous slack
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
        assert_eq!(
            backend.events(),
            vec![KillEvent::Soft(10), KillEvent::Hard(10)]
        );
    }

    #[test]
    fn test_kill_of_unknown_pid_is_attempted_without_primitives() {
        let backend = FakeBackend::new().with_proc(10, None);
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);

        assert_eq!(ctx.kill(999).unwrap(), KillOutcome::Attempted);
        assert!(backend.events().is_empty());
    }

    #[test]
    fn test_cancellation_unwinds_without_forcing_a_resolution() {
        let backend = FakeBackend::new().with_proc(10, None).ignoring_soft_kill(10);
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);
        ctx.cancel.cancel();

        let err = ctx.kill(10).unwrap_err();
        assert!(err.is::<Interrupted>());
        // the graceful request went out, but nothing else was forced
        assert_eq!(backend.events(), vec![KillEvent::Soft(10)]);
        assert!(backend.is_alive(10));
    }

    #[test]
    fn test_recursive_kill_is_children_first() {
        let backend = FakeBackend::new()
            .with_proc(1, None)
            .with_proc(2, Some(1))
            .with_proc(3, Some(2));
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);

        assert_eq!(ctx.kill_recursively(1).unwrap(), KillOutcome::Attempted);
        assert_eq!(
            backend.events(),
            vec![KillEvent::Soft(3), KillEvent::Soft(2), KillEvent::Soft(1)]
        );
        for pid in [1, 2, 3] {
            assert!(!backend.is_alive(pid), "pid {pid} survived");
        }
    }

    #[test]
    fn test_recursive_kill_without_lineage_uses_tree_primitive() {
        let backend = FakeBackend::new()
            .without_lineage()
            .with_proc(1, None)
            .with_proc(2, Some(1));
        let snapshot = backend.snapshot();
        let ctx = context(&backend, &snapshot);

        assert_eq!(ctx.kill_recursively(1).unwrap(), KillOutcome::Attempted);
        assert_eq!(
            backend.events(),
            vec![KillEvent::Soft(1), KillEvent::Tree(1)]
        );
    }
}
