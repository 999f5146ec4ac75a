use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{self, NoopBackend, PlatformBackend};
use crate::config::Config;
use crate::ext::ExtensionRegistry;
use crate::kill::{KillContext, KillOutcome};
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessRecord, Snapshot};

/// The operations a process tree supports, shared by the local
/// implementation and the remote proxy so callers can be written against
/// either.
pub trait ProcessTreeOps {
    fn pids(&self) -> Vec<Pid>;
    fn parent_of(&self, pid: Pid) -> Option<Pid>;
    fn arguments_of(&self, pid: Pid) -> Vec<String>;
    fn environment_of(&self, pid: Pid) -> BTreeMap<String, String>;
    fn kill(&self, pid: Pid) -> Result<KillOutcome>;
    fn kill_recursively(&self, pid: Pid) -> Result<KillOutcome>;

    /// Kills every process (recursively) whose environment carries all of
    /// the fingerprint variables. An empty fingerprint performs no kills.
    fn kill_all(&self, fingerprint: &BTreeMap<String, String>) -> Result<()>;
}

/// A snapshot of the local system's process tree plus everything needed to
/// kill parts of it.
///
/// Capture is a blocking sweep of OS files/syscalls; invoke it from a worker
/// thread when the caller is latency-sensitive. The result is immutable and
/// freely shareable; take a fresh capture for each new operation rather than
/// acting on stale topology.
pub struct ProcessTree {
    backend: Arc<dyn PlatformBackend>,
    snapshot: Snapshot,
    registry: Arc<ExtensionRegistry>,
    vetoes_present: bool,
    config: Config,
}

impl ProcessTree {
    /// Captures the current process table with environment-derived defaults
    /// and no extensions.
    pub fn capture() -> Self {
        Self::capture_with(
            Config::env_default().clone(),
            Arc::new(ExtensionRegistry::new()),
        )
    }

    /// Captures the current process table. When the subsystem is disabled or
    /// the platform's process listing is unavailable this degrades to an
    /// empty tree backed by the no-op backend.
    pub fn capture_with(config: Config, registry: Arc<ExtensionRegistry>) -> Self {
        if !config.enabled {
            debug!("Process-tree subsystem is disabled, returning an empty tree");
            return Self::assemble(Arc::new(NoopBackend), config, registry);
        }
        let backend = backend::detect(&config);
        Self::assemble(backend, config, registry)
    }

    pub(crate) fn assemble(
        backend: Arc<dyn PlatformBackend>,
        config: Config,
        registry: Arc<ExtensionRegistry>,
    ) -> Self {
        let snapshot = match backend.enumerate() {
            Ok(records) => Snapshot::from_records(records),
            Err(err) => {
                warn!(
                    "Process enumeration failed on the {} backend, falling back to an empty tree: {err:#}",
                    backend.name()
                );
                Snapshot::default()
            }
        };
        // Memoized per capture so each kill does not have to re-ask.
        let vetoes_present = registry.has_vetoes();
        Self {
            backend,
            snapshot,
            registry,
            vetoes_present,
            config,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.snapshot.get(pid)
    }

    /// Looks up the record for a process spawned by this program.
    pub fn get_child(&self, child: &std::process::Child) -> Option<&ProcessRecord> {
        self.get(child.id() as Pid)
    }

    /// Convenience for tearing down everything a launched process may have
    /// left behind: recursively kills the child's subtree, then sweeps for
    /// fingerprint matches (daemons that detached from the lineage). Falls
    /// back to a plain single kill of the handle when the child is not in
    /// the snapshot (e.g. the no-op backend).
    pub fn kill_launched(
        &self,
        child: &mut std::process::Child,
        fingerprint: &BTreeMap<String, String>,
    ) -> Result<()> {
        let pid = child.id() as Pid;
        if self.get(pid).is_some() {
            self.kill_recursively(pid)?;
        } else if let Err(err) = child.kill() {
            debug!("Direct kill of child {pid} failed: {err}");
        }
        if !fingerprint.is_empty() {
            self.kill_all(fingerprint)?;
        }
        Ok(())
    }

    fn kill_context(&self) -> KillContext<'_> {
        KillContext {
            backend: self.backend.as_ref(),
            snapshot: &self.snapshot,
            killers: self.registry.killers(),
            vetoes: if self.vetoes_present {
                self.registry.vetoes()
            } else {
                Vec::new()
            },
            soft_kill_wait: self.config.soft_kill_wait,
            cancel: self.config.cancel.clone(),
        }
    }
}

impl ProcessTreeOps for ProcessTree {
    fn pids(&self) -> Vec<Pid> {
        self.snapshot.pids()
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.snapshot.parent_of(pid).map(|record| record.pid())
    }

    fn arguments_of(&self, pid: Pid) -> Vec<String> {
        self.get(pid)
            .map(|record| record.arguments().to_vec())
            .unwrap_or_default()
    }

    fn environment_of(&self, pid: Pid) -> BTreeMap<String, String> {
        self.get(pid)
            .map(|record| record.environment().clone())
            .unwrap_or_default()
    }

    fn kill(&self, pid: Pid) -> Result<KillOutcome> {
        self.kill_context().kill(pid)
    }

    fn kill_recursively(&self, pid: Pid) -> Result<KillOutcome> {
        self.kill_context().kill_recursively(pid)
    }

    fn kill_all(&self, fingerprint: &BTreeMap<String, String>) -> Result<()> {
        if fingerprint.is_empty() {
            // Refuse to match (and kill) every process on the system.
            warn!("kill_all called with an empty fingerprint, refusing to act");
            return Ok(());
        }
        let ctx = self.kill_context();
        for record in self.snapshot.iter() {
            if record.matches_env(fingerprint) {
                ctx.kill_recursively(record.pid())?;
            } else {
                trace!("Environment did not match for pid {}", record.pid());
            }
        }
        Ok(())
    }
}
