//! Proxying a process tree across hosts.
//!
//! The tree's operations are split into an explicit two-sided protocol: the
//! origin host runs [`serve`] against its local [`ProcessTree`], the remote
//! side holds a [`RemoteProcessTree`] that forwards every operation as a
//! [`Request`] over a caller-supplied [`Channel`]. The proxy keeps no
//! process data of its own beyond the pid list needed to re-identify
//! results.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kill::{Interrupted, KillOutcome};
use crate::prelude::*;
use crate::snapshot::Pid;
use crate::tree::{ProcessTree, ProcessTreeOps};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Pids,
    Parent(Pid),
    Arguments(Pid),
    Environment(Pid),
    Kill(Pid),
    KillRecursively(Pid),
    KillAll(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pids(Vec<Pid>),
    Parent(Option<Pid>),
    Arguments(Vec<String>),
    Environment(BTreeMap<String, String>),
    Kill(KillOutcome),
    Done,
    Interrupted,
    Error(String),
}

/// Request/response transport supplied by the surrounding system. The
/// implementation must deliver each request exactly once over a single
/// connection; this crate does not provide a network transport.
pub trait Channel: Send + Sync {
    fn call(&self, request: Request) -> Result<Response>;
}

/// Executes one request against the local tree on the origin host.
pub fn serve(tree: &ProcessTree, request: Request) -> Response {
    match request {
        Request::Pids => Response::Pids(tree.pids()),
        Request::Parent(pid) => Response::Parent(tree.parent_of(pid)),
        Request::Arguments(pid) => Response::Arguments(tree.arguments_of(pid)),
        Request::Environment(pid) => Response::Environment(tree.environment_of(pid)),
        Request::Kill(pid) => kill_response(tree.kill(pid)),
        Request::KillRecursively(pid) => kill_response(tree.kill_recursively(pid)),
        Request::KillAll(fingerprint) => match tree.kill_all(&fingerprint) {
            Ok(()) => Response::Done,
            Err(err) if err.is::<Interrupted>() => Response::Interrupted,
            Err(err) => Response::Error(format!("{err:#}")),
        },
    }
}

fn kill_response(result: Result<KillOutcome>) -> Response {
    match result {
        Ok(outcome) => Response::Kill(outcome),
        Err(err) if err.is::<Interrupted>() => Response::Interrupted,
        Err(err) => Response::Error(format!("{err:#}")),
    }
}

/// Stand-in for a [`ProcessTree`] that lives on another host.
pub struct RemoteProcessTree {
    channel: Arc<dyn Channel>,
    pids: Vec<Pid>,
}

impl RemoteProcessTree {
    /// Fetches the pid list from the origin host and builds the proxy.
    pub fn connect(channel: Arc<dyn Channel>) -> Result<Self> {
        let pids = match channel.call(Request::Pids)? {
            Response::Pids(pids) => pids,
            other => bail!("unexpected response to pid listing: {other:?}"),
        };
        Ok(Self { channel, pids })
    }

    pub fn get(&self, pid: Pid) -> Option<RemoteProcess<'_>> {
        self.pids
            .contains(&pid)
            .then_some(RemoteProcess { tree: self, pid })
    }

    fn call(&self, request: Request) -> Result<Response> {
        match self.channel.call(request)? {
            Response::Interrupted => Err(Interrupted.into()),
            Response::Error(message) => Err(anyhow!(message)),
            response => Ok(response),
        }
    }
}

impl ProcessTreeOps for RemoteProcessTree {
    fn pids(&self) -> Vec<Pid> {
        self.pids.clone()
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        match self.call(Request::Parent(pid)) {
            Ok(Response::Parent(parent)) => parent,
            Ok(other) => {
                warn!("unexpected response to parent lookup: {other:?}");
                None
            }
            Err(err) => {
                // Lookups are best-effort; a broken channel degrades to "no
                // parent" just like a vanished process does.
                warn!("parent lookup for pid {pid} failed: {err:#}");
                None
            }
        }
    }

    fn arguments_of(&self, pid: Pid) -> Vec<String> {
        match self.call(Request::Arguments(pid)) {
            Ok(Response::Arguments(arguments)) => arguments,
            _ => Vec::new(),
        }
    }

    fn environment_of(&self, pid: Pid) -> BTreeMap<String, String> {
        match self.call(Request::Environment(pid)) {
            Ok(Response::Environment(environment)) => environment,
            _ => BTreeMap::new(),
        }
    }

    fn kill(&self, pid: Pid) -> Result<KillOutcome> {
        match self.call(Request::Kill(pid))? {
            Response::Kill(outcome) => Ok(outcome),
            other => bail!("unexpected response to kill: {other:?}"),
        }
    }

    fn kill_recursively(&self, pid: Pid) -> Result<KillOutcome> {
        match self.call(Request::KillRecursively(pid))? {
            Response::Kill(outcome) => Ok(outcome),
            other => bail!("unexpected response to recursive kill: {other:?}"),
        }
    }

    fn kill_all(&self, fingerprint: &BTreeMap<String, String>) -> Result<()> {
        match self.call(Request::KillAll(fingerprint.clone()))? {
            Response::Done => Ok(()),
            other => bail!("unexpected response to kill_all: {other:?}"),
        }
    }
}

/// One process viewed through a [`RemoteProcessTree`].
pub struct RemoteProcess<'a> {
    tree: &'a RemoteProcessTree,
    pid: Pid,
}

impl RemoteProcess<'_> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Resolves the parent as a further stand-in.
    pub fn parent(&self) -> Option<RemoteProcess<'_>> {
        let parent_pid = self.tree.parent_of(self.pid)?;
        self.tree.get(parent_pid)
    }

    pub fn arguments(&self) -> Vec<String> {
        self.tree.arguments_of(self.pid)
    }

    pub fn environment(&self) -> BTreeMap<String, String> {
        self.tree.environment_of(self.pid)
    }

    pub fn kill(&self) -> Result<KillOutcome> {
        self.tree.kill(self.pid)
    }

    pub fn kill_recursively(&self) -> Result<KillOutcome> {
        self.tree.kill_recursively(self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlatformBackend;
    use crate::config::Config;
    use crate::ext::ExtensionRegistry;
    use crate::testutil::{FakeBackend, KillEvent};
    use std::time::Duration;

    /// In-process channel that serializes every message through JSON, the
    /// way a real transport would.
    struct LoopbackChannel {
        tree: ProcessTree,
    }

    impl Channel for LoopbackChannel {
        fn call(&self, request: Request) -> Result<Response> {
            let request: Request = serde_json::from_value(serde_json::to_value(&request)?)?;
            let response = serve(&self.tree, request);
            Ok(serde_json::from_value(serde_json::to_value(&response)?)?)
        }
    }

    fn local_tree(backend: Arc<FakeBackend>) -> ProcessTree {
        let config = Config {
            soft_kill_wait: Duration::from_millis(100),
            ..Config::default()
        };
        ProcessTree::assemble(backend, config, Arc::new(ExtensionRegistry::new()))
    }

    #[test]
    fn test_round_trip_preserves_pid_arguments_and_environment() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_proc(1, None)
                .with_proc_env(42, Some(1), &[("JOB", "x")]),
        );
        let local = local_tree(backend.clone());
        let local_args = local.arguments_of(42);
        let local_env = local.environment_of(42);

        let remote =
            RemoteProcessTree::connect(Arc::new(LoopbackChannel { tree: local })).unwrap();
        let process = remote.get(42).unwrap();

        assert_eq!(process.pid(), 42);
        assert_eq!(process.arguments(), local_args);
        assert_eq!(process.environment(), local_env);
        assert_eq!(process.parent().unwrap().pid(), 1);
    }

    #[test]
    fn test_remote_kill_reaches_the_origin_backend() {
        let backend = Arc::new(FakeBackend::new().with_proc(1, None).with_proc(2, Some(1)));
        let remote = RemoteProcessTree::connect(Arc::new(LoopbackChannel {
            tree: local_tree(backend.clone()),
        }))
        .unwrap();

        assert_eq!(remote.kill_recursively(1).unwrap(), KillOutcome::Attempted);
        assert_eq!(
            backend.events(),
            vec![KillEvent::Soft(2), KillEvent::Soft(1)]
        );
    }

    #[test]
    fn test_remote_kill_all_is_forwarded() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_proc_env(7, None, &[("JOB", "x")])
                .with_proc_env(8, None, &[("JOB", "y")]),
        );
        let remote = RemoteProcessTree::connect(Arc::new(LoopbackChannel {
            tree: local_tree(backend.clone()),
        }))
        .unwrap();

        let fingerprint: BTreeMap<String, String> =
            [("JOB".to_string(), "x".to_string())].into_iter().collect();
        remote.kill_all(&fingerprint).unwrap();

        assert!(!backend.is_alive(7));
        assert!(backend.is_alive(8));
    }

    #[test]
    fn test_unknown_pid_is_not_exposed_by_the_proxy() {
        let backend = Arc::new(FakeBackend::new().with_proc(1, None));
        let remote = RemoteProcessTree::connect(Arc::new(LoopbackChannel {
            tree: local_tree(backend),
        }))
        .unwrap();
        assert!(remote.get(12345).is_none());
    }
}
