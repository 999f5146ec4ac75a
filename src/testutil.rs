//! Process doubles for exercising the kill protocol without touching the OS.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use crate::backend::PlatformBackend;
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessDetails, ProcessRecord, Snapshot};

pub(crate) struct StaticDetails {
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl StaticDetails {
    pub fn new<'a>(
        arguments: Vec<String>,
        environment: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            arguments,
            environment: environment
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ProcessDetails for StaticDetails {
    fn arguments(&self) -> Vec<String> {
        self.arguments.clone()
    }

    fn environment(&self) -> BTreeMap<String, String> {
        self.environment.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KillEvent {
    Soft(Pid),
    Hard(Pid),
    Tree(Pid),
}

struct ProcSpec {
    ppid: Option<Pid>,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

/// An in-memory process table that records which kill primitives were
/// invoked, in order.
pub(crate) struct FakeBackend {
    specs: Vec<(Pid, ProcSpec)>,
    alive: Mutex<HashMap<Pid, bool>>,
    events: Mutex<Vec<KillEvent>>,
    ignores_soft: HashSet<Pid>,
    lineage: bool,
    fail_enumeration: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            alive: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            ignores_soft: HashSet::new(),
            lineage: true,
            fail_enumeration: false,
        }
    }

    pub fn with_proc(self, pid: Pid, ppid: Option<Pid>) -> Self {
        self.with_proc_env(pid, ppid, &[])
    }

    pub fn with_proc_env(mut self, pid: Pid, ppid: Option<Pid>, env: &[(&str, &str)]) -> Self {
        self.specs.push((
            pid,
            ProcSpec {
                ppid,
                args: vec![format!("proc-{pid}")],
                env: env
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        ));
        self.alive.lock().unwrap().insert(pid, true);
        self
    }

    /// The given process ignores graceful termination (so the protocol has
    /// to wait out the full deadline before escalating).
    pub fn ignoring_soft_kill(mut self, pid: Pid) -> Self {
        self.ignores_soft.insert(pid);
        self
    }

    pub fn without_lineage(mut self) -> Self {
        self.lineage = false;
        self
    }

    pub fn failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    pub fn events(&self) -> Vec<KillEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_records(self.enumerate().unwrap())
    }

    fn mark_dead(&self, pid: Pid) {
        self.alive.lock().unwrap().insert(pid, false);
    }

    fn kill_subtree(&self, pid: Pid) {
        self.mark_dead(pid);
        let children: Vec<Pid> = self
            .specs
            .iter()
            .filter(|(_, spec)| spec.ppid == Some(pid))
            .map(|(child, _)| *child)
            .collect();
        for child in children {
            self.kill_subtree(child);
        }
    }
}

impl PlatformBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        if self.fail_enumeration {
            bail!("process listing unavailable");
        }
        let alive = self.alive.lock().unwrap();
        Ok(self
            .specs
            .iter()
            .filter(|(pid, _)| alive.get(pid).copied().unwrap_or(false))
            .map(|(pid, spec)| {
                ProcessRecord::new(
                    *pid,
                    if self.lineage { spec.ppid } else { None },
                    None,
                    None,
                    Box::new(StaticDetails {
                        arguments: spec.args.clone(),
                        environment: spec.env.iter().cloned().collect(),
                    }),
                )
            })
            .collect())
    }

    fn has_lineage(&self) -> bool {
        self.lineage
    }

    fn soft_kill(&self, pid: Pid) -> io::Result<bool> {
        self.events.lock().unwrap().push(KillEvent::Soft(pid));
        if !self.ignores_soft.contains(&pid) {
            self.mark_dead(pid);
        }
        Ok(true)
    }

    fn hard_kill(&self, pid: Pid) -> io::Result<()> {
        self.events.lock().unwrap().push(KillEvent::Hard(pid));
        self.mark_dead(pid);
        Ok(())
    }

    fn kill_tree(&self, pid: Pid) -> io::Result<()> {
        self.events.lock().unwrap().push(KillEvent::Tree(pid));
        self.kill_subtree(pid);
        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.alive.lock().unwrap().get(&pid).copied().unwrap_or(false)
    }
}
