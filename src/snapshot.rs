use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Process identifier, as reported by the operating system.
pub type Pid = i32;

/// Pointer width of a target process, independent of this program's own
/// bitness. Only populated by backends that dereference pointers inside the
/// target's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataModel {
    Bits32,
    Bits64,
}

impl DataModel {
    pub fn pointer_size(self) -> usize {
        match self {
            DataModel::Bits32 => 4,
            DataModel::Bits64 => 8,
        }
    }
}

/// Backend-supplied accessor for the expensive per-process fields.
///
/// Implementations read argv/envp from the OS on demand and degrade to empty
/// data on any failure (permission denied, process exited) instead of
/// erroring.
pub trait ProcessDetails: Send + Sync {
    fn arguments(&self) -> Vec<String>;
    fn environment(&self) -> BTreeMap<String, String>;
}

/// Details for a process nothing could be read from.
pub struct NoDetails;

impl ProcessDetails for NoDetails {
    fn arguments(&self) -> Vec<String> {
        Vec::new()
    }

    fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// One OS process at snapshot time.
///
/// Arguments and environment are fetched on first access and memoized; the
/// record itself never changes after construction.
pub struct ProcessRecord {
    pid: Pid,
    parent_pid: Option<Pid>,
    name: Option<String>,
    data_model: Option<DataModel>,
    details: Box<dyn ProcessDetails>,
    arguments: OnceLock<Vec<String>>,
    environment: OnceLock<BTreeMap<String, String>>,
}

impl ProcessRecord {
    pub fn new(
        pid: Pid,
        parent_pid: Option<Pid>,
        name: Option<String>,
        data_model: Option<DataModel>,
        details: Box<dyn ProcessDetails>,
    ) -> Self {
        Self {
            pid,
            parent_pid,
            name,
            data_model,
            details,
            arguments: OnceLock::new(),
            environment: OnceLock::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent pid as reported by the OS. `None` on platforms without a
    /// parent/child relationship; may name a pid that is not part of the
    /// snapshot (resolve through [`Snapshot::parent_of`]).
    pub fn parent_pid(&self) -> Option<Pid> {
        self.parent_pid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data_model(&self) -> Option<DataModel> {
        self.data_model
    }

    /// Command-line arguments, empty if they could not be read.
    pub fn arguments(&self) -> &[String] {
        self.arguments.get_or_init(|| self.details.arguments())
    }

    /// Environment variables, empty if they could not be read.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        self.environment.get_or_init(|| self.details.environment())
    }

    /// Whether this process's environment carries every fingerprint variable
    /// with an identical value. An empty fingerprint never matches, so a
    /// caller mistake cannot select the entire process table.
    pub fn matches_env(&self, fingerprint: &BTreeMap<String, String>) -> bool {
        if fingerprint.is_empty() {
            return false;
        }
        let env = self.environment();
        fingerprint
            .iter()
            .all(|(key, value)| env.get(key) == Some(value))
    }
}

impl fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("pid", &self.pid)
            .field("parent_pid", &self.parent_pid)
            .field("name", &self.name)
            .field("data_model", &self.data_model)
            .finish_non_exhaustive()
    }
}

/// Immutable point-in-time view of the process table.
///
/// Built once by a platform backend; lookups never mutate it and it can be
/// shared across threads freely. A fresh snapshot should be taken for every
/// new kill or lookup operation.
#[derive(Debug, Default)]
pub struct Snapshot {
    processes: BTreeMap<Pid, ProcessRecord>,
}

impl Snapshot {
    pub fn from_records(records: Vec<ProcessRecord>) -> Self {
        let processes = records
            .into_iter()
            .map(|record| (record.pid(), record))
            .collect();
        Self { processes }
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    /// Resolves a process's parent within this snapshot. An unresolved or
    /// absent parent pid yields `None`, never an error.
    pub fn parent_of(&self, pid: Pid) -> Option<&ProcessRecord> {
        let parent_pid = self.get(pid)?.parent_pid()?;
        self.get(parent_pid)
    }

    /// Immediate children, derived by a linear scan of the snapshot.
    pub fn children(&self, pid: Pid) -> Vec<&ProcessRecord> {
        self.processes
            .values()
            .filter(|record| record.parent_pid() == Some(pid))
            .collect()
    }

    /// Transitive closure of [`Snapshot::children`], depth-first.
    pub fn descendants(&self, pid: Pid) -> Vec<&ProcessRecord> {
        let mut result = Vec::new();
        self.collect_descendants(pid, &mut result);
        result
    }

    fn collect_descendants<'a>(&'a self, pid: Pid, result: &mut Vec<&'a ProcessRecord>) {
        for child in self.children(pid) {
            result.push(child);
            self.collect_descendants(child.pid(), result);
        }
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.values()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
