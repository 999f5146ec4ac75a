use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::snapshot::ProcessRecord;

/// Why a veto refused a kill. The presence of a cause, not its content,
/// blocks the kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VetoCause {
    message: String,
}

impl VetoCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An alternate termination strategy, tried after the standard kill protocol
/// for processes that ignore regular signals (e.g. ones requiring a
/// privileged helper).
///
/// Returns `Ok(true)` when the strategy handled the process, which stops the
/// chain. Errors are logged and treated as "did not succeed".
pub trait ProcessKiller: Send + Sync {
    fn kill(&self, process: &ProcessRecord) -> Result<bool>;
}

/// A predicate that may refuse the killing of a specific process.
///
/// Vetoes are a cooperative safety feature, not a security boundary: a
/// failure while consulting one is logged and treated as "no veto".
pub trait KillVeto: Send + Sync {
    fn veto_kill(&self, process: &ProcessRecord) -> Result<Option<VetoCause>>;
}

/// Externally-owned, ordered chains of killers and vetoes.
///
/// Registration and kills may run concurrently; the kill protocol iterates a
/// stable copy of each chain taken when the kill starts.
#[derive(Default)]
pub struct ExtensionRegistry {
    killers: RwLock<Vec<Arc<dyn ProcessKiller>>>,
    vetoes: RwLock<Vec<Arc<dyn KillVeto>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_killer(&self, killer: Arc<dyn ProcessKiller>) {
        self.killers.write().unwrap().push(killer);
    }

    pub fn register_veto(&self, veto: Arc<dyn KillVeto>) {
        self.vetoes.write().unwrap().push(veto);
    }

    pub fn killers(&self) -> Vec<Arc<dyn ProcessKiller>> {
        self.killers.read().unwrap().clone()
    }

    pub fn vetoes(&self) -> Vec<Arc<dyn KillVeto>> {
        self.vetoes.read().unwrap().clone()
    }

    pub fn has_vetoes(&self) -> bool {
        !self.vetoes.read().unwrap().is_empty()
    }
}

/// Runs the veto chain in order, stopping at the first cause. Fails open on
/// errors.
pub(crate) fn first_veto(
    vetoes: &[Arc<dyn KillVeto>],
    process: &ProcessRecord,
) -> Option<VetoCause> {
    for veto in vetoes {
        match veto.veto_kill(process) {
            Ok(Some(cause)) => {
                debug!(
                    "Killing of pid {} vetoed: {}",
                    process.pid(),
                    cause.message()
                );
                return Some(cause);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    "Failure while checking vetoes for pid {}, assuming no veto: {err:#}",
                    process.pid()
                );
            }
        }
    }
    None
}

/// Runs the killer chain in order, stopping at the first strategy that
/// reports success. Errors are logged and the chain proceeds.
pub(crate) fn run_killer_chain(killers: &[Arc<dyn ProcessKiller>], process: &ProcessRecord) {
    for killer in killers {
        match killer.kill(process) {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => {
                warn!("Killer failed for pid {}: {err:#}", process.pid());
            }
        }
    }
}
