//! Process-table snapshots and coordinated termination of process trees.

pub mod backend;
pub mod cli;
mod config;
mod ext;
mod kill;
mod logger;
mod prelude;
mod remote;
mod snapshot;
mod tree;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use ext::{ExtensionRegistry, KillVeto, ProcessKiller, VetoCause};
pub use kill::{Cancellation, Interrupted, KillOutcome};
pub use remote::{Channel, RemoteProcess, RemoteProcessTree, Request, Response, serve};
pub use snapshot::{DataModel, NoDetails, Pid, ProcessDetails, ProcessRecord, Snapshot};
pub use tree::{ProcessTree, ProcessTreeOps};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
