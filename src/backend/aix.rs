//! AIX backend over /proc.
//!
//! `/proc/<pid>/status` (a pstatus struct) carries the target's data model
//! and its pid/ppid as 64-bit integers; `/proc/<pid>/psinfo` carries the
//! argument count and the addresses of the argv/envp *pointers* inside the
//! target's address space. Unlike Solaris, `pr_argv`/`pr_envp` hold the
//! address of a pointer to the vector, so each walk starts with one extra
//! dereference.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use crate::backend::addr_space::{AddressSpace, env_entry};
use crate::backend::{PlatformBackend, unix};
use crate::config::Config;
use crate::prelude::*;
use crate::snapshot::{DataModel, Pid, ProcessDetails, ProcessRecord};

const PR_MODEL_ILP32: u8 = 0;
const PR_MODEL_LP64: u8 = 1;

// pstatus offsets: pr_dmodel byte, then pr_pid/pr_ppid as u64s
const STATUS_DMODEL_OFFSET: usize = 17;
const STATUS_PID_OFFSET: usize = 88;
const STATUS_PPID_OFFSET: usize = 96;

// psinfo offsets: pr_pid/pr_ppid again (cross-checked), then pr_argc and the
// two vector addresses
const PSINFO_PID_OFFSET: usize = 48;
const PSINFO_PPID_OFFSET: usize = 56;
const PSINFO_ARGC_OFFSET: usize = 148;
const PSINFO_ARGV_OFFSET: usize = 152;
const PSINFO_ENVP_OFFSET: usize = 160;

pub struct AixBackend {
    read_limit: usize,
}

impl AixBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            read_limit: config.address_space_read_limit,
        }
    }

    fn parse_process(&self, pid: Pid) -> Result<ProcessRecord> {
        let status = fs::read(format!("/proc/{pid}/status"))?;

        let data_model = match status.get(STATUS_DMODEL_OFFSET).copied() {
            Some(PR_MODEL_ILP32) => DataModel::Bits32,
            Some(PR_MODEL_LP64) => DataModel::Bits64,
            other => bail!("unrecognized data model byte {other:?}"),
        };
        if read_u64(&status, STATUS_PID_OFFSET)? as Pid != pid {
            bail!("pstatus pid mismatch");
        }
        let ppid = read_u64(&status, STATUS_PPID_OFFSET)? as Pid;

        let psinfo = fs::read(format!("/proc/{pid}/psinfo"))?;
        if read_u64(&psinfo, PSINFO_PID_OFFSET)? as Pid != pid {
            bail!("psinfo pid mismatch");
        }
        if read_u64(&psinfo, PSINFO_PPID_OFFSET)? as Pid != ppid {
            bail!("psinfo ppid mismatch");
        }
        let argc = read_u32(&psinfo, PSINFO_ARGC_OFFSET)?;
        let argp = read_u64(&psinfo, PSINFO_ARGV_OFFSET)?;
        let envp = read_u64(&psinfo, PSINFO_ENVP_OFFSET)?;

        Ok(ProcessRecord::new(
            pid,
            (ppid > 0).then_some(ppid),
            None,
            Some(data_model),
            Box::new(AixDetails {
                pid,
                argc,
                argp,
                envp,
                data_model,
                read_limit: self.read_limit,
            }),
        ))
    }
}

impl PlatformBackend for AixBackend {
    fn name(&self) -> &'static str {
        "aix"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let entries = fs::read_dir("/proc").context("Failed to list /proc")?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<Pid>() else {
                continue;
            };
            match self.parse_process(pid) {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!("Excluding pid {pid} from the snapshot: {err}");
                }
            }
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

struct AixDetails {
    pid: Pid,
    argc: u32,
    argp: u64,
    envp: u64,
    data_model: DataModel,
    read_limit: usize,
}

impl AixDetails {
    /// Dereferences the psinfo-provided address once to find the actual
    /// vector, then walks it to its NUL terminator.
    fn walk_indirect_vector(&self, base: u64) -> Vec<String> {
        if base == 0 {
            return Vec::new();
        }
        let Ok(space) = AddressSpace::open(self.pid) else {
            return Vec::new();
        };
        let vector = match space.read_ptr(base, self.data_model) {
            Ok(0) | Err(_) => return Vec::new(),
            Ok(vector) => vector,
        };
        space.read_string_vector(vector, self.data_model, self.read_limit)
    }
}

impl ProcessDetails for AixDetails {
    fn arguments(&self) -> Vec<String> {
        if self.argc == 0 {
            return Vec::new();
        }
        self.walk_indirect_vector(self.argp)
    }

    fn environment(&self) -> BTreeMap<String, String> {
        self.walk_indirect_vector(self.envp)
            .iter()
            .filter_map(|line| env_entry(line))
            .collect()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow!("proc struct truncated at offset {offset}"))?;
    Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| anyhow!("proc struct truncated at offset {offset}"))?;
    Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
}
