//! Solaris/illumos backend over /proc.
//!
//! `/proc/<pid>/psinfo` holds a psinfo_t in the kernel's (host) byte order.
//! The kernel serves the struct variant matching the *reader's* data model,
//! so the field offsets below are fixed at compile time by our own pointer
//! width. The argv/envp addresses refer to the target's address space and
//! must be chased with pointers of the *target's* width, taken from
//! `pr_dmodel`.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use crate::backend::addr_space::{AddressSpace, env_entry};
use crate::backend::{PlatformBackend, unix};
use crate::config::Config;
use crate::prelude::*;
use crate::snapshot::{DataModel, Pid, ProcessDetails, ProcessRecord};

const PR_MODEL_ILP32: u8 = 1;
const PR_MODEL_LP64: u8 = 2;

// psinfo_t offsets (see sys/procfs.h): pr_pid / pr_ppid, then the block
// starting at pr_argc whose layout depends on the reader's data model.
const PR_PID_OFFSET: usize = 8;
const PR_PPID_OFFSET: usize = 12;
#[cfg(target_pointer_width = "64")]
const PR_ARGC_OFFSET: usize = 236;
#[cfg(target_pointer_width = "32")]
const PR_ARGC_OFFSET: usize = 188;

pub struct SolarisBackend {
    read_limit: usize,
}

impl SolarisBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            read_limit: config.address_space_read_limit,
        }
    }

    fn parse_psinfo(&self, pid: Pid) -> Result<ProcessRecord> {
        let psinfo = fs::read(format!("/proc/{pid}/psinfo"))?;

        let reported_pid = read_i32(&psinfo, PR_PID_OFFSET)?;
        if reported_pid != pid {
            bail!("psinfo reports pid {reported_pid}");
        }
        let ppid = read_i32(&psinfo, PR_PPID_OFFSET)?;

        let argc = read_i32(&psinfo, PR_ARGC_OFFSET)? as u32;
        #[cfg(target_pointer_width = "64")]
        let (argp, envp, dmodel_offset) = (
            read_u64(&psinfo, PR_ARGC_OFFSET + 4)?,
            read_u64(&psinfo, PR_ARGC_OFFSET + 12)?,
            PR_ARGC_OFFSET + 20,
        );
        #[cfg(target_pointer_width = "32")]
        let (argp, envp, dmodel_offset) = (
            u64::from(read_u32(&psinfo, PR_ARGC_OFFSET + 4)?),
            u64::from(read_u32(&psinfo, PR_ARGC_OFFSET + 8)?),
            PR_ARGC_OFFSET + 12,
        );

        let data_model = match psinfo.get(dmodel_offset).copied() {
            Some(PR_MODEL_ILP32) => DataModel::Bits32,
            Some(PR_MODEL_LP64) => DataModel::Bits64,
            other => bail!("unrecognized data model byte {other:?}"),
        };

        Ok(ProcessRecord::new(
            pid,
            (ppid > 0).then_some(ppid),
            None,
            Some(data_model),
            Box::new(SolarisDetails {
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

impl PlatformBackend for SolarisBackend {
    fn name(&self) -> &'static str {
        "solaris"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let entries = fs::read_dir("/proc").context("Failed to list /proc")?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<Pid>() else {
                continue;
            };
            match self.parse_psinfo(pid) {
                Ok(record) => records.push(record),
                Err(err) => {
                    // raced with an exit, or the struct failed its sanity
                    // checks; drop the single process either way
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

struct SolarisDetails {
    pid: Pid,
    argc: u32,
    argp: u64,
    envp: u64,
    data_model: DataModel,
    read_limit: usize,
}

impl ProcessDetails for SolarisDetails {
    fn arguments(&self) -> Vec<String> {
        if self.argc == 0 || self.argp == 0 {
            return Vec::new();
        }
        let Ok(space) = AddressSpace::open(self.pid) else {
            return Vec::new();
        };
        // pr_argv points straight at the argument vector
        let psize = self.data_model.pointer_size() as u64;
        let mut arguments = Vec::with_capacity(self.argc as usize);
        for n in 0..u64::from(self.argc) {
            let Ok(addr) = space.read_ptr(self.argp + n * psize, self.data_model) else {
                break;
            };
            match space.read_string(addr, self.read_limit) {
                Ok(argument) => arguments.push(argument),
                Err(_) => break,
            }
        }
        arguments
    }

    fn environment(&self) -> BTreeMap<String, String> {
        if self.envp == 0 {
            return BTreeMap::new();
        }
        let Ok(space) = AddressSpace::open(self.pid) else {
            return BTreeMap::new();
        };
        space
            .read_string_vector(self.envp, self.data_model, self.read_limit)
            .iter()
            .filter_map(|line| env_entry(line))
            .collect()
    }
}

fn read_i32(buf: &[u8], offset: usize) -> Result<i32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow!("psinfo truncated at offset {offset}"))?;
    Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
}

#[cfg(target_pointer_width = "32")]
fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow!("psinfo truncated at offset {offset}"))?;
    Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
}

#[cfg(target_pointer_width = "64")]
fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| anyhow!("psinfo truncated at offset {offset}"))?;
    Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
}
