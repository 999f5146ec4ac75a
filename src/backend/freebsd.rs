//! FreeBSD backend based on sysctl(3).
//!
//! Enumeration walks the fixed-stride kinfo_proc array from `kern.proc.all`
//! (stride and offsets chosen by this process's data model). Per-pid argv
//! and environment are separate queries returning plain NUL-separated
//! strings.

use std::collections::BTreeMap;
use std::io;

use libc::c_int;

use crate::backend::{PlatformBackend, sysctl, unix};
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessDetails, ProcessRecord};

const CTL_KERN: c_int = 1;
const KERN_ARGMAX: c_int = 8;
const KERN_PROC: c_int = 14;
const KERN_PROC_ALL: c_int = 0;
const KERN_PROC_ARGS: c_int = 7;
const KERN_PROC_ENV: c_int = 35;

#[cfg(target_pointer_width = "64")]
mod kinfo {
    pub const SIZE: usize = 1088;
    pub const PID_OFFSET: usize = 72;
    pub const PPID_OFFSET: usize = 76;
}
#[cfg(target_pointer_width = "32")]
mod kinfo {
    pub const SIZE: usize = 768;
    pub const PID_OFFSET: usize = 40;
    pub const PPID_OFFSET: usize = 44;
}

pub struct FreeBsdBackend;

impl PlatformBackend for FreeBsdBackend {
    fn name(&self) -> &'static str {
        "freebsd"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let buf = sysctl::query_buffer(&[CTL_KERN, KERN_PROC, KERN_PROC_ALL], true)
            .context("Failed to query kern.proc.all")?;

        let mut records = Vec::new();
        let mut base = 0;
        while base + kinfo::SIZE <= buf.len() {
            let pid = read_i32(&buf, base + kinfo::PID_OFFSET);
            let ppid = read_i32(&buf, base + kinfo::PPID_OFFSET);
            records.push(ProcessRecord::new(
                pid,
                (ppid > 0).then_some(ppid),
                None,
                None,
                Box::new(FreeBsdDetails { pid }),
            ));
            base += kinfo::SIZE;
        }
        debug!("Found {} processes", records.len());
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

struct FreeBsdDetails {
    pid: Pid,
}

impl FreeBsdDetails {
    fn query_strings(&self, what: c_int) -> io::Result<Vec<String>> {
        let argmax = sysctl::query_int(&[CTL_KERN, KERN_ARGMAX])? as usize;
        let mut buf = vec![0u8; argmax];
        let written = sysctl::query_into(&[CTL_KERN, KERN_PROC, what, self.pid], &mut buf)?;
        buf.truncate(written);
        Ok(buf
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect())
    }
}

impl ProcessDetails for FreeBsdDetails {
    fn arguments(&self) -> Vec<String> {
        // insufficient permission yields empty data, not an error
        self.query_strings(KERN_PROC_ARGS).unwrap_or_default()
    }

    fn environment(&self) -> BTreeMap<String, String> {
        self.query_strings(KERN_PROC_ENV)
            .unwrap_or_default()
            .iter()
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    buf.get(offset..offset + 4)
        .map(|bytes| i32::from_ne_bytes(bytes.try_into().unwrap()))
        .unwrap_or(0)
}
