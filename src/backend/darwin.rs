//! Darwin backend based on sysctl(3); macOS has no procfs.
//!
//! `kern.proc.all` returns an array of kinfo_proc structs whose stride and
//! pid/ppid offsets depend on this process's own data model. Per-pid argv
//! and environment come from `kern.procargs2`, which packs argc, the exec
//! path and NUL-separated argument/environment strings into one buffer (the
//! layout `ps` itself parses).

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
const KERN_PROCARGS2: c_int = 49;

#[cfg(target_pointer_width = "64")]
mod kinfo {
    pub const SIZE: usize = 648;
    pub const PID_OFFSET: usize = 40;
    pub const PPID_OFFSET: usize = 560;
}
#[cfg(target_pointer_width = "32")]
mod kinfo {
    pub const SIZE: usize = 492;
    pub const PID_OFFSET: usize = 24;
    pub const PPID_OFFSET: usize = 416;
}

pub struct DarwinBackend;

impl PlatformBackend for DarwinBackend {
    fn name(&self) -> &'static str {
        "darwin"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let buf = sysctl::query_buffer(&[CTL_KERN, KERN_PROC, KERN_PROC_ALL], false)
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
                Box::new(DarwinDetails { pid }),
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

struct DarwinDetails {
    pid: Pid,
}

impl DarwinDetails {
    fn parse(&self) -> io::Result<(Vec<String>, BTreeMap<String, String>)> {
        let argmax = sysctl::query_int(&[CTL_KERN, KERN_ARGMAX])? as usize;
        let mut buf = vec![0u8; argmax];
        let written = sysctl::query_into(&[CTL_KERN, KERN_PROCARGS2, self.pid], &mut buf)?;
        buf.truncate(written);

        let mut reader = ProcArgs::new(&buf);
        let argc = reader.read_int();
        let _exec_path = reader.read_string();
        reader.skip_nuls();

        let mut arguments = Vec::new();
        for _ in 0..argc {
            arguments.push(reader.read_string());
        }

        let mut environment = BTreeMap::new();
        while reader.peek() != 0 {
            let line = reader.read_string();
            if let Some((key, value)) = line.split_once('=') {
                environment.insert(key.to_string(), value.to_string());
            }
        }
        Ok((arguments, environment))
    }
}

impl ProcessDetails for DarwinDetails {
    fn arguments(&self) -> Vec<String> {
        // insufficient permission yields empty data, not an error
        self.parse().map(|(arguments, _)| arguments).unwrap_or_default()
    }

    fn environment(&self) -> BTreeMap<String, String> {
        self.parse()
            .map(|(_, environment)| environment)
            .unwrap_or_default()
    }
}

/// Bounds-checked cursor over the procargs2 buffer; reads past the end
/// produce zeroes/empty strings rather than panics.
struct ProcArgs<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ProcArgs<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn read_int(&mut self) -> i32 {
        let Some(bytes) = self.buf.get(self.offset..self.offset + 4) else {
            return 0;
        };
        self.offset += 4;
        i32::from_ne_bytes(bytes.try_into().unwrap())
    }

    fn peek(&self) -> u8 {
        self.buf.get(self.offset).copied().unwrap_or(0)
    }

    fn read_string(&mut self) -> String {
        let start = self.offset;
        while self.offset < self.buf.len() && self.buf[self.offset] != 0 {
            self.offset += 1;
        }
        let string = String::from_utf8_lossy(&self.buf[start..self.offset]).into_owned();
        if self.offset < self.buf.len() {
            self.offset += 1; // consume the terminator
        }
        string
    }

    fn skip_nuls(&mut self) {
        while self.offset < self.buf.len() && self.buf[self.offset] == 0 {
            self.offset += 1;
        }
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    buf.get(offset..offset + 4)
        .map(|bytes| i32::from_ne_bytes(bytes.try_into().unwrap()))
        .unwrap_or(0)
}
