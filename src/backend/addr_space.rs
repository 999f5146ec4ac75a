//! Positioned reads into another process's virtual address space via
//! `/proc/<pid>/as`.
//!
//! All length checks happen before any read: a string fetch gives up once it
//! has consumed the configured byte limit without finding a terminator, so a
//! corrupt pointer cannot make us crawl the whole address space. Offsets are
//! full u64 addresses (a 64-bit target's stack lives beyond `i64::MAX`,
//! which is why this uses positioned reads instead of seeking).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::snapshot::{DataModel, Pid};

const CHUNK: usize = 256;

pub(crate) struct AddressSpace {
    file: File,
}

impl AddressSpace {
    pub fn open(pid: Pid) -> io::Result<Self> {
        let path: PathBuf = format!("/proc/{pid}/as").into();
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// Reads one pointer-sized word at `addr`, widened to u64 according to
    /// the target's data model (not ours).
    pub fn read_ptr(&self, addr: u64, model: DataModel) -> io::Result<u64> {
        match model {
            DataModel::Bits32 => {
                let mut buf = [0u8; 4];
                self.file.read_exact_at(&mut buf, addr)?;
                Ok(u64::from(u32::from_ne_bytes(buf)))
            }
            DataModel::Bits64 => {
                let mut buf = [0u8; 8];
                self.file.read_exact_at(&mut buf, addr)?;
                Ok(u64::from_ne_bytes(buf))
            }
        }
    }

    /// Reads a NUL-terminated string starting at `addr`, up to `limit`
    /// bytes.
    pub fn read_string(&self, addr: u64, limit: usize) -> io::Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; CHUNK];
        loop {
            let remaining = limit.saturating_sub(out.len());
            if remaining == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no string terminator within the read limit",
                ));
            }
            let want = remaining.min(CHUNK);
            let read = self.file.read_at(&mut chunk[..want], addr + out.len() as u64)?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            match chunk[..read].iter().position(|&b| b == 0) {
                Some(nul) => {
                    out.extend_from_slice(&chunk[..nul]);
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                None => out.extend_from_slice(&chunk[..read]),
            }
        }
    }

    /// Walks a NUL-terminated pointer vector at `vector`, reading the string
    /// behind each entry. Returns what was collected so far if a read fails
    /// partway.
    pub fn read_string_vector(
        &self,
        vector: u64,
        model: DataModel,
        limit: usize,
    ) -> Vec<String> {
        let mut strings = Vec::new();
        let psize = model.pointer_size() as u64;
        for n in 0.. {
            let addr = match self.read_ptr(vector + n * psize, model) {
                Ok(0) => break,
                Ok(addr) => addr,
                Err(_) => break,
            };
            match self.read_string(addr, limit) {
                Ok(string) => strings.push(string),
                Err(_) => break,
            }
        }
        strings
    }
}

/// Splits `NAME=value` lines into a map entry; lines without `=` are
/// dropped.
pub(crate) fn env_entry(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    Some((key.to_string(), value.to_string()))
}
