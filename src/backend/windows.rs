//! Windows backend.
//!
//! Enumeration uses a ToolHelp snapshot. Windows exposes no usable
//! parent/child relationship for our purposes, so records carry no parent
//! and `kill_tree` is the platform primitive that sweeps descendants (the
//! ToolHelp entries do carry a creator pid, which is what the sweep walks).
//!
//! The command line is a single string in the target's PEB; it is read with
//! positioned `ReadProcessMemory` calls at fixed offsets and re-tokenized
//! with shell-like quoting rules. The environment block lives behind the
//! same process-parameters struct. A target with a different bitness than
//! this program (WOW64) degrades to empty data.

use std::collections::BTreeMap;
use std::io;

use windows::Wdk::System::Threading::{
    NtQueryInformationProcess, PROCESS_BASIC_INFORMATION, ProcessBasicInformation,
};
use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
    PROCESS_VM_READ, TerminateProcess,
};

use crate::backend::PlatformBackend;
use crate::prelude::*;
use crate::snapshot::{Pid, ProcessDetails, ProcessRecord};

// Fixed offsets into the PEB and RTL_USER_PROCESS_PARAMETERS for our own
// data model (same-bitness targets only).
#[cfg(target_pointer_width = "64")]
mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x20;
    pub const COMMAND_LINE: usize = 0x70; // UNICODE_STRING
    pub const ENVIRONMENT: usize = 0x80;
    pub const ENVIRONMENT_SIZE: usize = 0x3F0;
    pub const UNICODE_BUFFER: usize = 0x8;
}
#[cfg(target_pointer_width = "32")]
mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x10;
    pub const COMMAND_LINE: usize = 0x40;
    pub const ENVIRONMENT: usize = 0x48;
    pub const ENVIRONMENT_SIZE: usize = 0x290;
    pub const UNICODE_BUFFER: usize = 0x4;
}

/// Upper bound on the environment block read, in case the size field in the
/// target is corrupt.
const MAX_ENVIRONMENT_BLOCK: usize = 1 << 20;

pub struct WindowsBackend;

impl PlatformBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn enumerate(&self) -> Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();
        for entry in toolhelp_entries().context("Failed to snapshot the process list")? {
            let pid = entry.th32ProcessID as Pid;
            if pid == 0 || pid == 4 {
                // System Idle and System pseudo-processes
                continue;
            }
            let name = utf16_until_nul(&entry.szExeFile);
            records.push(ProcessRecord::new(
                pid,
                None,
                (!name.is_empty()).then_some(name),
                None,
                Box::new(WindowsDetails { pid }),
            ));
        }
        Ok(records)
    }

    fn has_lineage(&self) -> bool {
        false
    }

    fn soft_kill(&self, pid: Pid) -> io::Result<bool> {
        // Only reaches processes sharing our console; failure means there is
        // no graceful primitive for this target and the caller escalates.
        match unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid as u32) } {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("Failed to send a console ctrl event to pid {pid}: {err}");
                Ok(false)
            }
        }
    }

    fn hard_kill(&self, pid: Pid) -> io::Result<()> {
        let Ok(handle) = OwnedHandle::open(pid, PROCESS_TERMINATE) else {
            // already gone (or never ours to kill); both are no-ops
            return Ok(());
        };
        unsafe { TerminateProcess(handle.0, 1) }
            .map_err(|err| io::Error::other(format!("TerminateProcess failed: {err}")))
    }

    fn kill_tree(&self, pid: Pid) -> io::Result<()> {
        let entries = toolhelp_entries()
            .map_err(|err| io::Error::other(format!("kill_tree snapshot failed: {err}")))?;
        let mut stack = vec![pid];
        while let Some(current) = stack.pop() {
            for entry in &entries {
                if entry.th32ParentProcessID as Pid == current {
                    stack.push(entry.th32ProcessID as Pid);
                }
            }
            if let Err(err) = self.hard_kill(current) {
                debug!("Failed to kill pid {current} in the tree sweep: {err}");
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        let Ok(handle) = OwnedHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION) else {
            return false;
        };
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(handle.0, &mut code) }.is_ok()
            && code == STILL_ACTIVE.0 as u32
    }
}

struct WindowsDetails {
    pid: Pid,
}

impl WindowsDetails {
    fn command_line(&self) -> io::Result<String> {
        let handle =
            OwnedHandle::open(self.pid, PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ)?;
        let params = handle.process_parameters()?;

        // UNICODE_STRING: u16 length in bytes, then the buffer pointer
        let length = handle.read_value::<u16>(params + peb::COMMAND_LINE)? as usize;
        let buffer = handle.read_value::<usize>(params + peb::COMMAND_LINE + peb::UNICODE_BUFFER)?;
        if buffer == 0 {
            return Ok(String::new());
        }
        let raw = handle.read_bytes(buffer, length)?;
        Ok(String::from_utf16_lossy(&as_utf16(&raw)))
    }

    fn environment_block(&self) -> io::Result<Vec<String>> {
        let handle =
            OwnedHandle::open(self.pid, PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ)?;
        let params = handle.process_parameters()?;

        let environment = handle.read_value::<usize>(params + peb::ENVIRONMENT)?;
        let size = handle
            .read_value::<usize>(params + peb::ENVIRONMENT_SIZE)?
            .min(MAX_ENVIRONMENT_BLOCK);
        if environment == 0 || size == 0 {
            return Ok(Vec::new());
        }
        let raw = handle.read_bytes(environment, size)?;
        Ok(as_utf16(&raw)
            .split(|&unit| unit == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(String::from_utf16_lossy)
            .collect())
    }
}

impl ProcessDetails for WindowsDetails {
    fn arguments(&self) -> Vec<String> {
        let Ok(command_line) = self.command_line() else {
            return Vec::new();
        };
        // the OS models arguments as one string; approximate the tokenization
        shell_words::split(&command_line)
            .unwrap_or_else(|_| command_line.split_whitespace().map(str::to_string).collect())
    }

    fn environment(&self) -> BTreeMap<String, String> {
        self.environment_block()
            .unwrap_or_default()
            .iter()
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                // drive-letter bookkeeping entries start with '='
                (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .collect()
    }
}

struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn open(
        pid: Pid,
        access: windows::Win32::System::Threading::PROCESS_ACCESS_RIGHTS,
    ) -> io::Result<Self> {
        unsafe { OpenProcess(access, false, pid as u32) }
            .map(Self)
            .map_err(|err| io::Error::other(format!("OpenProcess failed: {err}")))
    }

    fn read_bytes(&self, address: usize, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.0,
                address as *const _,
                buf.as_mut_ptr() as *mut _,
                len,
                Some(&mut read),
            )
        }
        .map_err(|err| io::Error::other(format!("ReadProcessMemory failed: {err}")))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn read_value<T: Copy + Default>(&self, address: usize) -> io::Result<T> {
        let raw = self.read_bytes(address, size_of::<T>())?;
        if raw.len() < size_of::<T>() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut value = T::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                &mut value as *mut T as *mut u8,
                size_of::<T>(),
            );
        }
        Ok(value)
    }

    fn process_parameters(&self) -> io::Result<usize> {
        let mut info = PROCESS_BASIC_INFORMATION::default();
        let status = unsafe {
            NtQueryInformationProcess(
                self.0,
                ProcessBasicInformation,
                &mut info as *mut _ as *mut _,
                size_of::<PROCESS_BASIC_INFORMATION>() as u32,
                std::ptr::null_mut(),
            )
        };
        if status.is_err() {
            return Err(io::Error::other("NtQueryInformationProcess failed"));
        }
        let peb_base = info.PebBaseAddress as usize;
        self.read_value::<usize>(peb_base + peb::PROCESS_PARAMETERS)
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

fn toolhelp_entries() -> Result<Vec<PROCESSENTRY32W>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .context("CreateToolhelp32Snapshot failed")?;
    let snapshot = OwnedHandle(snapshot);

    let mut entries = Vec::new();
    let mut entry = PROCESSENTRY32W {
        dwSize: size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    if unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok() {
        loop {
            entries.push(entry);
            if unsafe { Process32NextW(snapshot.0, &mut entry) }.is_err() {
                break;
            }
        }
    }
    Ok(entries)
}

fn utf16_until_nul(buf: &[u16]) -> String {
    let end = buf.iter().position(|&unit| unit == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

fn as_utf16(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
