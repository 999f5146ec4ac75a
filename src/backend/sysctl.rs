//! Thin wrappers over sysctl(3) for the kernel-info queries the Darwin and
//! FreeBSD backends issue.

use std::io;
use std::ptr;

use libc::c_int;

/// A process list can grow between the size probe and the fetch; retry a
/// bounded number of times on ENOMEM instead of failing the enumeration.
pub(crate) const ENOMEM_RETRIES: usize = 16;

/// Asks the kernel how large the result of `mib` currently is.
pub(crate) fn query_size(mib: &[c_int]) -> io::Result<usize> {
    let mut size = 0usize;
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as u32,
            ptr::null_mut(),
            &mut size,
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

/// Fills `buf` with the result of `mib`, returning the number of bytes the
/// kernel wrote.
pub(crate) fn query_into(mib: &[c_int], buf: &mut [u8]) -> io::Result<usize> {
    let mut size = buf.len();
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as u32,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

/// Size-probes `mib` and fetches its result, retrying while the kernel
/// reports the buffer as too small. `headroom` adds slack to the probed size
/// for processes created in between.
pub(crate) fn query_buffer(mib: &[c_int], headroom: bool) -> io::Result<Vec<u8>> {
    let mut retries = 0;
    loop {
        let mut len = query_size(mib)?;
        if headroom {
            len += len / 10;
        }
        let mut buf = vec![0u8; len];
        match query_into(mib, &mut buf) {
            Ok(written) => {
                buf.truncate(written);
                return Ok(buf);
            }
            Err(err) if err.raw_os_error() == Some(libc::ENOMEM) && retries < ENOMEM_RETRIES => {
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn query_int(mib: &[c_int]) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut size = size_of::<c_int>();
    let rc = unsafe {
        libc::sysctl(
            mib.as_ptr() as *mut c_int,
            mib.len() as u32,
            &mut value as *mut c_int as *mut libc::c_void,
            &mut size,
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}
