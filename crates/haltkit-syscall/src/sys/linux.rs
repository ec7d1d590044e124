use std::ffi::CString;
use std::path::PathBuf;

use haltkit_contracts::{HandleRecord, ResolveError};
use tracing::trace;

use super::{LocalHandle, NameBuffer, NameStatus};

/// Call numbers the query issues through the executor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallNumbers {
    pub query: u32,
    pub close: u32,
}

pub(crate) fn call_numbers() -> Result<CallNumbers, ResolveError> {
    Ok(CallNumbers {
        query: libc::SYS_readlinkat as u32,
        close: libc::SYS_close as u32,
    })
}

pub(crate) fn current_pid() -> u64 {
    u64::from(std::process::id())
}

/// Makes `handle` of `owner_pid` usable here. Another process's descriptor is
/// copied with `pidfd_getfd`, which needs ptrace access to the owner.
pub(crate) fn duplicate_into_current(owner_pid: u64, handle: u64) -> Option<LocalHandle> {
    let fd = i32::try_from(handle).ok()?;
    if owner_pid == current_pid() {
        return Some(LocalHandle {
            raw: fd as usize,
            owned: false,
        });
    }
    let pid = i32::try_from(owner_pid).ok()?;

    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if pidfd < 0 {
        trace!(
            pid = owner_pid,
            error = %std::io::Error::last_os_error(),
            "pidfd_open failed"
        );
        return None;
    }
    let local = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd as i32, fd, 0) };
    let getfd_err = std::io::Error::last_os_error();
    unsafe {
        libc::close(pidfd as i32);
    }
    if local < 0 {
        trace!(pid = owner_pid, handle, error = %getfd_err, "pidfd_getfd failed");
        return None;
    }
    Some(LocalHandle {
        raw: local as usize,
        owned: true,
    })
}

/// Memory the query call reads besides the output buffer.
pub(crate) struct QueryScratch {
    path: CString,
}

impl QueryScratch {
    pub fn new(local: LocalHandle) -> Self {
        let path = format!("/proc/self/fd/{}", local.raw);
        QueryScratch {
            // A formatted integer path never holds a NUL.
            path: CString::new(path).unwrap_or_default(),
        }
    }

    /// `readlinkat(AT_FDCWD, path, buf, len)`.
    pub fn args(&mut self, _local: LocalHandle, buf: &mut NameBuffer) -> Vec<usize> {
        vec![
            libc::AT_FDCWD as isize as usize,
            self.path.as_ptr() as usize,
            buf.as_mut_ptr() as usize,
            buf.len(),
        ]
    }
}

pub(crate) fn classify(raw: isize, buf_len: usize) -> NameStatus {
    if raw < 0 {
        let errno = -raw;
        if errno == libc::EACCES as isize || errno == libc::EPERM as isize {
            return NameStatus::AccessDenied;
        }
        return NameStatus::Failed(raw as i64);
    }
    let len = raw as usize;
    // readlink truncates silently; a full buffer may have been cut short.
    if len >= buf_len {
        NameStatus::Grow
    } else {
        NameStatus::Complete(len)
    }
}

pub(crate) fn decode_name(buf: &NameBuffer, len: usize) -> Option<String> {
    let bytes = buf.bytes().get(..len)?;
    let name = std::str::from_utf8(bytes).ok()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Closes a handle without going through the executor.
pub(crate) fn close_direct(local: LocalHandle) {
    if local.owned {
        unsafe {
            libc::close(local.raw as i32);
        }
    }
}

pub(crate) fn query_blocking(record: &HandleRecord) -> Result<Option<String>, ResolveError> {
    let path = if record.owner_pid == current_pid() {
        PathBuf::from(format!("/proc/self/fd/{}", record.handle_value))
    } else {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            record.owner_pid, record.handle_value
        ))
    };
    match std::fs::read_link(&path) {
        Ok(target) => match target.into_os_string().into_string() {
            Ok(name) if !name.is_empty() => Ok(Some(name)),
            _ => Ok(None),
        },
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(ResolveError::AccessDenied {
                owner_pid: record.owner_pid,
                handle_value: record.handle_value,
            })
        }
        Err(err) => {
            trace!(path = %path.display(), error = %err, "readlink failed");
            Ok(None)
        }
    }
}
