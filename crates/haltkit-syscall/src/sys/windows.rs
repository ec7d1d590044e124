use std::ffi::c_void;

use haltkit_contracts::{HandleRecord, ResolveError};
use tracing::trace;
use windows_sys::Win32::Foundation::{CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, OpenProcess, PROCESS_DUP_HANDLE,
    PROCESS_QUERY_INFORMATION,
};

use super::{LocalHandle, NameBuffer, NameStatus};

const OBJECT_NAME_INFORMATION_CLASS: usize = 1;

const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
const STATUS_INFO_LENGTH_MISMATCH: u32 = 0xC000_0004;
const STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;

/// `UNICODE_STRING` header at the start of `OBJECT_NAME_INFORMATION`.
const UNICODE_STRING_HEADER: usize = 16;

#[link(name = "ntdll")]
extern "system" {
    fn NtQueryObject(
        handle: HANDLE,
        class: u32,
        info: *mut c_void,
        info_len: u32,
        return_len: *mut u32,
    ) -> i32;
}

/// Call numbers the query issues through the executor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallNumbers {
    pub query: u32,
    pub close: u32,
}

pub(crate) fn call_numbers() -> Result<CallNumbers, ResolveError> {
    let resolve = |name: &'static [u8]| {
        ntdll_call_number(name).ok_or_else(|| {
            ResolveError::Executor(format!(
                "cannot read call number of {}",
                String::from_utf8_lossy(&name[..name.len() - 1])
            ))
        })
    };
    Ok(CallNumbers {
        query: resolve(b"NtQueryObject\0")?,
        close: resolve(b"NtClose\0")?,
    })
}

/// Reads the call number out of an ntdll export stub, which starts with
/// `mov r10, rcx; mov eax, imm32`. `name` is NUL-terminated.
pub(crate) fn ntdll_call_number(name: &[u8]) -> Option<u32> {
    let module = unsafe { GetModuleHandleA(b"ntdll.dll\0".as_ptr()) };
    if module.is_null() {
        return None;
    }
    let proc = unsafe { GetProcAddress(module, name.as_ptr()) }?;
    let stub = unsafe { std::slice::from_raw_parts(proc as usize as *const u8, 8) };
    if stub[..4] != [0x4c, 0x8b, 0xd1, 0xb8] {
        return None;
    }
    Some(u32::from_le_bytes([stub[4], stub[5], stub[6], stub[7]]))
}

pub(crate) fn current_pid() -> u64 {
    u64::from(unsafe { GetCurrentProcessId() })
}

pub(crate) fn duplicate_into_current(owner_pid: u64, handle: u64) -> Option<LocalHandle> {
    if owner_pid == current_pid() {
        return Some(LocalHandle {
            raw: handle as usize,
            owned: false,
        });
    }
    let pid = u32::try_from(owner_pid).ok()?;
    let process = unsafe { OpenProcess(PROCESS_DUP_HANDLE | PROCESS_QUERY_INFORMATION, 0, pid) };
    if process.is_null() {
        trace!(pid = owner_pid, error = %std::io::Error::last_os_error(), "OpenProcess failed");
        return None;
    }
    let mut local: HANDLE = std::ptr::null_mut();
    let ok = unsafe {
        DuplicateHandle(
            process,
            handle as usize as HANDLE,
            GetCurrentProcess(),
            &mut local,
            0,
            0,
            DUPLICATE_SAME_ACCESS,
        )
    };
    let dup_err = std::io::Error::last_os_error();
    unsafe {
        CloseHandle(process);
    }
    if ok == 0 {
        trace!(pid = owner_pid, handle, error = %dup_err, "DuplicateHandle failed");
        return None;
    }
    Some(LocalHandle {
        raw: local as usize,
        owned: true,
    })
}

/// Memory the query call writes besides the output buffer.
pub(crate) struct QueryScratch {
    return_len: Box<u32>,
}

impl QueryScratch {
    pub fn new(_local: LocalHandle) -> Self {
        QueryScratch {
            return_len: Box::new(0),
        }
    }

    /// `NtQueryObject(handle, ObjectNameInformation, buf, len, &return_len)`.
    pub fn args(&mut self, local: LocalHandle, buf: &mut NameBuffer) -> Vec<usize> {
        vec![
            local.raw,
            OBJECT_NAME_INFORMATION_CLASS,
            buf.as_mut_ptr() as usize,
            buf.len().min(u32::MAX as usize),
            &mut *self.return_len as *mut u32 as usize,
        ]
    }
}

pub(crate) fn classify(raw: isize, buf_len: usize) -> NameStatus {
    let status = raw as u32;
    match status {
        STATUS_BUFFER_OVERFLOW | STATUS_INFO_LENGTH_MISMATCH | STATUS_BUFFER_TOO_SMALL => {
            NameStatus::Grow
        }
        STATUS_ACCESS_DENIED => NameStatus::AccessDenied,
        s if (s as i32) >= 0 => NameStatus::Complete(buf_len),
        s => NameStatus::Failed(i64::from(s as i32)),
    }
}

/// Decodes the `UNICODE_STRING` the query left at the start of `buf`. The
/// string body must lie inside the buffer.
pub(crate) fn decode_name(buf: &NameBuffer, _len: usize) -> Option<String> {
    let bytes = buf.bytes();
    if bytes.len() < UNICODE_STRING_HEADER {
        return None;
    }
    let length = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let mut ptr = [0u8; 8];
    ptr.copy_from_slice(&bytes[8..16]);
    let ptr = u64::from_le_bytes(ptr) as usize;
    if length == 0 || ptr == 0 {
        return None;
    }
    let start = ptr.checked_sub(buf.base())?;
    let body = bytes.get(start..start.checked_add(length)?)?;
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let name = String::from_utf16(&units).ok()?;
    (!name.is_empty()).then_some(name)
}

pub(crate) fn close_direct(local: LocalHandle) {
    if local.owned {
        unsafe {
            CloseHandle(local.raw as HANDLE);
        }
    }
}

pub(crate) fn query_blocking(record: &HandleRecord) -> Result<Option<String>, ResolveError> {
    let Some(local) = duplicate_into_current(record.owner_pid, record.handle_value) else {
        return Ok(None);
    };
    let result = query_direct(local, record);
    close_direct(local);
    result
}

fn query_direct(local: LocalHandle, record: &HandleRecord) -> Result<Option<String>, ResolveError> {
    let ceiling = crate::DEFAULT_NAME_BUFFER_CEILING;
    let mut len = crate::query::INITIAL_NAME_BUFFER;
    loop {
        let mut buf = NameBuffer::with_len(len);
        let mut return_len = 0u32;
        let status = unsafe {
            NtQueryObject(
                local.raw as HANDLE,
                OBJECT_NAME_INFORMATION_CLASS as u32,
                buf.as_mut_ptr().cast(),
                buf.len().min(u32::MAX as usize) as u32,
                &mut return_len,
            )
        };
        match classify(status as isize, buf.len()) {
            NameStatus::Complete(n) => return Ok(decode_name(&buf, n)),
            NameStatus::Grow => {
                len = len.saturating_mul(2).max(return_len as usize);
                if len > ceiling {
                    return Err(ResolveError::ResourceExhaustion {
                        requested: len,
                        ceiling,
                    });
                }
            }
            NameStatus::AccessDenied => {
                return Err(ResolveError::AccessDenied {
                    owner_pid: record.owner_pid,
                    handle_value: record.handle_value,
                })
            }
            NameStatus::Failed(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_nt_statuses() {
        assert_eq!(classify(0, 64), NameStatus::Complete(64));
        assert_eq!(classify(0x8000_0005u32 as i32 as isize, 64), NameStatus::Grow);
        assert_eq!(classify(0xC000_0004u32 as i32 as isize, 64), NameStatus::Grow);
        assert_eq!(
            classify(0xC000_0022u32 as i32 as isize, 64),
            NameStatus::AccessDenied
        );
        assert!(matches!(
            classify(0xC000_0008u32 as i32 as isize, 64),
            NameStatus::Failed(_)
        ));
    }

    #[test]
    fn ntdll_stubs_yield_call_numbers() {
        assert!(ntdll_call_number(b"NtClose\0").is_some());
        assert!(ntdll_call_number(b"NtQueryObject\0").is_some());
    }
}
