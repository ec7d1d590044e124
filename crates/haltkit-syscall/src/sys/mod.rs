//! Per-OS pieces of the object-name query: call numbers, cross-process
//! handle duplication, status classification and name decoding.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::*;

#[cfg(all(windows, target_arch = "x86_64"))]
pub(crate) mod windows;
#[cfg(all(windows, target_arch = "x86_64"))]
pub(crate) use self::windows::*;

/// What one object-name query attempt reported.
#[cfg_attr(
    not(any(target_os = "linux", all(windows, target_arch = "x86_64"))),
    allow(dead_code)
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameStatus {
    /// The name fits; the payload is the number of bytes the call reported.
    Complete(usize),
    Grow,
    AccessDenied,
    Failed(i64),
}

/// A handle valid in the current process. `owned` handles were duplicated
/// for the query and must be closed afterwards.
#[cfg_attr(
    not(any(target_os = "linux", all(windows, target_arch = "x86_64"))),
    allow(dead_code)
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalHandle {
    pub raw: usize,
    pub owned: bool,
}

/// 8-byte aligned output buffer; the Windows name header holds pointers.
#[cfg_attr(
    not(any(target_os = "linux", all(windows, target_arch = "x86_64"))),
    allow(dead_code)
)]
pub(crate) struct NameBuffer {
    words: Vec<u64>,
}

#[cfg_attr(
    not(any(target_os = "linux", all(windows, target_arch = "x86_64"))),
    allow(dead_code)
)]
impl NameBuffer {
    pub fn with_len(bytes: usize) -> Self {
        NameBuffer {
            words: vec![0u64; bytes.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub fn base(&self) -> usize {
        self.words.as_ptr() as usize
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len()) }
    }
}
