//! Deadline-bounded privileged calls and the in-process object-name query
//! built on top of them.
//!
//! A [`NativeSyscallExecutor`] owns one dedicated call thread. A call that
//! does not finish in time leaves that thread behind (terminated where the OS
//! allows it, abandoned otherwise) and the executor builds a fresh one, so a
//! wedged kernel call never stalls the caller for longer than its deadline.

mod executor;
mod frame;
#[cfg(all(windows, target_arch = "x86_64"))]
mod hijack;
mod parked;
mod query;
mod sys;

pub use executor::{
    CallOutcome, CallThread, CallThreadFactory, ExecutorError, NativeSyscallExecutor,
    STATUS_TIMEOUT,
};
pub use frame::{
    SyscallRequest, ThreadSetup, TransferFrame, FRAME_SIZE, MAX_ARGS, MAX_REGISTER_ARGS,
    MAX_STACK_ARGS, NUMBER_OFFSET, REGISTER_ARGS_OFFSET, SETUP_OFFSET, STACK_ARGS_OFFSET,
};
#[cfg(all(windows, target_arch = "x86_64"))]
pub use hijack::{HijackThreads, HijackedThread};
pub use parked::{ParkedThread, ParkedThreads, PrivilegedCall};
#[cfg(target_os = "linux")]
pub use parked::RawSyscall;
#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
pub use query::NativeNameResolver;
pub use query::{
    query_object_name_blocking, DEFAULT_NAME_BUFFER_CEILING, DEFAULT_NATIVE_CALL_TIMEOUT,
};

/// Call-thread backend used by [`NativeSyscallExecutor::new`] on this target.
#[cfg(all(windows, target_arch = "x86_64"))]
pub type PlatformCallThreads = HijackThreads;

#[cfg(target_os = "linux")]
pub type PlatformCallThreads = ParkedThreads<RawSyscall>;

#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
pub fn platform_call_threads() -> Result<PlatformCallThreads, ExecutorError> {
    #[cfg(target_os = "linux")]
    {
        Ok(ParkedThreads::new(RawSyscall))
    }
    #[cfg(all(windows, target_arch = "x86_64"))]
    {
        HijackThreads::new()
    }
}
