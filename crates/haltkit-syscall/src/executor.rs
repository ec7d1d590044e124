use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::frame::SyscallRequest;

/// Raw value reported for a call that missed its deadline.
pub const STATUS_TIMEOUT: isize = 0x102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed(isize),
    TimedOut,
}

impl CallOutcome {
    pub fn raw(self) -> isize {
        match self {
            CallOutcome::Completed(raw) => raw,
            CallOutcome::TimedOut => STATUS_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum ExecutorError {
    TooManyArguments {
        count: usize,
        max: usize,
    },
    Os {
        op: &'static str,
        source: std::io::Error,
    },
    Setup(String),
    /// The call thread went away without being asked to.
    ThreadLost,
    /// A previous fatal failure shut the executor down.
    Terminated,
}

impl ExecutorError {
    pub(crate) fn last_os(op: &'static str) -> Self {
        ExecutorError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::TooManyArguments { count, max } => {
                write!(f, "{count} call arguments given, at most {max} supported")
            }
            ExecutorError::Os { op, source } => write!(f, "{op}: {source}"),
            ExecutorError::Setup(why) => write!(f, "call thread setup: {why}"),
            ExecutorError::ThreadLost => f.write_str("call thread exited unexpectedly"),
            ExecutorError::Terminated => f.write_str("executor was shut down by an earlier failure"),
        }
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecutorError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExecutorError> for haltkit_contracts::ResolveError {
    fn from(err: ExecutorError) -> Self {
        haltkit_contracts::ResolveError::Executor(err.to_string())
    }
}

/// One parked thread able to run privileged calls out of its transfer frame.
pub trait CallThread: Send {
    /// Stores `request` in the frame, resumes the thread and waits up to
    /// `timeout` for it to park again. `Ok(None)` means the deadline passed
    /// and the thread has to be terminated.
    fn call(
        &mut self,
        request: &SyscallRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, ExecutorError>;

    fn terminate(self) -> Result<(), ExecutorError>;

    fn id(&self) -> u64;
}

pub trait CallThreadFactory: Send {
    type Thread: CallThread;

    fn spawn(&self) -> Result<Self::Thread, ExecutorError>;
}

/// Runs one privileged call at a time under a wall-clock deadline.
///
/// Single flight is enforced by `&mut self`. On a missed deadline the call
/// thread is torn down and rebuilt before `run_syscall` returns, so the next
/// call starts on a clean thread and frame.
pub struct NativeSyscallExecutor<F: CallThreadFactory> {
    factory: F,
    thread: Option<F::Thread>,
    generation: u64,
}

#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
impl NativeSyscallExecutor<crate::PlatformCallThreads> {
    pub fn new() -> Result<Self, ExecutorError> {
        Self::with_factory(crate::platform_call_threads()?)
    }
}

impl<F: CallThreadFactory> NativeSyscallExecutor<F> {
    pub fn with_factory(factory: F) -> Result<Self, ExecutorError> {
        let thread = factory.spawn()?;
        trace!(thread = thread.id(), "call thread parked");
        Ok(NativeSyscallExecutor {
            factory,
            thread: Some(thread),
            generation: 0,
        })
    }

    /// Number of times the call thread has been rebuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn run_syscall(
        &mut self,
        timeout: Duration,
        number: u32,
        args: &[usize],
    ) -> Result<CallOutcome, ExecutorError> {
        let request = SyscallRequest::new(number, args)?;
        let thread = self.thread.as_mut().ok_or(ExecutorError::Terminated)?;

        match thread.call(&request, timeout) {
            Ok(Some(raw)) => Ok(CallOutcome::Completed(raw as i64 as isize)),
            Ok(None) => {
                debug!(
                    thread = thread.id(),
                    number,
                    timeout_ms = timeout.as_millis() as u64,
                    "privileged call missed its deadline, replacing call thread"
                );
                self.replace_thread()?;
                Ok(CallOutcome::TimedOut)
            }
            Err(err) => {
                warn!(error = %err, "call thread failed, shutting executor down");
                self.shutdown();
                Err(err)
            }
        }
    }

    /// Throws the current thread away and parks a fresh one.
    pub fn restart(&mut self) -> Result<(), ExecutorError> {
        self.replace_thread()
    }

    fn replace_thread(&mut self) -> Result<(), ExecutorError> {
        if let Some(old) = self.thread.take() {
            if let Err(err) = old.terminate() {
                self.shutdown();
                return Err(err);
            }
        }
        let thread = self.factory.spawn()?;
        self.generation += 1;
        trace!(
            thread = thread.id(),
            generation = self.generation,
            "replacement call thread parked"
        );
        self.thread = Some(thread);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.terminate();
        }
    }
}

impl<F: CallThreadFactory> Drop for NativeSyscallExecutor<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ParkedThreads, PrivilegedCall, MAX_ARGS};
    use std::time::Instant;

    const ADD: u32 = 1;
    const SLEEP_MS: u32 = 2;

    struct MockCall;

    impl PrivilegedCall for MockCall {
        fn invoke(&self, number: u32, args: &[u64; MAX_ARGS]) -> i64 {
            match number {
                ADD => args.iter().sum::<u64>() as i64,
                SLEEP_MS => {
                    std::thread::sleep(Duration::from_millis(args[0]));
                    0
                }
                _ => -38,
            }
        }
    }

    fn mock_threads() -> ParkedThreads<MockCall> {
        ParkedThreads::new(MockCall)
    }

    #[test]
    fn completed_call_returns_the_raw_result() {
        let mut exec = NativeSyscallExecutor::with_factory(mock_threads()).unwrap();
        let out = exec
            .run_syscall(Duration::from_secs(5), ADD, &[1, 2, 3, 4, 5, 6])
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(21));
        assert_eq!(exec.generation(), 0);
    }

    #[test]
    fn timeout_rebuilds_the_thread_and_next_call_succeeds() {
        let mut exec = NativeSyscallExecutor::with_factory(mock_threads()).unwrap();

        let started = Instant::now();
        let out = exec
            .run_syscall(Duration::from_millis(50), SLEEP_MS, &[5_000])
            .unwrap();
        assert_eq!(out, CallOutcome::TimedOut);
        assert_eq!(out.raw(), STATUS_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(exec.generation(), 1);

        let out = exec
            .run_syscall(Duration::from_secs(5), ADD, &[40, 2])
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(42));
    }

    #[test]
    fn too_many_arguments_leaves_executor_usable() {
        let mut exec = NativeSyscallExecutor::with_factory(mock_threads()).unwrap();
        let err = exec
            .run_syscall(Duration::from_secs(1), ADD, &[1; MAX_ARGS + 1])
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TooManyArguments { .. }));
        let out = exec
            .run_syscall(Duration::from_secs(5), ADD, &[1; MAX_ARGS])
            .unwrap();
        assert_eq!(out, CallOutcome::Completed(MAX_ARGS as isize));
    }

    #[test]
    fn restart_replaces_an_idle_thread() {
        let mut exec = NativeSyscallExecutor::with_factory(mock_threads()).unwrap();
        exec.restart().unwrap();
        exec.restart().unwrap();
        assert_eq!(exec.generation(), 2);
        let out = exec.run_syscall(Duration::from_secs(5), ADD, &[]).unwrap();
        assert_eq!(out, CallOutcome::Completed(0));
    }
}
