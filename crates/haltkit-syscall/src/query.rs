//! Object-name lookup: the deadline-bounded path that runs the kernel query
//! through a [`NativeSyscallExecutor`], and the ordinary blocking query the
//! helper program uses.

use std::time::Duration;

use haltkit_contracts::{HandleRecord, ResolveError};

pub const DEFAULT_NATIVE_CALL_TIMEOUT: Duration = Duration::from_millis(1);
pub const DEFAULT_NAME_BUFFER_CEILING: usize = 256 * 1024 * 1024;

#[cfg_attr(
    not(any(target_os = "linux", all(windows, target_arch = "x86_64"))),
    allow(dead_code)
)]
pub(crate) const INITIAL_NAME_BUFFER: usize = 1024;

/// Unbounded object-name query for `record`. May block for as long as the
/// kernel does; only call it where a hang is survivable.
pub fn query_object_name_blocking(record: &HandleRecord) -> Result<Option<String>, ResolveError> {
    #[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
    {
        crate::sys::query_blocking(record)
    }
    #[cfg(not(any(target_os = "linux", all(windows, target_arch = "x86_64"))))]
    {
        let _ = record;
        Err(ResolveError::Unsupported("object name query"))
    }
}

#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
pub use native::NativeNameResolver;

#[cfg(any(target_os = "linux", all(windows, target_arch = "x86_64")))]
mod native {
    use std::sync::{Condvar, Mutex, MutexGuard};
    use std::time::{Duration, Instant};

    use haltkit_contracts::{HandleRecord, NameResolver, ResolveError};
    use tracing::{debug, trace, warn};

    use super::{DEFAULT_NAME_BUFFER_CEILING, DEFAULT_NATIVE_CALL_TIMEOUT, INITIAL_NAME_BUFFER};
    use crate::executor::{CallOutcome, CallThreadFactory, ExecutorError, NativeSyscallExecutor};
    use crate::sys::{self, CallNumbers, LocalHandle, NameBuffer, NameStatus, QueryScratch};
    use crate::PlatformCallThreads;

    type FactoryFn<F> = dyn Fn() -> Result<F, ExecutorError> + Send + Sync;

    struct Engine<F: CallThreadFactory> {
        executor: NativeSyscallExecutor<F>,
        numbers: CallNumbers,
    }

    /// Turnstile in front of the engine: a lookup waits for its turn only
    /// until its own deadline.
    struct Gate {
        busy: Mutex<bool>,
        freed: Condvar,
    }

    impl Gate {
        fn enter(&self, deadline: Instant) -> bool {
            let busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (mut busy, _) = self
                .freed
                .wait_timeout_while(busy, remaining, |busy| *busy)
                .unwrap_or_else(|e| e.into_inner());
            if *busy {
                return false;
            }
            *busy = true;
            true
        }

        fn leave(&self) {
            *self.busy.lock().unwrap_or_else(|e| e.into_inner()) = false;
            self.freed.notify_one();
        }
    }

    struct Turn<'a> {
        gate: &'a Gate,
    }

    impl Drop for Turn<'_> {
        fn drop(&mut self) {
            self.gate.leave();
        }
    }

    /// In-process [`NameResolver`]: every kernel call goes through one
    /// executor, so no lookup holds the caller past its deadline.
    ///
    /// Lookups take turns on the executor; waiting for a turn counts against
    /// the lookup's timeout.
    pub struct NativeNameResolver<F: CallThreadFactory = PlatformCallThreads> {
        factory: Box<FactoryFn<F>>,
        engine: Mutex<Option<Engine<F>>>,
        gate: Gate,
        call_timeout: Duration,
        buffer_ceiling: usize,
    }

    impl NativeNameResolver<PlatformCallThreads> {
        pub fn new() -> Self {
            Self::with_factory(crate::platform_call_threads)
        }
    }

    impl Default for NativeNameResolver<PlatformCallThreads> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<F: CallThreadFactory> NativeNameResolver<F> {
        /// Resolver whose executor threads come from `factory`; it is invoked
        /// again on every `start`.
        pub fn with_factory(
            factory: impl Fn() -> Result<F, ExecutorError> + Send + Sync + 'static,
        ) -> Self {
            NativeNameResolver {
                factory: Box::new(factory),
                engine: Mutex::new(None),
                gate: Gate {
                    busy: Mutex::new(false),
                    freed: Condvar::new(),
                },
                call_timeout: DEFAULT_NATIVE_CALL_TIMEOUT,
                buffer_ceiling: DEFAULT_NAME_BUFFER_CEILING,
            }
        }

        /// Upper bound for each individual kernel call.
        pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
            self.call_timeout = timeout;
            self
        }

        pub fn with_buffer_ceiling(mut self, bytes: usize) -> Self {
            self.buffer_ceiling = bytes.max(8);
            self
        }

        /// Call-thread generation of the current executor, if started.
        pub fn executor_generation(&self) -> Option<u64> {
            self.lock().ok()?.as_ref().map(|e| e.executor.generation())
        }

        fn lock(&self) -> Result<MutexGuard<'_, Option<Engine<F>>>, ResolveError> {
            self.engine
                .lock()
                .map_err(|_| ResolveError::Executor("name resolver lock poisoned".to_string()))
        }

        fn query(
            &self,
            engine: &mut Engine<F>,
            local: LocalHandle,
            record: &HandleRecord,
            deadline: Instant,
        ) -> Result<Option<String>, ResolveError> {
            let mut len = INITIAL_NAME_BUFFER.min(self.buffer_ceiling);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                let mut buf = NameBuffer::with_len(len);
                let mut scratch = QueryScratch::new(local);
                let args = scratch.args(local, &mut buf);
                let outcome = engine.executor.run_syscall(
                    self.call_timeout.min(remaining),
                    engine.numbers.query,
                    &args,
                )?;
                let raw = match outcome {
                    CallOutcome::Completed(raw) => raw,
                    CallOutcome::TimedOut => {
                        // The abandoned call may still write into these.
                        std::mem::forget(buf);
                        std::mem::forget(scratch);
                        trace!(
                            pid = record.owner_pid,
                            handle = record.handle_value,
                            "object name query timed out"
                        );
                        return Ok(None);
                    }
                };
                match sys::classify(raw, buf.len()) {
                    NameStatus::Complete(n) => return Ok(sys::decode_name(&buf, n)),
                    NameStatus::Grow => {
                        let next = buf.len().saturating_mul(2);
                        if next > self.buffer_ceiling {
                            return Err(ResolveError::ResourceExhaustion {
                                requested: next,
                                ceiling: self.buffer_ceiling,
                            });
                        }
                        len = next;
                    }
                    NameStatus::AccessDenied => {
                        return Err(ResolveError::AccessDenied {
                            owner_pid: record.owner_pid,
                            handle_value: record.handle_value,
                        })
                    }
                    NameStatus::Failed(status) => {
                        trace!(
                            pid = record.owner_pid,
                            handle = record.handle_value,
                            status,
                            "object name query failed"
                        );
                        return Ok(None);
                    }
                }
            }
        }

        fn close(
            &self,
            engine: &mut Engine<F>,
            local: LocalHandle,
            deadline: Instant,
        ) -> Result<(), ResolveError> {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = engine.executor.run_syscall(
                self.call_timeout
                    .min(remaining)
                    .max(DEFAULT_NATIVE_CALL_TIMEOUT),
                engine.numbers.close,
                &[local.raw],
            )?;
            if outcome == CallOutcome::TimedOut {
                debug!(handle = local.raw, "closing duplicated handle timed out");
            }
            Ok(())
        }
    }

    impl<F: CallThreadFactory> NameResolver for NativeNameResolver<F> {
        fn start(&self) -> Result<(), ResolveError> {
            let numbers = sys::call_numbers()?;
            let executor = NativeSyscallExecutor::with_factory((self.factory)()?)?;
            let mut guard = self.lock()?;
            // The old executor, if any, is dropped here and its thread torn down.
            *guard = Some(Engine { executor, numbers });
            debug!(
                call_timeout_us = self.call_timeout.as_micros() as u64,
                "native name resolver started"
            );
            Ok(())
        }

        fn get_name(
            &self,
            record: &HandleRecord,
            timeout: Duration,
        ) -> Result<Option<String>, ResolveError> {
            let deadline = Instant::now() + timeout;
            if !self.gate.enter(deadline) {
                trace!("executor still busy at the lookup deadline");
                return Ok(None);
            }
            let _turn = Turn { gate: &self.gate };
            let mut guard = self.lock()?;
            let Some(engine) = guard.as_mut() else {
                return Err(ResolveError::Executor(
                    "native name resolver not started".to_string(),
                ));
            };

            let Some(local) = sys::duplicate_into_current(record.owner_pid, record.handle_value)
            else {
                return Ok(None);
            };

            let result = self.query(engine, local, record, deadline);
            if matches!(result, Err(ResolveError::Executor(_))) {
                warn!("executor failed, native name resolver needs a restart");
                sys::close_direct(local);
                *guard = None;
                return result;
            }
            if local.owned {
                if let Err(err) = self.close(engine, local, deadline) {
                    *guard = None;
                    return Err(err);
                }
            }
            result
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::{ParkedThreads, PrivilegedCall, RawSyscall, MAX_ARGS};
    use haltkit_contracts::NameResolver;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn self_record(fd: i32) -> HandleRecord {
        HandleRecord::new(u64::from(std::process::id()), fd as u64)
    }

    fn started(resolver: NativeNameResolver) -> NativeNameResolver {
        resolver.start().unwrap();
        resolver
    }

    #[test]
    fn native_query_matches_blocking_query() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        let resolver = started(NativeNameResolver::new().with_call_timeout(Duration::from_secs(1)));

        let native = resolver
            .get_name(&self_record(fd), Duration::from_secs(5))
            .unwrap();
        let blocking = query_object_name_blocking(&self_record(fd)).unwrap();
        let expected = std::fs::read_link(format!("/proc/self/fd/{fd}")).unwrap();

        assert_eq!(native.as_deref(), expected.to_str());
        assert_eq!(native, blocking);
    }

    #[test]
    fn unknown_descriptor_has_no_name() {
        let resolver = started(NativeNameResolver::new().with_call_timeout(Duration::from_secs(1)));
        let got = resolver
            .get_name(&self_record(1_000_000), Duration::from_secs(5))
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(query_object_name_blocking(&self_record(1_000_000)).unwrap(), None);
    }

    #[test]
    fn name_longer_than_the_ceiling_is_exhaustion() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        let resolver = started(
            NativeNameResolver::new()
                .with_call_timeout(Duration::from_secs(1))
                .with_buffer_ceiling(8),
        );
        let err = resolver
            .get_name(&self_record(fd), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::ResourceExhaustion {
                requested: 16,
                ceiling: 8
            }
        );
    }

    #[test]
    fn get_name_before_start_is_an_error() {
        let resolver = NativeNameResolver::new();
        let err = resolver
            .get_name(&self_record(0), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Executor(_)), "{err}");
    }

    /// Stalls the first call it sees, then behaves like the raw syscall.
    struct StallOnce {
        stalled: Arc<AtomicBool>,
    }

    impl PrivilegedCall for StallOnce {
        fn invoke(&self, number: u32, args: &[u64; MAX_ARGS]) -> i64 {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            }
            RawSyscall.invoke(number, args)
        }
    }

    #[test]
    fn stalled_query_gives_no_name_in_time_and_next_lookup_works() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        let stalled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stalled);
        let resolver = NativeNameResolver::with_factory(move || {
            Ok(ParkedThreads::new(StallOnce {
                stalled: Arc::clone(&flag),
            }))
        })
        .with_call_timeout(Duration::from_millis(50));
        resolver.start().unwrap();

        let began = Instant::now();
        let first = resolver
            .get_name(&self_record(fd), Duration::from_millis(100))
            .unwrap();
        assert_eq!(first, None);
        assert!(began.elapsed() < Duration::from_millis(400));
        assert_eq!(resolver.executor_generation(), Some(1));

        let resolver = resolver.with_call_timeout(Duration::from_secs(1));
        let second = resolver
            .get_name(&self_record(fd), Duration::from_secs(5))
            .unwrap();
        let expected = std::fs::read_link(format!("/proc/self/fd/{fd}")).unwrap();
        assert_eq!(second.as_deref(), expected.to_str());
    }

    /// Sleeps through every call, then behaves like the raw syscall.
    struct Sluggish(Duration);

    impl PrivilegedCall for Sluggish {
        fn invoke(&self, number: u32, args: &[u64; MAX_ARGS]) -> i64 {
            std::thread::sleep(self.0);
            RawSyscall.invoke(number, args)
        }
    }

    #[test]
    fn waiting_behind_another_lookup_counts_against_the_timeout() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        let resolver = NativeNameResolver::with_factory(|| {
            Ok(ParkedThreads::new(Sluggish(Duration::from_millis(300))))
        })
        .with_call_timeout(Duration::from_secs(2));
        resolver.start().unwrap();

        let (slow, quick) = std::thread::scope(|scope| {
            let slow = scope.spawn(|| resolver.get_name(&self_record(fd), Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(20));
            let began = Instant::now();
            let quick = resolver.get_name(&self_record(fd), Duration::from_millis(50));
            let waited = began.elapsed();
            (slow.join().unwrap(), (quick, waited))
        });

        let (quick, waited) = quick;
        assert_eq!(quick.unwrap(), None);
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
        let expected = std::fs::read_link(format!("/proc/self/fd/{fd}")).unwrap();
        assert_eq!(slow.unwrap().as_deref(), expected.to_str());
        assert_eq!(resolver.executor_generation(), Some(0));
    }
}
