use std::io::{self, BufRead, BufReader, PipeReader, PipeWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use haltkit_contracts::{
    HandleRecord, NameResolver, ResolveError, HELPER_BANNER, MAX_RESPONSE_LINE_BYTES,
};
use tracing::{debug, trace, warn};

use crate::pipes;
use crate::pool::Availability;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long `start` waits for the helper banner.
    pub handshake_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    /// Spawning or re-handshaking, possibly in the background.
    Starting,
    Ready,
    /// A request is outstanding.
    Busy,
}

/// One helper process plus the pipes and reader thread that talk to it.
struct Session {
    child: Child,
    request: PipeWriter,
    lines: mpsc::Receiver<io::Result<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    fn open(helper: &Path, worker: usize, handshake: Duration) -> Result<Session, ResolveError> {
        let channel = pipes::spawn_helper(helper).map_err(|err| {
            ResolveError::TransportFailure(format!("spawn {}: {err}", helper.display()))
        })?;

        let (tx, rx) = mpsc::channel();
        let response = channel.response;
        let reader = thread::Builder::new()
            .name(format!("haltkit-name-reader-{worker}"))
            .spawn(move || read_lines(response, &tx));
        let mut session = Session {
            child: channel.child,
            request: channel.request,
            lines: rx,
            reader: None,
        };
        match reader {
            Ok(handle) => session.reader = Some(handle),
            Err(err) => {
                session.stop();
                return Err(ResolveError::TransportFailure(format!(
                    "spawn reader thread: {err}"
                )));
            }
        }

        let banner = session.lines.recv_timeout(handshake);
        let why = match banner {
            Ok(Ok(line)) if line == HELPER_BANNER.as_bytes() => return Ok(session),
            Ok(Ok(line)) => format!(
                "unexpected banner {:?}",
                String::from_utf8_lossy(&line[..line.len().min(64)])
            ),
            Ok(Err(err)) => format!("read banner: {err}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                format!("no banner within {} ms", handshake.as_millis())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                "helper exited before its banner".to_string()
            }
        };
        session.stop();
        Err(ResolveError::TransportFailure(why))
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Kills and reaps the helper, closes both pipes and joins the reader.
    fn stop(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        drop(self.request);
        drop(self.lines);
        let Some(reader) = self.reader.take() else {
            return;
        };
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            debug!("response reader still blocked, detaching");
        }
    }
}

/// Splits the response pipe into lines. An over-long line is reported as
/// `InvalidData` and ends the stream.
fn read_lines(pipe: PipeReader, tx: &mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut reader = BufReader::new(pipe);
    loop {
        let mut line = Vec::new();
        let limit = MAX_RESPONSE_LINE_BYTES as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                } else if line.len() > MAX_RESPONSE_LINE_BYTES {
                    let _ = tx.send(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("response line longer than {MAX_RESPONSE_LINE_BYTES} bytes"),
                    )));
                    return;
                } else {
                    // Unterminated tail at EOF.
                    return;
                }
                if tx.send(Ok(line)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
}

struct Slot {
    state: WorkerState,
    /// Bumped by every start and stop; a claim from an older generation
    /// must not put its session back.
    generation: u64,
    session: Option<Session>,
    pid: Option<u32>,
    closed: bool,
    /// Last background restart attempt.
    last_restart: Option<Instant>,
}

struct WorkerInner {
    id: usize,
    helper: PathBuf,
    options: WorkerOptions,
    slot: Mutex<Slot>,
    availability: Option<Arc<Availability>>,
}

/// A claimed session, taken out of the slot for one request.
pub(crate) struct Claim {
    session: Session,
    generation: u64,
}

/// Resolves names through one helper process over a request/response pipe
/// pair. At most one request is outstanding at a time.
pub struct HelperProcessWorker {
    inner: Arc<WorkerInner>,
}

impl HelperProcessWorker {
    pub fn new(helper: impl Into<PathBuf>, options: WorkerOptions) -> Self {
        Self::build(0, helper.into(), options, None)
    }

    pub(crate) fn pooled(
        id: usize,
        helper: PathBuf,
        options: WorkerOptions,
        availability: Arc<Availability>,
    ) -> Self {
        Self::build(id, helper, options, Some(availability))
    }

    fn build(
        id: usize,
        helper: PathBuf,
        options: WorkerOptions,
        availability: Option<Arc<Availability>>,
    ) -> Self {
        HelperProcessWorker {
            inner: Arc::new(WorkerInner {
                id,
                helper,
                options,
                slot: Mutex::new(Slot {
                    state: WorkerState::Stopped,
                    generation: 0,
                    session: None,
                    pid: None,
                    closed: false,
                    last_restart: None,
                }),
                availability,
            }),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// True unless the handshake completed and no request is outstanding.
    pub fn is_busy(&self) -> bool {
        self.state() != WorkerState::Ready
    }

    /// Process id of the current helper, if one is running.
    pub fn helper_pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Kills the helper and leaves the worker `Stopped`.
    pub fn stop(&self) {
        let stale = {
            let mut slot = self.inner.lock();
            slot.generation += 1;
            slot.state = WorkerState::Stopped;
            slot.pid = None;
            slot.session.take()
        };
        if let Some(session) = stale {
            session.stop();
        }
        self.inner.notify();
    }

    /// Atomic `Ready -> Busy`.
    pub(crate) fn try_claim(&self) -> Option<Claim> {
        let mut slot = self.inner.lock();
        if slot.state != WorkerState::Ready {
            return None;
        }
        let session = slot.session.take()?;
        slot.state = WorkerState::Busy;
        Some(Claim {
            session,
            generation: slot.generation,
        })
    }

    pub(crate) fn request(
        &self,
        claim: Claim,
        record: &HandleRecord,
        timeout: Duration,
    ) -> Result<Option<String>, ResolveError> {
        let Claim {
            mut session,
            generation,
        } = claim;
        let inner = &self.inner;

        let written = session
            .request
            .write_all(&record.encode())
            .and_then(|()| session.request.flush());
        if let Err(err) = written {
            debug!(worker = inner.id, error = %err, "request pipe broken");
            session.stop();
            inner.finish(generation, None);
            return Ok(None);
        }

        match session.lines.recv_timeout(timeout) {
            Ok(Ok(line)) => match String::from_utf8(line) {
                Ok(name) => {
                    inner.finish(generation, Some(session));
                    Ok(Some(name))
                }
                Err(_) => {
                    session.stop();
                    inner.finish(generation, None);
                    Err(ResolveError::ProtocolViolation(
                        "response line is not UTF-8".to_string(),
                    ))
                }
            },
            Ok(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                session.stop();
                inner.finish(generation, None);
                Err(ResolveError::ProtocolViolation(err.to_string()))
            }
            Ok(Err(err)) => {
                debug!(worker = inner.id, error = %err, "response pipe failed");
                session.stop();
                inner.finish(generation, None);
                Ok(None)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                trace!(
                    worker = inner.id,
                    pid = record.owner_pid,
                    handle = record.handle_value,
                    timeout_ms = timeout.as_millis() as u64,
                    "helper did not answer in time, restarting it"
                );
                // The late answer, if any, dies with this session.
                Arc::clone(inner).restart_detached(generation, session);
                Ok(None)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!(worker = inner.id, "helper exited mid-request");
                session.stop();
                inner.finish(generation, None);
                Ok(None)
            }
        }
    }

    /// Restarts a stopped worker on a background thread, at most once per
    /// `backoff`.
    pub(crate) fn restart_in_background(&self, backoff: Duration) {
        let generation = {
            let mut slot = self.inner.lock();
            if slot.state != WorkerState::Stopped || slot.closed {
                return;
            }
            if slot.last_restart.is_some_and(|at| at.elapsed() < backoff) {
                return;
            }
            slot.last_restart = Some(Instant::now());
            slot.state = WorkerState::Starting;
            slot.generation
        };
        Arc::clone(&self.inner).spawn_restart(generation, None);
    }
}

impl WorkerInner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        if let Some(availability) = &self.availability {
            availability.notify();
        }
    }

    fn start(&self) -> Result<(), ResolveError> {
        let (generation, stale) = {
            let mut slot = self.lock();
            if slot.closed {
                return Err(ResolveError::TransportFailure(
                    "worker is shut down".to_string(),
                ));
            }
            slot.generation += 1;
            slot.state = WorkerState::Starting;
            slot.pid = None;
            (slot.generation, slot.session.take())
        };
        if let Some(session) = stale {
            session.stop();
        }

        let opened = Session::open(&self.helper, self.id, self.options.handshake_timeout);
        let result = {
            let mut slot = self.lock();
            match opened {
                Ok(session) if slot.generation == generation && !slot.closed => {
                    slot.pid = Some(session.pid());
                    slot.session = Some(session);
                    slot.state = WorkerState::Ready;
                    debug!(worker = self.id, pid = slot.pid, "helper ready");
                    Ok(None)
                }
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    if slot.generation == generation {
                        slot.state = WorkerState::Stopped;
                    }
                    Err(err)
                }
            }
        };
        self.notify();
        match result {
            Ok(None) => Ok(()),
            Ok(Some(superseded)) => {
                superseded.stop();
                Err(ResolveError::TransportFailure(
                    "start superseded by a concurrent start or stop".to_string(),
                ))
            }
            Err(err) => {
                warn!(worker = self.id, error = %err, "helper failed to start");
                Err(err)
            }
        }
    }

    /// Ends a claim. A live session goes back to the slot; without one the
    /// worker is `Stopped`. Sessions of an older generation are stopped.
    fn finish(&self, generation: u64, session: Option<Session>) {
        let stale = {
            let mut slot = self.lock();
            if slot.generation != generation || slot.state != WorkerState::Busy {
                session
            } else {
                match session {
                    Some(session) => {
                        slot.session = Some(session);
                        slot.state = WorkerState::Ready;
                    }
                    None => {
                        slot.state = WorkerState::Stopped;
                        slot.pid = None;
                    }
                }
                None
            }
        };
        if let Some(session) = stale {
            session.stop();
        }
        self.notify();
    }

    fn restart_detached(self: Arc<Self>, generation: u64, stale: Session) {
        {
            let mut slot = self.lock();
            if slot.generation == generation && slot.state == WorkerState::Busy {
                slot.state = WorkerState::Starting;
                slot.pid = None;
            }
        }
        self.notify();
        self.spawn_restart(generation, Some(stale));
    }

    fn spawn_restart(self: Arc<Self>, generation: u64, stale: Option<Session>) {
        let id = self.id;
        let inner = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name(format!("haltkit-name-restart-{id}"))
            .spawn(move || {
                if let Some(session) = stale {
                    session.stop();
                }
                if inner.lock().generation != generation {
                    return;
                }
                let _ = inner.start();
            });
        if let Err(err) = spawned {
            warn!(worker = id, error = %err, "cannot spawn restart thread");
            let mut slot = self.lock();
            if slot.generation == generation {
                slot.state = WorkerState::Stopped;
            }
        }
    }
}

impl NameResolver for HelperProcessWorker {
    fn start(&self) -> Result<(), ResolveError> {
        self.inner.start()
    }

    /// Resolves through this worker alone. A worker that is not `Ready`
    /// answers `None` without waiting.
    fn get_name(
        &self,
        record: &HandleRecord,
        timeout: Duration,
    ) -> Result<Option<String>, ResolveError> {
        match self.try_claim() {
            Some(claim) => self.request(claim, record, timeout),
            None => Ok(None),
        }
    }
}

impl Drop for HelperProcessWorker {
    fn drop(&mut self) {
        self.inner.lock().closed = true;
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("helper.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn quick() -> WorkerOptions {
        WorkerOptions {
            handshake_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn wrong_banner_fails_start_and_leaves_worker_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(&dir, r#"printf 'hello\n' >&$2; exec sleep 5"#);
        let worker = HelperProcessWorker::new(helper, quick());
        let err = worker.start().unwrap_err();
        assert!(
            matches!(&err, ResolveError::TransportFailure(why) if why.contains("banner")),
            "{err}"
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.helper_pid(), None);
    }

    #[test]
    fn silent_helper_times_out_the_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(&dir, "exec sleep 5");
        let worker = HelperProcessWorker::new(
            helper,
            WorkerOptions {
                handshake_timeout: Duration::from_millis(100),
            },
        );
        let started = Instant::now();
        let err = worker.start().unwrap_err();
        assert!(matches!(err, ResolveError::TransportFailure(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn non_utf8_answer_is_a_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(
            &dir,
            r#"printf '.\n' >&$2; head -c 40 <&$1 >/dev/null; printf '\377\n' >&$2; exec sleep 5"#,
        );
        let worker = HelperProcessWorker::new(helper, quick());
        worker.start().unwrap();
        let err = worker
            .get_name(&HandleRecord::new(1, 4), Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ProtocolViolation(_)), "{err}");
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn stopped_worker_answers_none_without_waiting() {
        let worker = HelperProcessWorker::new("/nonexistent/helper", quick());
        assert!(worker.is_busy());
        let got = worker
            .get_name(&HandleRecord::new(1, 4), Duration::from_secs(5))
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn over_long_answer_is_a_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(
            &dir,
            r#"printf '.\n' >&$2; head -c 40 <&$1 >/dev/null; head -c 300000 /dev/zero | tr '\000' a >&$2; printf '\n' >&$2; exec sleep 5"#,
        );
        let worker = HelperProcessWorker::new(helper, quick());
        worker.start().unwrap();
        let err = worker
            .get_name(&HandleRecord::new(1, 4), Duration::from_secs(5))
            .unwrap_err();
        assert!(
            matches!(&err, ResolveError::ProtocolViolation(why) if why.contains("longer than")),
            "{err}"
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn broken_request_pipe_answers_none_and_stops_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        // The request end is closed before the banner goes out.
        let helper = script(&dir, r#"eval "exec $1<&-"; printf '.\n' >&$2; exec sleep 5"#);
        let worker = HelperProcessWorker::new(helper, quick());
        worker.start().unwrap();
        let began = Instant::now();
        let got = worker
            .get_name(&HandleRecord::new(1, 4), Duration::from_secs(2))
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(began.elapsed() < Duration::from_secs(1));
    }
}
