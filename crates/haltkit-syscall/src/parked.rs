use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::executor::{CallThread, CallThreadFactory, ExecutorError};
use crate::frame::{SyscallRequest, TransferFrame, MAX_ARGS};

/// Narrow adapter from "call number + integer arguments" to one kernel entry.
///
/// Implementations run on the parked call thread and may block for as long
/// as the kernel does; the executor bounds the caller, not the call.
pub trait PrivilegedCall: Send + Sync + 'static {
    fn invoke(&self, number: u32, args: &[u64; MAX_ARGS]) -> i64;
}

/// Linux `syscall(2)`. Returns the kernel result, or `-errno` on failure.
/// The kernel takes at most six arguments; later slots are ignored.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSyscall;

#[cfg(target_os = "linux")]
impl PrivilegedCall for RawSyscall {
    fn invoke(&self, number: u32, args: &[u64; MAX_ARGS]) -> i64 {
        let a = |i: usize| args[i] as libc::c_long;
        let ret = unsafe {
            libc::syscall(
                libc::c_long::from(number as i32),
                a(0),
                a(1),
                a(2),
                a(3),
                a(4),
                a(5),
            )
        };
        if ret == -1 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return -i64::from(errno);
        }
        ret as i64
    }
}

/// Portable call-thread backend: a named OS thread blocked on a channel,
/// reading its calls out of a shared [`TransferFrame`].
///
/// POSIX offers no safe way to kill a single thread, so a thread that missed
/// its deadline is abandoned instead of terminated. It owns nothing but its
/// own mailbox and exits as soon as its call returns.
pub struct ParkedThreads<C: PrivilegedCall> {
    call: Arc<C>,
    next_id: AtomicU64,
}

impl<C: PrivilegedCall> ParkedThreads<C> {
    pub fn new(call: C) -> Self {
        ParkedThreads {
            call: Arc::new(call),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<C: PrivilegedCall> CallThreadFactory for ParkedThreads<C> {
    type Thread = ParkedThread;

    fn spawn(&self) -> Result<ParkedThread, ExecutorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mutex::new(TransferFrame::default()));
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let (parked_tx, parked_rx) = mpsc::channel::<()>();

        let call = Arc::clone(&self.call);
        let frame = Arc::clone(&mailbox);
        let handle = thread::Builder::new()
            .name(format!("haltkit-call-{id}"))
            .spawn(move || park_loop(&*call, &frame, &resume_rx, &parked_tx))
            .map_err(|source| ExecutorError::Os {
                op: "spawn call thread",
                source,
            })?;

        Ok(ParkedThread {
            id,
            mailbox,
            resume: resume_tx,
            parked: parked_rx,
            handle: Some(handle),
        })
    }
}

fn park_loop<C: PrivilegedCall>(
    call: &C,
    frame: &Mutex<TransferFrame>,
    resume: &mpsc::Receiver<()>,
    parked: &mpsc::Sender<()>,
) {
    while resume.recv().is_ok() {
        let (number, args) = match frame.lock() {
            Ok(f) => f.request(),
            Err(_) => return,
        };
        let raw = call.invoke(number, &args);
        match frame.lock() {
            Ok(mut f) => f.store_result(raw as u64),
            Err(_) => return,
        }
        if parked.send(()).is_err() {
            return;
        }
    }
}

pub struct ParkedThread {
    id: u64,
    mailbox: Arc<Mutex<TransferFrame>>,
    resume: mpsc::Sender<()>,
    parked: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl CallThread for ParkedThread {
    fn call(
        &mut self,
        request: &SyscallRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, ExecutorError> {
        self.mailbox
            .lock()
            .map_err(|_| ExecutorError::ThreadLost)?
            .store(request);

        self.resume
            .send(())
            .map_err(|_| ExecutorError::ThreadLost)?;

        match self.parked.recv_timeout(timeout) {
            Ok(()) => {
                let frame = self.mailbox.lock().map_err(|_| ExecutorError::ThreadLost)?;
                Ok(Some(frame.result()))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExecutorError::ThreadLost),
        }
    }

    fn terminate(mut self) -> Result<(), ExecutorError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // Dropping `self` closes the resume channel, which ends an idle loop.
        drop(self);
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!("abandoning call thread still inside the kernel");
        }
        Ok(())
    }

    fn id(&self) -> u64 {
        self.id
    }
}
