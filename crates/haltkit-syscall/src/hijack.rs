//! Windows x86-64 call threads: a thread parked inside a small machine-code
//! stub that issues raw `syscall` instructions out of a [`TransferFrame`] on
//! its own stack. A thread that misses a deadline can be terminated outright.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, GetThreadContext, CONTEXT, CONTEXT_CONTROL_AMD64,
};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateThread, GetCurrentProcess, ResetEvent, ResumeThread, SuspendThread,
    TerminateThread, WaitForSingleObject, CREATE_SUSPENDED, STACK_SIZE_PARAM_IS_A_RESERVATION,
};

use crate::executor::{CallThread, CallThreadFactory, ExecutorError};
use crate::frame::{SyscallRequest, ThreadSetup, TransferFrame, FRAME_SIZE};
use crate::sys::windows::ntdll_call_number;

const STACK_RESERVE: usize = 128 * 1024;
const SETUP_TIMEOUT_MS: u32 = 5_000;
const REPARK_LIMIT: Duration = Duration::from_secs(1);

const SET_EVENT_IMM: [usize; 2] = [0x0e, 0x56];
const SUSPEND_IMM: [usize; 2] = [0x1c, 0x68];
/// Where the thread sits after its first self-suspend.
const PARKED_OFFSET: usize = 0x29;

/// `sub rsp,0xb8`, publish the frame address, signal the setup event and
/// suspend; then loop: load number and register arguments from the frame,
/// `syscall`, store the result, signal, suspend.
#[rustfmt::skip]
const STUB: [u8; 0x7b] = [
    0x48, 0x81, 0xec, 0xb8, 0x00, 0x00, 0x00,       // sub rsp, 0xb8
    0x48, 0x89, 0x21,                               // mov [rcx], rsp
    0x49, 0x89, 0xcf,                               // mov r15, rcx
    0xb8, 0x00, 0x00, 0x00, 0x00,                   // mov eax, NtSetEvent
    0x4d, 0x8b, 0x57, 0x08,                         // mov r10, [r15+0x08]
    0x48, 0x31, 0xd2,                               // xor rdx, rdx
    0x0f, 0x05,                                     // syscall
    0xb8, 0x00, 0x00, 0x00, 0x00,                   // mov eax, NtSuspendThread
    0x4d, 0x8b, 0x57, 0x10,                         // mov r10, [r15+0x10]
    0x48, 0x31, 0xd2,                               // xor rdx, rdx
    0x0f, 0x05,                                     // syscall
    // 0x29: parked
    0x48, 0x8b, 0x44, 0x24, 0x78,                   // mov rax, [rsp+0x78]
    0x4c, 0x8b, 0x94, 0x24, 0x80, 0x00, 0x00, 0x00, // mov r10, [rsp+0x80]
    0x48, 0x8b, 0x94, 0x24, 0x88, 0x00, 0x00, 0x00, // mov rdx, [rsp+0x88]
    0x4c, 0x8b, 0x84, 0x24, 0x90, 0x00, 0x00, 0x00, // mov r8, [rsp+0x90]
    0x4c, 0x8b, 0x8c, 0x24, 0x98, 0x00, 0x00, 0x00, // mov r9, [rsp+0x98]
    0x0f, 0x05,                                     // syscall
    0x48, 0x89, 0x44, 0x24, 0x78,                   // mov [rsp+0x78], rax
    0xb8, 0x00, 0x00, 0x00, 0x00,                   // mov eax, NtSetEvent
    0x4c, 0x8b, 0x94, 0x24, 0xa8, 0x00, 0x00, 0x00, // mov r10, [rsp+0xa8]
    0x48, 0x31, 0xd2,                               // xor rdx, rdx
    0x0f, 0x05,                                     // syscall
    0xb8, 0x00, 0x00, 0x00, 0x00,                   // mov eax, NtSuspendThread
    0x4c, 0x8b, 0x94, 0x24, 0xb0, 0x00, 0x00, 0x00, // mov r10, [rsp+0xb0]
    0x48, 0x31, 0xd2,                               // xor rdx, rdx
    0x0f, 0x05,                                     // syscall
    0xeb, 0xae,                                     // jmp 0x29
];

#[repr(C)]
struct ThreadBasicInformation {
    exit_status: i32,
    teb_base: *mut c_void,
    client_id: [usize; 2],
    affinity_mask: usize,
    priority: i32,
    base_priority: i32,
}

#[link(name = "ntdll")]
extern "system" {
    fn NtQueryInformationThread(
        thread: HANDLE,
        class: u32,
        info: *mut c_void,
        info_len: u32,
        return_len: *mut u32,
    ) -> i32;
}

/// Executable copy of [`STUB`] with the call numbers patched in.
struct StubPage {
    base: *mut c_void,
}

unsafe impl Send for StubPage {}
unsafe impl Sync for StubPage {}

impl StubPage {
    fn build() -> Result<Self, ExecutorError> {
        let set_event = ntdll_call_number(b"NtSetEvent\0")
            .ok_or_else(|| ExecutorError::Setup("cannot read NtSetEvent call number".into()))?;
        let suspend = ntdll_call_number(b"NtSuspendThread\0").ok_or_else(|| {
            ExecutorError::Setup("cannot read NtSuspendThread call number".into())
        })?;

        let mut code = STUB;
        for off in SET_EVENT_IMM {
            code[off..off + 4].copy_from_slice(&set_event.to_le_bytes());
        }
        for off in SUSPEND_IMM {
            code[off..off + 4].copy_from_slice(&suspend.to_le_bytes());
        }

        let base = unsafe {
            VirtualAlloc(
                ptr::null(),
                code.len(),
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(ExecutorError::last_os("VirtualAlloc"));
        }
        let page = StubPage { base };
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), base.cast::<u8>(), code.len());
            let mut old = 0u32;
            if VirtualProtect(base, code.len(), PAGE_EXECUTE_READ, &mut old) == 0 {
                return Err(ExecutorError::last_os("VirtualProtect"));
            }
            FlushInstructionCache(GetCurrentProcess(), base, code.len());
        }
        trace!(set_event, suspend, "call stub mapped");
        Ok(page)
    }

    fn addr(&self) -> usize {
        self.base as usize
    }
}

impl Drop for StubPage {
    fn drop(&mut self) {
        unsafe {
            VirtualFree(self.base, 0, MEM_RELEASE);
        }
    }
}

pub struct HijackThreads {
    stub: Arc<StubPage>,
    next_id: AtomicU64,
}

impl HijackThreads {
    pub fn new() -> Result<Self, ExecutorError> {
        Ok(HijackThreads {
            stub: Arc::new(StubPage::build()?),
            next_id: AtomicU64::new(1),
        })
    }
}

impl CallThreadFactory for HijackThreads {
    type Thread = HijackedThread;

    fn spawn(&self) -> Result<HijackedThread, ExecutorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            return Err(ExecutorError::last_os("CreateEventW"));
        }

        let mut setup = Box::new(ThreadSetup {
            frame: 0,
            event: event as u64,
            thread: 0,
        });
        let entry = unsafe {
            std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(
                self.stub.addr(),
            )
        };
        let mut tid = 0u32;
        let thread = unsafe {
            CreateThread(
                ptr::null(),
                STACK_RESERVE,
                Some(entry),
                (&mut *setup as *mut ThreadSetup).cast(),
                CREATE_SUSPENDED | STACK_SIZE_PARAM_IS_A_RESERVATION,
                &mut tid,
            )
        };
        if thread.is_null() {
            let err = ExecutorError::last_os("CreateThread");
            unsafe { CloseHandle(event) };
            return Err(err);
        }
        setup.thread = thread as u64;

        let mut parked = HijackedThread {
            id,
            thread,
            event,
            frame: ptr::null_mut(),
            stub: Arc::clone(&self.stub),
        };
        if let Err(err) = parked.first_park(&setup) {
            let _ = parked.terminate();
            std::mem::forget(setup);
            return Err(err);
        }
        trace!(thread = id, tid, "call thread hijacked");
        Ok(parked)
    }
}

pub struct HijackedThread {
    id: u64,
    thread: HANDLE,
    event: HANDLE,
    frame: *mut TransferFrame,
    stub: Arc<StubPage>,
}

// The handles and the frame pointer are only used from the owning executor.
unsafe impl Send for HijackedThread {}

impl HijackedThread {
    fn first_park(&mut self, setup: &ThreadSetup) -> Result<(), ExecutorError> {
        unsafe {
            if ResumeThread(self.thread) == u32::MAX {
                return Err(ExecutorError::last_os("ResumeThread"));
            }
            match WaitForSingleObject(self.event, SETUP_TIMEOUT_MS) {
                WAIT_OBJECT_0 => {}
                WAIT_TIMEOUT => {
                    return Err(ExecutorError::Setup(
                        "call thread never reached its parking spot".into(),
                    ))
                }
                _ => return Err(ExecutorError::last_os("WaitForSingleObject")),
            }
        }
        self.wait_parked()?;

        // Written by the stub, not by us.
        let frame = unsafe { ptr::read_volatile(ptr::addr_of!(setup.frame)) } as usize;
        let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
        ctx.ContextFlags = CONTEXT_CONTROL_AMD64;
        if unsafe { GetThreadContext(self.thread, &mut ctx) } == 0 {
            return Err(ExecutorError::last_os("GetThreadContext"));
        }
        if ctx.Rsp as usize != frame {
            return Err(ExecutorError::Setup(format!(
                "parked stack pointer {:#x} is not the frame {frame:#x}",
                ctx.Rsp
            )));
        }
        if ctx.Rip as usize != self.stub.addr() + PARKED_OFFSET {
            return Err(ExecutorError::Setup(format!(
                "parked at {:#x}, outside the call stub",
                ctx.Rip
            )));
        }

        let (limit, base) = self.stack_bounds()?;
        if frame < limit || frame + FRAME_SIZE > base {
            return Err(ExecutorError::Setup(format!(
                "frame {frame:#x} outside the thread stack {limit:#x}..{base:#x}"
            )));
        }

        self.frame = frame as *mut TransferFrame;
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*self.frame).setup),
                ThreadSetup {
                    frame: frame as u64,
                    ..*setup
                },
            );
        }
        Ok(())
    }

    fn stack_bounds(&self) -> Result<(usize, usize), ExecutorError> {
        let mut info: ThreadBasicInformation = unsafe { std::mem::zeroed() };
        let status = unsafe {
            NtQueryInformationThread(
                self.thread,
                0,
                (&mut info as *mut ThreadBasicInformation).cast(),
                std::mem::size_of::<ThreadBasicInformation>() as u32,
                ptr::null_mut(),
            )
        };
        if status < 0 || info.teb_base.is_null() {
            return Err(ExecutorError::Setup(format!(
                "thread basic information unavailable ({status:#x})"
            )));
        }
        let teb = info.teb_base as *const usize;
        // NT_TIB: ExceptionList, StackBase, StackLimit.
        let (base, limit) = unsafe { (ptr::read(teb.add(1)), ptr::read(teb.add(2))) };
        Ok((limit, base))
    }

    /// Blocks until the thread has really executed its self-suspend. The
    /// completion event fires one instruction sequence earlier, and a resume
    /// that lands in between would be lost.
    fn wait_parked(&self) -> Result<(), ExecutorError> {
        let started = Instant::now();
        loop {
            let prev = unsafe { SuspendThread(self.thread) };
            if prev == u32::MAX {
                return Err(ExecutorError::last_os("SuspendThread"));
            }
            if unsafe { ResumeThread(self.thread) } == u32::MAX {
                return Err(ExecutorError::last_os("ResumeThread"));
            }
            if prev >= 1 {
                return Ok(());
            }
            if started.elapsed() > REPARK_LIMIT {
                return Err(ExecutorError::Setup(
                    "call thread did not re-suspend after signalling".into(),
                ));
            }
            std::thread::yield_now();
        }
    }
}

fn wait_millis(timeout: Duration) -> u32 {
    let ms = timeout.as_millis();
    if ms == 0 && !timeout.is_zero() {
        return 1;
    }
    u32::try_from(ms).unwrap_or(u32::MAX - 1)
}

impl CallThread for HijackedThread {
    fn call(
        &mut self,
        request: &SyscallRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, ExecutorError> {
        unsafe {
            let mut frame = ptr::read_volatile(self.frame);
            frame.store(request);
            ptr::write_volatile(self.frame, frame);

            if ResetEvent(self.event) == 0 {
                return Err(ExecutorError::last_os("ResetEvent"));
            }
            if ResumeThread(self.thread) == u32::MAX {
                return Err(ExecutorError::last_os("ResumeThread"));
            }
            match WaitForSingleObject(self.event, wait_millis(timeout)) {
                WAIT_OBJECT_0 => {}
                WAIT_TIMEOUT => return Ok(None),
                _ => return Err(ExecutorError::last_os("WaitForSingleObject")),
            }
        }
        self.wait_parked()?;
        let raw = unsafe { ptr::read_volatile(ptr::addr_of!((*self.frame).number_or_result)) };
        Ok(Some(raw))
    }

    fn terminate(self) -> Result<(), ExecutorError> {
        let result = unsafe {
            SuspendThread(self.thread);
            if TerminateThread(self.thread, 1) == 0 {
                Err(ExecutorError::last_os("TerminateThread"))
            } else {
                WaitForSingleObject(self.thread, SETUP_TIMEOUT_MS);
                Ok(())
            }
        };
        unsafe {
            CloseHandle(self.thread);
            CloseHandle(self.event);
        }
        if result.is_err() {
            // Still running stub code; the page must outlive it.
            debug!(thread = self.id, "call thread survived termination, leaking stub");
            std::mem::forget(self.stub);
        }
        result
    }

    fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_parks_at_the_loop_head() {
        assert_eq!(STUB.len(), 0x7b);
        assert_eq!(&STUB[PARKED_OFFSET..PARKED_OFFSET + 5], &[0x48, 0x8b, 0x44, 0x24, 0x78]);
        for off in SET_EVENT_IMM.iter().chain(&SUSPEND_IMM) {
            assert_eq!(STUB[off - 1], 0xb8);
        }
        // jmp rel8 back to the loop head
        assert_eq!(0x7b_i32 + i32::from(STUB[0x7a] as i8), PARKED_OFFSET as i32);
    }

    #[test]
    fn thread_spawns_parks_and_survives_a_timeout() {
        use crate::{CallOutcome, NativeSyscallExecutor};

        let mut exec = NativeSyscallExecutor::with_factory(HijackThreads::new().unwrap()).unwrap();
        let close = ntdll_call_number(b"NtClose\0").unwrap();
        // Closing an invalid handle fails fast with STATUS_INVALID_HANDLE.
        let out = exec
            .run_syscall(Duration::from_secs(5), close, &[0x7fff_fff0])
            .unwrap();
        assert_eq!(out.raw() as u32, 0xC000_0008);

        let delay = ntdll_call_number(b"NtDelayExecution\0").unwrap();
        let interval: Box<i64> = Box::new(-50_000_000);
        let out = exec
            .run_syscall(
                Duration::from_millis(50),
                delay,
                &[0, &*interval as *const i64 as usize],
            )
            .unwrap();
        assert_eq!(out, CallOutcome::TimedOut);
        std::mem::forget(interval);

        let out = exec
            .run_syscall(Duration::from_secs(5), close, &[0x7fff_fff0])
            .unwrap();
        assert_eq!(out.raw() as u32, 0xC000_0008);
    }
}
