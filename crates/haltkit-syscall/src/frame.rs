use crate::ExecutorError;

pub const MAX_REGISTER_ARGS: usize = 4;
pub const MAX_STACK_ARGS: usize = 10;
pub const MAX_ARGS: usize = MAX_REGISTER_ARGS + MAX_STACK_ARGS;

/// Handshake block the call thread reads while it parks itself.
///
/// During setup the thread receives a pointer to a standalone copy and writes
/// the address of its frame into `frame`; afterwards the copy embedded in the
/// frame is the one the parked thread uses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSetup {
    pub frame: u64,
    pub event: u64,
    pub thread: u64,
}

/// Single-slot mailbox carrying one privileged call across the call-thread
/// boundary.
///
/// Layout (`#[repr(C)]`, every slot 8 bytes):
///
/// | offset | slot |
/// |-------:|------|
/// | 0x00 | return slot (the kernel skips it) |
/// | 0x08 | 32-byte shadow area |
/// | 0x28 | 10 stack argument slots, 5th call argument first |
/// | 0x78 | call number in, raw result out |
/// | 0x80 | 4 register argument slots |
/// | 0xa0 | [`ThreadSetup`] |
///
/// At the moment of the call the hijacked thread's stack pointer is the frame
/// address, which puts the stack arguments exactly where the x86-64 syscall
/// ABI expects the fifth and later arguments (`rsp+0x28`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFrame {
    pub return_slot: u64,
    pub shadow: [u64; 4],
    pub stack_args: [u64; MAX_STACK_ARGS],
    pub number_or_result: u64,
    pub register_args: [u64; MAX_REGISTER_ARGS],
    pub setup: ThreadSetup,
}

pub const FRAME_SIZE: usize = std::mem::size_of::<TransferFrame>();
pub const NUMBER_OFFSET: usize = std::mem::offset_of!(TransferFrame, number_or_result);
pub const REGISTER_ARGS_OFFSET: usize = std::mem::offset_of!(TransferFrame, register_args);
pub const STACK_ARGS_OFFSET: usize = std::mem::offset_of!(TransferFrame, stack_args);
pub const SETUP_OFFSET: usize = std::mem::offset_of!(TransferFrame, setup);

/// A validated call: number plus at most [`MAX_ARGS`] integer arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    number: u32,
    args: [u64; MAX_ARGS],
    argc: usize,
}

impl SyscallRequest {
    pub fn new(number: u32, args: &[usize]) -> Result<Self, ExecutorError> {
        if args.len() > MAX_ARGS {
            return Err(ExecutorError::TooManyArguments {
                count: args.len(),
                max: MAX_ARGS,
            });
        }
        let mut packed = [0u64; MAX_ARGS];
        for (slot, arg) in packed.iter_mut().zip(args) {
            *slot = *arg as u64;
        }
        Ok(SyscallRequest {
            number,
            args: packed,
            argc: args.len(),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn args(&self) -> &[u64] {
        &self.args[..self.argc]
    }
}

impl TransferFrame {
    /// Loads `request` into the call slots. Unused argument slots are zeroed
    /// so nothing from a previous call leaks into the next one.
    pub fn store(&mut self, request: &SyscallRequest) {
        self.number_or_result = u64::from(request.number);
        self.register_args = [0; MAX_REGISTER_ARGS];
        self.stack_args = [0; MAX_STACK_ARGS];
        for (i, arg) in request.args().iter().enumerate() {
            if i < MAX_REGISTER_ARGS {
                self.register_args[i] = *arg;
            } else {
                self.stack_args[i - MAX_REGISTER_ARGS] = *arg;
            }
        }
    }

    /// Call number and all argument slots in call order.
    pub fn request(&self) -> (u32, [u64; MAX_ARGS]) {
        let mut args = [0u64; MAX_ARGS];
        args[..MAX_REGISTER_ARGS].copy_from_slice(&self.register_args);
        args[MAX_REGISTER_ARGS..].copy_from_slice(&self.stack_args);
        (self.number_or_result as u32, args)
    }

    pub fn store_result(&mut self, raw: u64) {
        self.number_or_result = raw;
    }

    pub fn result(&self) -> u64 {
        self.number_or_result
    }
}
