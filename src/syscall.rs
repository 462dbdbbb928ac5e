use core::fmt::Display;

use alloc::string::String;

use crate::abi::Syscall;
use crate::proc::{Proc, TrapFrame, current_proc, current_proc_and_data_mut};
use crate::sysproc::*;
use crate::vm::VA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    Unknown(usize),
    InvalidArgument(&'static str),
    FetchArgument,
    Proc(&'static str),
    Console,
}

impl Display for SyscallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyscallError::Unknown(i) => write!(f, "unknown syscall {i}"),
            SyscallError::InvalidArgument(s) => write!(f, "invalid argument {s}"),
            SyscallError::FetchArgument => write!(f, "fetch argument"),
            SyscallError::Proc(s) => write!(f, "{s}"),
            SyscallError::Console => write!(f, "console error"),
        }
    }
}

/// Wrapper for extracting typed syscall arguments from trapframe.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &Proc {
        self.proc
    }

    /// Returns the argument at the given index as a usize.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a virtual address.
    ///
    /// Does not check for legality, since `copy_to`/`copy_from` will do that.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Fetches a null-terminated string from user space.
    pub fn fetch_string(&self, addr: VA, max: usize) -> Result<String, SyscallError> {
        let (_proc, data) = current_proc_and_data_mut();

        let mut result = String::with_capacity(max);

        let mut buf = [0u8; 1];
        for i in 0..max {
            try_log!(
                data.pagetable_mut()
                    .copy_from(VA::from(addr.as_usize() + i), &mut buf)
                    .map_err(|_| SyscallError::FetchArgument)
            );

            if buf[0] == 0 {
                return Ok(result);
            }

            result.push(buf[0] as char);
        }

        Ok(result)
    }

    /// Copies `count` raw bytes out to user memory at `addr`.
    pub fn copy_out(&self, addr: VA, src: &[u8]) -> Result<(), SyscallError> {
        let (_proc, data) = current_proc_and_data_mut();
        try_log!(
            data.pagetable_mut()
                .copy_to(src, addr)
                .map_err(|_| SyscallError::FetchArgument)
        );
        Ok(())
    }
}

impl TryFrom<usize> for Syscall {
    type Error = SyscallError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Getpid),
            5 => Ok(Syscall::Kill),
            6 => Ok(Syscall::Sbrk),
            7 => Ok(Syscall::Sleep),
            8 => Ok(Syscall::Uptime),
            9 => Ok(Syscall::Ps),
            10 => Ok(Syscall::Psinfo),
            11 => Ok(Syscall::Set),
            _ => Err(SyscallError::Unknown(value)),
        }
    }
}

/// Handle a system call.
///
/// # Safety
/// Called from `usertrap` in `trap.rs`.
#[unsafe(no_mangle)]
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    #[cfg(debug_assertions)]
    println!(
        "syscall {} called from proc {} ({})",
        trapframe.a7,
        *proc.inner.lock().pid,
        proc.data().name,
    );

    let result = match Syscall::try_from(trapframe.a7) {
        Ok(syscall) => match syscall {
            Syscall::Fork => sys_fork(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::Wait => sys_wait(&args),
            Syscall::Getpid => sys_getpid(&args),
            Syscall::Kill => sys_kill(&args),
            Syscall::Sbrk => sys_sbrk(&args),
            Syscall::Sleep => sys_sleep(&args),
            Syscall::Uptime => sys_uptime(&args),
            Syscall::Ps => sys_ps(&args),
            Syscall::Psinfo => sys_psinfo(&args),
            Syscall::Set => sys_set(&args),
        },
        Err(e) => Err(e),
    };

    trapframe.a0 = log!(result)
        .inspect_err(|e| {
            println!(
                "! syscall error ({}) from proc {} ({})",
                e,
                *proc.inner.lock().pid,
                proc.data().name,
            )
        })
        .unwrap_or(usize::MAX);

    #[cfg(debug_assertions)]
    println!("syscall {} -> {}", trapframe.a7, trapframe.a0);
}
