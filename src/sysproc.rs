use crate::abi::{CpuInfo, ProcInfo};
use crate::param::{NCPU, NPROC};
use crate::proc::{self, Channel, Pid, current_proc};
use crate::syscall::{SyscallArgs, SyscallError};
use crate::trap::TICKS;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let n = args.get_int(0);
    proc::exit(n);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    match log!(proc::fork()) {
        Ok(pid) => Ok(*pid),
        Err(_) => Err(SyscallError::Proc("sys_fork")),
    }
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let addr = args.get_addr(0);
    match proc::wait(addr) {
        Some(pid) => Ok(*pid),
        None => err!(SyscallError::Proc("sys_wait")),
    }
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let size = args.get_int(0);
    let addr = args.proc().data().size;
    match unsafe { log!(proc::grow(size)) } {
        Ok(_) => Ok(addr),
        Err(_) => Err(SyscallError::Proc("sys_sbrk")),
    }
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let duration = args.get_int(0).max(0) as usize;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < duration {
        if current_proc().is_killed() {
            return Err(SyscallError::Proc("sys_sleep"));
        }
        ticks = proc::sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    // # Safety: used only to compare against already-allocated pids stored in the table.
    let pid = unsafe { Pid::from_usize(pid) };
    Ok(proc::kill(pid) as usize)
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    let ticks = *TICKS.lock();
    Ok(ticks)
}

/// Prints a process listing to the kernel console and returns how many processes it found.
pub fn sys_ps(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    Ok(proc::ps_enumerate())
}

/// Copies process and CPU snapshots out to user memory.
pub fn sys_psinfo(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let mut procs = [ProcInfo::zeroed(); NPROC];
    let mut cpus = [CpuInfo::zeroed(); NCPU];

    let (proc_count, cpu_count) = proc::psinfo_enumerate(&mut procs, &mut cpus);

    let procs_bytes = unsafe {
        core::slice::from_raw_parts(
            procs.as_ptr() as *const u8,
            proc_count * core::mem::size_of::<ProcInfo>(),
        )
    };
    let cpus_bytes = unsafe {
        core::slice::from_raw_parts(
            cpus.as_ptr() as *const u8,
            cpu_count * core::mem::size_of::<CpuInfo>(),
        )
    };
    let counts = [proc_count as i32, cpu_count as i32];
    let counts_bytes = unsafe {
        core::slice::from_raw_parts(
            counts.as_ptr() as *const u8,
            counts.len() * core::mem::size_of::<i32>(),
        )
    };

    args.copy_out(args.get_addr(0), procs_bytes)
        .map_err(|_| SyscallError::Proc("sys_psinfo"))?;
    args.copy_out(args.get_addr(1), cpus_bytes)
        .map_err(|_| SyscallError::Proc("sys_psinfo"))?;
    args.copy_out(args.get_addr(2), counts_bytes)
        .map_err(|_| SyscallError::Proc("sys_psinfo"))?;

    Ok(proc_count)
}

/// Sets the target process's scheduling priority.
pub fn sys_set(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    // # Safety: used only to compare against already-allocated pids stored in the table.
    let pid = unsafe { Pid::from_usize(pid) };
    let priority = args.get_int(1);

    Ok(proc::set_priority(pid, priority) as usize)
}
