//! System-call numbers and the wire structs shared with user space.
//!
//! These types cross the kernel/user boundary byte-for-byte, so field order and width
//! are load-bearing: user-space tools build `proc_info`/`cpu_info`/`proc_cpu_num` records
//! with the same layout and expect `psinfo()` to fill them accordingly.

/// System call numbers, dispatched on in `syscall.rs`.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Getpid = 4,
    Kill = 5,
    Sbrk = 6,
    Sleep = 7,
    Uptime = 8,
    Ps = 9,
    Psinfo = 10,
    Set = 11,
}

/// Maximum name length carried in the introspection wire structs, including the NUL
/// terminator.
pub const NAME_LEN: usize = 16;

/// One process record filled in by `psinfo()`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcInfo {
    pub pid: i32,
    pub name: [u8; NAME_LEN],
    pub parent_name: [u8; NAME_LEN],
    pub state: [u8; NAME_LEN],
}

impl ProcInfo {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            name: [0; NAME_LEN],
            parent_name: [0; NAME_LEN],
            state: [0; NAME_LEN],
        }
    }
}

/// One CPU record filled in by `psinfo()`, emitted only for CPUs currently running a
/// process.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuInfo {
    pub cpu_num: i32,
    pub name: [u8; NAME_LEN],
}

impl CpuInfo {
    pub const fn zeroed() -> Self {
        Self {
            cpu_num: 0,
            name: [0; NAME_LEN],
        }
    }
}

/// `counts[0]` is the number of `ProcInfo` records filled in, `counts[1]` the number of
/// `CpuInfo` records filled in.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProcCpuNum {
    pub num: i32,
}

/// Copies `src` into a fixed `NAME_LEN` buffer, truncating and always leaving a NUL
/// terminator if the source was shorter than the buffer.
pub fn copy_name(src: &str) -> [u8; NAME_LEN] {
    let mut buf = [0u8; NAME_LEN];
    let bytes = src.as_bytes();
    let n = core::cmp::min(bytes.len(), NAME_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// The fixed ASCII spelling of each process state, NUL-padded to `NAME_LEN`.
pub fn state_name(state: &crate::proc::ProcState) -> [u8; NAME_LEN] {
    use crate::proc::ProcState;

    copy_name(match state {
        ProcState::Unused => "UNUSED",
        ProcState::Used => "USED",
        ProcState::Sleeping => "SLEEPING",
        ProcState::Runnable => "RUNNABLE",
        ProcState::Running => "RUNNING",
        ProcState::Zombie => "ZOMBIE",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcState;

    #[test_case]
    fn copy_name_truncates_and_nul_terminates() {
        let long = "a-name-that-is-too-long-for-the-buffer";
        let buf = copy_name(long);
        assert_eq!(&buf[..NAME_LEN - 1], &long.as_bytes()[..NAME_LEN - 1]);
        assert_eq!(buf[NAME_LEN - 1], 0);
    }

    #[test_case]
    fn copy_name_short_is_nul_padded() {
        let buf = copy_name("init");
        assert_eq!(&buf[..4], b"init");
        assert!(buf[4..].iter().all(|&b| b == 0));
    }

    #[test_case]
    fn state_name_covers_every_variant() {
        assert_eq!(&state_name(&ProcState::Unused)[..6], b"UNUSED");
        assert_eq!(&state_name(&ProcState::Used)[..4], b"USED");
        assert_eq!(&state_name(&ProcState::Sleeping)[..8], b"SLEEPING");
        assert_eq!(&state_name(&ProcState::Runnable)[..8], b"RUNNABLE");
        assert_eq!(&state_name(&ProcState::Running)[..7], b"RUNNING");
        assert_eq!(&state_name(&ProcState::Zombie)[..6], b"ZOMBIE");
    }

    #[test_case]
    fn zeroed_wire_structs_have_empty_names() {
        let p = ProcInfo::zeroed();
        assert_eq!(p.pid, 0);
        assert!(p.name.iter().all(|&b| b == 0));
        let c = CpuInfo::zeroed();
        assert_eq!(c.cpu_num, 0);
        assert!(c.name.iter().all(|&b| b == 0));
    }
}
