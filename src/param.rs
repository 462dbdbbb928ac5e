// Number of CPUs (harts).
pub const NCPU: usize = 8;

// Maximum number of processes.
pub const NPROC: usize = 64;

// Open files per process.
pub const NOFILE: usize = 16;

// Open files per system.
pub const NFILE: usize = 100;

// Maximum number of active inodes.
pub const NINODE: usize = 50;

// Maximum major device number.
pub const NDEV: usize = 10;

// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

// Max exec arguments.
pub const MAXARG: usize = 32;

// Max number of blocks any FS operation writes to disk.
pub const MAXOPBLOCKS: usize = 10;

// Max data blocks in on-disk log.
pub const LOGBLOCKS: usize = MAXOPBLOCKS * 3;

// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

// Size of file system in blocks.
pub const FSSIZE: usize = 2000;

// Maximum file path name.
pub const MAXPATH: usize = 128;

// Pages per kernel stack. Debug builds run with extra guard margin for deep call stacks.
#[cfg(debug_assertions)]
pub const NKSTACK_PAGES: usize = 8;
#[cfg(not(debug_assertions))]
pub const NKSTACK_PAGES: usize = 1;

// Pages reserved for the user stack of a freshly exec'd process.
pub const USERSTACK: usize = 1;

// Default scheduling priority assigned to a process at allocation time.
// Lower numeric value preempts higher; this is the middle of the road.
pub const DEFAULT_PRIORITY: isize = 0;
