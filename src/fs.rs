//! Minimal filesystem surface.
//!
//! The process subsystem only needs a handful of filesystem operations: resolving a path
//! to an inode for `exec`, duplicating/releasing a process's current-working-directory
//! reference across `fork`/`exit`, and reading file content while loading an ELF image.
//! This module provides that surface without a real on-disk layout or block device; it is
//! a collaborator boundary, not a filesystem implementation. Paths the kernel actually needs
//! to `exec` (currently just `/init`) are backed by a small table of embedded bytes rather
//! than the zero-filled placeholder every other path gets, so loading them produces a real
//! ELF image instead of an all-zero one.

use core::fmt::Display;

use crate::param::NINODE;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoInode,
    NotFound,
    NotDir,
    Read,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NoInode => write!(f, "no free inode"),
            FsError::NotFound => write!(f, "path not found"),
            FsError::NotDir => write!(f, "not a directory"),
            FsError::Read => write!(f, "read error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Free,
    Dir,
    File,
    Device,
}

/// Cached inode data, protected by a sleeplock.
#[derive(Debug)]
pub struct InodeInner {
    pub valid: bool,
    pub r#type: InodeType,
    pub major: u16,
    pub nlink: u16,
    pub size: u32,
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            r#type: InodeType::Free,
            major: 0,
            nlink: 0,
            size: 0,
        }
    }
}

struct InodeMeta {
    dev: u32,
    inum: u32,
    r#ref: u32,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            r#ref: 0,
        }
    }
}

/// In-memory handle to an inode. `id` indexes the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    id: usize,
    pub dev: u32,
    pub inum: u32,
}

impl Default for Inode {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

impl Inode {
    pub const fn new(id: usize, dev: u32, inum: u32) -> Self {
        Self { id, dev, inum }
    }

    /// Looks up (or pins) the in-memory inode for `(dev, inum)`.
    pub fn get(dev: u32, inum: u32) -> Result<Self, FsError> {
        let mut meta = INODE_TABLE.meta.lock();

        let mut empty = None;
        for (id, m) in meta.iter_mut().enumerate() {
            if m.r#ref > 0 && m.dev == dev && m.inum == inum {
                m.r#ref += 1;
                return Ok(Self::new(id, dev, inum));
            }
            if empty.is_none() && m.r#ref == 0 {
                empty = Some(id);
            }
        }

        let id = empty.ok_or(FsError::NoInode)?;
        let m = &mut meta[id];
        m.dev = dev;
        m.inum = inum;
        m.r#ref = 1;

        Ok(Self::new(id, dev, inum))
    }

    /// Increments the reference count, returning a second handle to the same inode.
    pub fn dup(&self) -> Self {
        let mut meta = INODE_TABLE.meta.lock();
        meta[self.id].r#ref += 1;
        self.clone()
    }

    /// Locks the inode, populating it on first use.
    ///
    /// Reads the inode's real size from its backing store, the way `ilock` reads it off
    /// disk: an inode with embedded content (currently just `/init`) gets that content's
    /// length; everything else stays at size 0, since there is nothing behind it to read.
    pub fn lock(&self) -> SleepLockGuard<'static, InodeInner> {
        let mut inner = INODE_TABLE.inner[self.id].lock();

        if !inner.valid {
            inner.r#type = if self.inum == ROOT_INUM {
                InodeType::Dir
            } else {
                InodeType::File
            };
            inner.nlink = 1;
            inner.size = embedded_content(self.inum).map_or(0, |bytes| bytes.len() as u32);
            inner.valid = true;
        }

        inner
    }

    pub fn unlock(&self, guard: SleepLockGuard<'static, InodeInner>) {
        drop(guard);
    }

    /// Drops a reference; recycles the table slot once the count reaches zero.
    pub fn put(self) {
        let mut meta = INODE_TABLE.meta.lock();
        meta[self.id].r#ref = meta[self.id].r#ref.saturating_sub(1);
    }

    pub fn unlock_put(self, guard: SleepLockGuard<'static, InodeInner>) {
        self.unlock(guard);
        self.put();
    }

    /// Reads up to `buf.len()` bytes at `offset` into `buf`.
    ///
    /// Inodes backed by embedded content (§`embedded_content`) copy real bytes out of it;
    /// everything else has `size == 0`, so every read past offset 0 is truncated to
    /// nothing. Reads beyond `inner.size` are truncated and the rest of `buf` is left
    /// untouched either way.
    pub fn read(
        &self,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        offset: u32,
        buf: &mut [u8],
        _user_dst: bool,
    ) -> Result<u32, FsError> {
        if offset >= inner.size {
            return Ok(0);
        }

        let n = core::cmp::min(buf.len() as u32, inner.size - offset) as usize;
        match embedded_content(self.inum) {
            Some(content) => {
                let start = offset as usize;
                buf[..n].copy_from_slice(&content[start..start + n]);
            }
            None => buf[..n].fill(0),
        }
        Ok(n as u32)
    }
}

static INODE_TABLE: InodeTable = InodeTable::new();

struct InodeTable {
    meta: SpinLock<[InodeMeta; NINODE]>,
    inner: [SleepLock<InodeInner>; NINODE],
}

impl InodeTable {
    const fn new() -> Self {
        const META: InodeMeta = InodeMeta::new();
        const INNER: SleepLock<InodeInner> = SleepLock::new(InodeInner::new(), "inode");

        Self {
            meta: SpinLock::new([META; NINODE], "itable"),
            inner: [INNER; NINODE],
        }
    }
}

const ROOT_DEV: u32 = 1;
const ROOT_INUM: u32 = 1;

/// Reserved inode number for `/init`, the only path this kernel ever `exec`s from its own
/// code rather than on a user's request — it needs a real, readable ELF image, not the
/// zero-filled placeholder every other (unused) path resolves to.
const INIT_INUM: u32 = 2;

/// A tiny freestanding RISC-V ELF executable: one `PT_LOAD` segment mapping a single
/// instruction, `jal x0, 0` (jump to self), at `0x1000`. Just enough for `exec()` to
/// validate the header, map a segment, and hand control to a real (if trivial) user
/// program — standing in for the real `/init` binary a build of this kernel would link in.
#[rustfmt::skip]
const INIT_PROGRAM: &[u8] = &[
    // ELF64 header (64 bytes)
    0x7F, 0x45, 0x4C, 0x46,             // e_magic
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // e_ident[4..16]
    0x02, 0x00,                         // e_type = ET_EXEC
    0xF3, 0x00,                         // e_machine = EM_RISCV
    0x01, 0x00, 0x00, 0x00,             // e_version = 1
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // e_entry = 0x1000
    0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // e_phoff = 64
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // e_shoff = 0
    0x00, 0x00, 0x00, 0x00,             // e_flags = 0
    0x40, 0x00,                         // e_ehsize = 64
    0x38, 0x00,                         // e_phentsize = 56
    0x01, 0x00,                         // e_phnum = 1
    0x00, 0x00,                         // e_shentsize = 0
    0x00, 0x00,                         // e_shnum = 0
    0x00, 0x00,                         // e_shstrndx = 0
    // program header (56 bytes, at offset 64)
    0x01, 0x00, 0x00, 0x00,             // p_type = PT_LOAD
    0x01, 0x00, 0x00, 0x00,             // p_flags = PF_X
    0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_offset = 120
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_vaddr = 0x1000
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_paddr = 0x1000
    0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_filesz = 4
    0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_memsz = 4
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // p_align = 0x1000
    // code, at offset 120: `jal x0, 0`
    0x6F, 0x00, 0x00, 0x00,
];

/// Returns the embedded content backing `inum`, if any.
fn embedded_content(inum: u32) -> Option<&'static [u8]> {
    match inum {
        INIT_INUM => Some(INIT_PROGRAM),
        _ => None,
    }
}

/// A filesystem path, resolved relative to the root inode.
#[derive(Debug, Clone, Copy)]
pub struct Path<'a>(&'a str);

impl<'a> Path<'a> {
    pub fn new(path: &'a str) -> Self {
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        self.0
    }

    /// Resolves the path to an inode.
    ///
    /// This stub recognizes the root directory and `/init` (the one path the kernel
    /// exec's on its own), and otherwise hands back a fresh inode keyed on the path's
    /// content, so every distinct path name resolves consistently without requiring a
    /// real directory structure.
    pub fn resolve(&self) -> Result<Inode, FsError> {
        if self.0.is_empty() || self.0 == "/" {
            return Inode::get(ROOT_DEV, ROOT_INUM);
        }

        if self.0 == "/init" || self.0 == "init" {
            return Inode::get(ROOT_DEV, INIT_INUM);
        }

        let inum = 3 + (self.0.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32)) % (NINODE as u32 - 3));
        Inode::get(ROOT_DEV, inum)
    }
}

/// Initializes the filesystem on `rootdev`. Idempotent stand-in for mounting the root disk.
pub fn init(_rootdev: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn root_path_resolves_to_root_inode() {
        let a = Path::new("/").resolve().expect("root resolves");
        let b = Path::new("").resolve().expect("empty path resolves");
        assert_eq!(a.inum, ROOT_INUM);
        assert_eq!(b.inum, ROOT_INUM);
        a.put();
        b.put();
    }

    #[test_case]
    fn same_path_resolves_to_same_inode_consistently() {
        let a = Path::new("/bin/init").resolve().expect("path resolves");
        let b = Path::new("/bin/init").resolve().expect("path resolves");
        assert_eq!(a.inum, b.inum);
        a.put();
        b.put();
    }

    #[test_case]
    fn distinct_paths_resolve_to_distinct_inodes() {
        let a = Path::new("/bin/init").resolve().expect("path resolves");
        let b = Path::new("/bin/sh").resolve().expect("path resolves");
        assert_ne!(a.inum, b.inum);
        a.put();
        b.put();
    }
}
