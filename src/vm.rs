#![allow(static_mut_refs)]

use alloc::boxed::Box;
use core::cmp::min;
use core::fmt::Display;
use core::mem::MaybeUninit;
use core::ops::{Add, Deref, DerefMut, Index, IndexMut};

use crate::fs::{Inode, InodeInner};
use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0, VIRTIO0};
use crate::param::NKSTACK_PAGES;
use crate::proc::PROC_TABLE;
use crate::riscv::{
    self, MAXVA, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X, pa_to_pte, pg_round_down, pg_round_up,
    pte_flags, pte_to_pa, px,
    registers::{satp, vma},
};
use crate::sync::OnceLock;
use crate::trampoline::trampoline;

// kernel.ld sets this to end of kernel code
unsafe extern "C" {
    fn etext();
}

pub static mut KVM: OnceLock<Kvm> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Alloc,
    InvalidAddress,
    InvalidPage,
    InvalidPte,
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Alloc => write!(f, "allocation error"),
            VmError::InvalidAddress => write!(f, "invalid address"),
            VmError::InvalidPage => write!(f, "invalid page"),
            VmError::InvalidPte => write!(f, "invalid pte"),
        }
    }
}

impl From<core::alloc::AllocError> for VmError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::Alloc
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PA(pub usize);

impl From<usize> for PA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl PA {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VA(pub usize);

impl From<usize> for VA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl VA {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl Default for VA {
    fn default() -> Self {
        VA::new(0)
    }
}

impl Add<usize> for VA {
    type Output = VA;
    fn add(self, rhs: usize) -> VA {
        VA(self.0 + rhs)
    }
}

#[repr(C, align(4096))]
#[derive(Debug, Clone)]
struct Page([u8; 4096]);

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PageTableEntry(usize);

impl PageTableEntry {
    /// Check if the PTE is valid.
    fn is_v(&self) -> bool {
        self.0 & PTE_V != 0
    }

    /// Check if the PTE is accessible by user mode instructions.
    fn is_u(&self) -> bool {
        self.0 & PTE_U != 0
    }

    /// Check if the PTE is writable.
    fn is_w(&self) -> bool {
        self.0 & PTE_W != 0
    }

    /// Return flags of the PTE (least significant 10 bits).
    fn flags(&self) -> usize {
        pte_flags(self.0)
    }

    /// Check if the PTE is a leaf (pointing to a PA).
    fn is_leaf(&self) -> bool {
        // If the PTE is a leaf, it should have at least one of the permission bits set.
        (self.0 & (PTE_X | PTE_W | PTE_R)) != 0
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

#[repr(C, align(4096))]
#[derive(Debug, Clone)]
struct RawPageTable([PageTableEntry; 512]);

impl RawPageTable {
    fn try_new() -> Result<*mut Self, VmError> {
        let memory: Box<MaybeUninit<RawPageTable>> = Box::try_new_zeroed()?;
        let memory = unsafe { memory.assume_init() };
        Ok(Box::into_raw(memory))
    }
}

impl Deref for RawPageTable {
    type Target = [PageTableEntry; 512];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RawPageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Index<usize> for RawPageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<usize> for RawPageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

#[derive(Debug, Clone)]
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self {
            ptr: RawPageTable::try_new()?,
        })
    }

    fn from_pa(pa: PA) -> Self {
        Self {
            ptr: pa.0 as *mut RawPageTable,
        }
    }

    pub fn as_pa(&self) -> PA {
        PA(self.ptr as usize)
    }

    fn walk(&mut self, va: VA, alloc: bool) -> Result<&mut PageTableEntry, VmError> {
        assert!(va.0 < MAXVA, "walk");

        let mut pagetable = self.ptr;

        unsafe {
            for level in (1..=2).rev() {
                let pte = (*pagetable)
                    .get_mut(px(level, va.0))
                    .expect("walk: valid pagetable");

                if pte.is_v() {
                    pagetable = pte.as_pa().0 as *mut RawPageTable;
                } else {
                    if !alloc {
                        return Err(VmError::InvalidPage);
                    }

                    pagetable = RawPageTable::try_new()?;
                    pte.0 = pa_to_pte(pagetable as usize) | PTE_V;
                }
            }

            Ok((*pagetable).get_mut(px(0, va.0)).unwrap())
        }
    }

    /// Looks up a virtual address, returning the physical address, or err if not mapped.
    /// Can only be used to look up user pages.
    fn walk_addr(&mut self, va: VA) -> Result<PA, VmError> {
        if va.0 > MAXVA {
            return Err(VmError::InvalidAddress);
        }

        let pte = self.walk(va, false)?;

        if !pte.is_v() || !pte.is_u() {
            return Err(VmError::InvalidPte);
        }

        Ok(pte.as_pa())
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to physical addresses
    /// starting at `pa`. `va` and `size` must be page-aligned.
    pub fn map_pages(&mut self, va: VA, pa: PA, size: usize, perm: usize) -> Result<(), VmError> {
        assert_eq!(va.0 % PGSIZE, 0, "map_pages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: size");

        let last = va.0 + size - PGSIZE;
        let mut va = va;
        let mut pa = pa.0;

        loop {
            let pte = self.walk(va, true)?;
            assert!(!pte.is_v(), "map_pages: remap");

            pte.0 = pa_to_pte(pa) | perm | PTE_V;

            if va.0 == last {
                break;
            }

            va.0 += PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Loads one program header's file-backed bytes into already-mapped user pages.
    pub fn load_elf_segment(
        &mut self,
        inode: &mut Inode,
        locked: &mut crate::sleeplock::SleepLockGuard<'static, InodeInner>,
        va: VA,
        offset: u32,
        size: usize,
    ) -> Result<(), VmError> {
        assert_eq!(va.0 % PGSIZE, 0, "load_elf_segment: va not aligned");

        for i in (0..size).step_by(PGSIZE) {
            let pa = self.walk_addr(VA(va.0 + i))?;
            let n = min(PGSIZE, size - i);

            let buf = unsafe { core::slice::from_raw_parts_mut(pa.0 as *mut u8, n) };
            let read = inode
                .read(locked, offset + i as u32, buf, false)
                .map_err(|_| VmError::InvalidAddress)?;

            if read as usize != n {
                return Err(VmError::InvalidAddress);
            }
        }

        Ok(())
    }

    /// Recursively frees page-table pages.
    /// All leaf mappings must already have been removed.
    pub fn free_walk(self) {
        let pagetable = unsafe { &mut *self.ptr };

        for pte in pagetable.iter_mut() {
            if pte.is_v() {
                if pte.is_leaf() {
                    panic!("free_walk: leaf");
                }

                let child = pte.as_pa();
                let mut child = PageTable::from_pa(child);
                child.free_walk();
                *pte = PageTableEntry(0);
            }
        }

        let _pt = unsafe { Box::from_raw(self.ptr) };
    }
}

#[derive(Debug)]
pub struct Kvm(PageTable);

impl Kvm {
    fn new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    pub fn map(&mut self, va: VA, pa: PA, size: usize, perm: usize) {
        if self.0.map_pages(va, pa, size, perm).is_err() {
            panic!("kvmmap");
        }
    }

    /// Builds the kernel's page table: device mappings, the kernel text/data identity
    /// mapping, the trampoline, and every process's kernel stack.
    ///
    /// # Safety
    /// Must only run once, before any hart has switched `satp` to this table.
    unsafe fn make(&mut self) {
        self.map(VA(UART0), PA(UART0), PGSIZE, PTE_R | PTE_W);
        self.map(VA(VIRTIO0), PA(VIRTIO0), PGSIZE, PTE_R | PTE_W);
        self.map(VA(PLIC), PA(PLIC), 0x40_0000, PTE_R | PTE_W);

        self.map(
            VA(KERNBASE),
            PA(KERNBASE),
            (etext as *const () as usize) - KERNBASE,
            PTE_R | PTE_X,
        );

        self.map(
            VA(etext as *const () as usize),
            PA(etext as *const () as usize),
            PHYSTOP - (etext as *const () as usize),
            PTE_R | PTE_W,
        );

        self.map(
            VA(TRAMPOLINE),
            PA(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        );

        unsafe { PROC_TABLE.map_stacks(self) };
    }
}

/// User page table.
#[derive(Debug)]
pub struct Uvm(pub PageTable);

impl Uvm {
    /// Creates an empty user page table.
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    /// Removes `npages` of mappings starting from `va`.
    /// `va` must be page-aligned and the mapping must exist.
    /// Optionally frees the physical memory.
    pub fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert!(va.0.is_multiple_of(PGSIZE), "unmap: not aligned");

        let mut va = va;
        for _ in 0..npages {
            match self.0.walk(va, false) {
                Err(_) => panic!("unmap: walk"),
                Ok(pte) if !pte.is_v() => panic!("unmap: not mapped"),
                Ok(pte) if !pte.is_leaf() => panic!("unmap: not a leaf"),
                Ok(pte) => {
                    if free {
                        let pa = pte.as_pa();
                        let _pa = unsafe { Box::from_raw(pa.0 as *mut Page) };
                    }
                    *pte = PageTableEntry(0);
                }
            }
            va.0 += PGSIZE;
        }
    }

    /// Maps one zeroed physical page at virtual address 0 and copies `src` into it.
    /// `src` must fit in a single page; used only to bootstrap the very first process.
    pub fn first(&mut self, src: &[u8]) -> Result<(), VmError> {
        assert!(src.len() < PGSIZE, "first: more than a page");

        let mem: Box<MaybeUninit<Page>> = Box::try_new_zeroed()?;
        let mem = unsafe { mem.assume_init() };
        let mem = Box::into_raw(mem);

        if let Err(err) = self
            .0
            .map_pages(VA(0), PA(mem as usize), PGSIZE, PTE_W | PTE_R | PTE_X | PTE_U)
        {
            let _pg = unsafe { Box::from_raw(mem) };
            return Err(err);
        }

        let page = unsafe { &mut *mem };
        page.0[..src.len()].copy_from_slice(src);

        Ok(())
    }

    /// Allocates PTEs and physical memory to grow process from `old_size` to `new_size`,
    /// which need not be page aligned.
    /// Returns the new process size or error.
    pub fn alloc(
        &mut self,
        old_size: usize,
        new_size: usize,
        xperm: usize,
    ) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        let old_size = pg_round_up(old_size);
        for i in (old_size..new_size).step_by(PGSIZE) {
            let mem = match Box::<Page>::try_new_zeroed() {
                Ok(mem) => unsafe { mem.assume_init() },
                Err(err) => {
                    self.dealloc(i, old_size);
                    return Err(err.into());
                }
            };

            let mem = Box::into_raw(mem);

            if let Err(err) =
                self.0
                    .map_pages(i.into(), (mem as usize).into(), PGSIZE, PTE_R | PTE_U | xperm)
            {
                let _pg = unsafe { Box::from_raw(mem) };
                self.dealloc(i, old_size);
                return Err(err);
            }
        }

        Ok(new_size)
    }

    /// Deallocates user pages to bring the process size from `old_size` to `new_size`.
    /// Returns the new process size.
    pub fn dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let original_new_size = new_size;
        let old_size = pg_round_up(old_size);
        let new_size = pg_round_up(new_size);

        if new_size < old_size {
            let npages = (old_size - new_size) / PGSIZE;
            self.unmap(new_size.into(), npages, true);
        }

        original_new_size
    }

    /// Marks the PTE at `va` as kernel-only, turning off `PTE_U`.
    /// Used to guard the page below the user stack so an overflow faults.
    pub fn clear(&mut self, va: VA) {
        let pte = self.0.walk(va, false).expect("clear: walk");
        pte.0 &= !PTE_U;
    }

    /// Copies the page table and physical memory of `self` into `new`, covering `[0, size)`.
    /// On failure, any pages already copied into `new` are released by the caller freeing `new`.
    pub fn copy(&mut self, new: &mut Uvm, size: usize) -> Result<(), VmError> {
        let mut i = 0;

        while i < size {
            let pte = self.0.walk(i.into(), false)?;
            assert!(pte.is_v(), "copy: page not present");

            let pa = pte.as_pa();
            let flags = pte.flags();

            let mem: Box<MaybeUninit<Page>> = Box::try_new_zeroed()?;
            let mut mem = unsafe { mem.assume_init() };

            let src = unsafe { core::slice::from_raw_parts(pa.0 as *const u8, PGSIZE) };
            mem.0.copy_from_slice(src);

            let mem_ptr = Box::into_raw(mem);

            if let Err(err) =
                new.0
                    .map_pages(i.into(), (mem_ptr as usize).into(), PGSIZE, flags)
            {
                let _pg = unsafe { Box::from_raw(mem_ptr) };
                return Err(err);
            }

            i += PGSIZE;
        }

        Ok(())
    }

    /// Frees user memory pages, then frees page-table pages.
    pub fn free(mut self, size: usize) {
        if size > 0 {
            self.unmap(0.into(), pg_round_up(size) / PGSIZE, true);
        }
        self.0.free_walk();
    }

    /// Frees a process's page table, and the physical memory it refers to.
    pub fn proc_free(mut self, size: usize) {
        self.unmap(TRAMPOLINE.into(), 1, false);
        self.unmap(TRAPFRAME.into(), 1, false);
        self.free(size);
    }

    /// Copies from kernel to user: bytes from `src` to virtual address `dstva`.
    pub fn copy_to(&mut self, mut src: &[u8], dstva: VA) -> Result<(), VmError> {
        let mut dstva = dstva.0;

        while !src.is_empty() {
            let va0 = pg_round_down(dstva);

            if va0 > MAXVA {
                return Err(VmError::InvalidAddress);
            }

            let pte = self.walk(va0.into(), false)?;

            if !pte.is_v() || !pte.is_u() || !pte.is_w() {
                return Err(VmError::InvalidPte);
            }

            let pa0 = pte.as_pa();
            let n = min(PGSIZE - (dstva - va0), src.len());

            unsafe {
                let src_ptr = src[..n].as_ptr();
                let dst_ptr = (pa0.0 + (dstva - va0)) as *mut u8;
                core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, n);
            }

            src = &src[n..];
            dstva = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copies from user to kernel: bytes from virtual address `srcva` into `dst`.
    pub fn copy_from(&mut self, srcva: VA, mut dst: &mut [u8]) -> Result<(), VmError> {
        let mut srcva = srcva.0;

        while !dst.is_empty() {
            let va0 = pg_round_down(srcva);
            let pa0 = self.walk_addr(va0.into())?;

            let n = min(PGSIZE - (srcva - va0), dst.len());

            unsafe {
                let src_ptr = (pa0.0 + (srcva - va0)) as *const u8;
                let dst_ptr = dst.as_mut_ptr();
                core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, n);
            }

            dst = &mut dst[n..];
            srcva = va0 + PGSIZE;
        }

        Ok(())
    }
}

impl Deref for Uvm {
    type Target = PageTable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Uvm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Initializes the kernel page table.
pub fn kinit() {
    unsafe {
        KVM.initialize(Kvm::new);
        KVM.get_mut().expect("kvm to be init").make();
    }
}

/// Switches the hardware page table register to the kernel's page table and enables paging.
pub fn init_hart() {
    unsafe {
        vma::sfence();
        satp::write(satp::make(KVM.get().unwrap().0.as_pa().0));
        vma::sfence();
    }
}
