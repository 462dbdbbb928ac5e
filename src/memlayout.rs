// Physical memory layout

// qemu -machine virt is set up like this,
// based on qemu's hw/riscv/virt.c:
//
// 00001000 -- boot ROM, provided by qemu
// 02000000 -- CLINT
// 0C000000 -- PLIC
// 10000000 -- uart0
// 10001000 -- virtio disk
// 80000000 -- boot ROM jumps here in machine mode
//             -kernel loads the kernel here
// unused RAM after 80000000.

// the kernel uses physical memory thus:
// 80000000 -- entry.rs, then kernel text and data
// end -- start of kernel page allocation area
// PHYSTOP -- end RAM used by the kernel

use crate::param::NKSTACK_PAGES;
use crate::riscv::{MAXVA, PGSIZE};

pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: usize = 10;

pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: usize = 1;

// Core Local Interrupter (CLINT)
pub const CLINT: usize = 0x0200_0000;
pub const fn clint_mtimecmp(hartid: usize) -> usize {
    CLINT + 0x4000 + 8 * hartid
}
pub const CLINT_MTIME: usize = CLINT + 0xBFF8; // Cycles since boot

// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0C00_0000;
pub const PLIC_PRIORITY: usize = PLIC;
pub const PLIC_PENDING: usize = PLIC + 0x1000;
pub const fn PLIC_SENABLE(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}
pub const fn PLIC_SPRIORITY(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}
pub const fn PLIC_SCLAIM(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

// the kernel expects there to be RAM for use by the kernel and user pages from physical
// address 0x8000_0000 to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

// Map the trampoline page to the highest address, in both user and kernel space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

// Map the trapframe just below the trampoline page.
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Virtual address of the kernel stack for process table slot `i`.
///
/// Each kernel stack is preceded by an unmapped guard page so a stack overflow faults
/// instead of silently corrupting the next process's stack. Slots therefore occupy
/// decreasing ranges of `NKSTACK_PAGES + 1` pages below the trapframe/trampoline pair.
pub const fn kstack(i: usize) -> usize {
    TRAPFRAME - (i + 1) * (NKSTACK_PAGES + 1) * PGSIZE
}
