#![no_std]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(crate::test::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

use core::sync::atomic::{AtomicBool, Ordering};

extern crate alloc;

#[macro_use]
pub(crate) mod printf;
#[macro_use]
pub(crate) mod error;
pub(crate) mod console;
pub(crate) mod entry;
pub(crate) mod exec;
pub(crate) mod file;
pub(crate) mod fs;
pub(crate) mod kalloc;
pub(crate) mod kernelvec;
pub(crate) mod log;
pub(crate) mod memlayout;
pub(crate) mod param;
pub(crate) mod plic;
pub(crate) mod proc;
pub(crate) mod riscv;
pub(crate) mod sleeplock;
pub(crate) mod spinlock;
pub(crate) mod start;
pub(crate) mod swtch;
pub(crate) mod sync;
pub(crate) mod syscall;
pub(crate) mod sysproc;
#[cfg(test)]
pub(crate) mod test;
pub(crate) mod trampoline;
pub(crate) mod trap;
pub(crate) mod uart;
pub(crate) mod vm;

pub mod abi;

static STARTED: AtomicBool = AtomicBool::new(false);

#[cfg(not(test))]
pub extern "C" fn main() -> ! {
    let cpu_id = unsafe { proc::current_id() };
    if cpu_id == 0 {
        unsafe {
            console::init();

            println!("");
            println!("kernel is booting");
            println!("");

            kalloc::init();
            vm::kinit();
            vm::init_hart();
            proc::init();
            trap::init();
            trap::init_hart();
            plic::init();
            plic::init_hart();
            proc::user_init();
        }

        println!("");
        println!("hart {} is starting", cpu_id);

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop()
        }

        println!("hart {} is starting", cpu_id);

        unsafe {
            vm::init_hart();
            trap::init_hart();
            plic::init_hart();
        }
    }

    unsafe { proc::scheduler() };
}

/// Boot entry point used by `cargo test`'s harness binary: brings up just enough of the
/// machine (console output, the physical and kernel page allocators) for the `#[test_case]`
/// functions scattered through the crate to run, then exits QEMU instead of scheduling.
///
/// Exported under the same name as the normal boot path's `main` since `start.rs`'s
/// `extern "C" { fn main() -> !; }` is compiled into the test binary too, and there is no
/// `main.rs` wrapper to provide it when the library itself is built as the test harness.
#[cfg(test)]
#[unsafe(export_name = "main")]
pub extern "C" fn main() -> ! {
    unsafe {
        console::init();
        kalloc::init();
        vm::kinit();
        vm::init_hart();
    }

    test_main();

    test::exit_qemu(test::QemuExitCode::Success);
}

pub fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    #[cfg(test)]
    {
        test::test_panic_handler(info)
    }
    #[cfg(not(test))]
    {
        printf::handle_panic(info)
    }
}
