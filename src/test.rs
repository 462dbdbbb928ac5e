//! Minimal custom test harness.
//!
//! This crate only ever targets bare-metal riscv64 (inline asm throughout rules out a
//! hosted `cargo test`), so there is no libtest to link against. `#[test_case]` functions
//! compiled under `cfg(test)` are collected by `custom_test_frameworks` and handed to
//! [`test_runner`], which runs them one at a time over the serial console and then shuts
//! QEMU down through its `virt` machine's test-finisher device, reporting pass/fail as the
//! process exit code.
//!
//! Tests run inside the single already-booted kernel instance (see `main` in `lib.rs`), so
//! they are restricted to logic that doesn't depend on state a previous case may have left
//! behind.

/// MMIO address of the `sifive_test` finisher device on QEMU's `virt` machine.
const TEST_DEVICE: usize = 0x10_0000;

const EXIT_SUCCESS: u32 = 0x5555;
const EXIT_FAILURE: u32 = 0x3333;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QemuExitCode {
    Success,
    Failed,
}

/// Shuts QEMU down by writing an exit code to the `virt` machine's test-finisher device.
///
/// # Safety
/// Only valid under QEMU's `virt` machine, and only once: the device halts the machine, so
/// any code after this call never runs.
pub fn exit_qemu(code: QemuExitCode) -> ! {
    let value = match code {
        QemuExitCode::Success => EXIT_SUCCESS,
        QemuExitCode::Failed => EXIT_FAILURE,
    };
    unsafe { core::ptr::write_volatile(TEST_DEVICE as *mut u32, value) };
    loop {
        core::hint::spin_loop();
    }
}

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        print!("{}...\t", core::any::type_name::<T>());
        self();
        println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    println!("all tests passed");
}

pub fn test_panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    println!("[failed]");
    println!("{info}");
    exit_qemu(QemuExitCode::Failed)
}
