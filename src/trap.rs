use crate::kernelvec::kernelvec;
use crate::memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
use crate::plic;
use crate::println;
use crate::proc::{self, Channel, current_proc};
use crate::riscv::{
    PGSIZE, interrupts,
    registers::{satp, scause, sepc, sstatus, stimecmp, stval, stvec, time, tp},
};
use crate::spinlock::SpinLock;
use crate::syscall::syscall;
use crate::trampoline::{trampoline, userret, uservec};
use crate::uart::UART;

pub static TICKS: SpinLock<usize> = SpinLock::new(0, "time");

/// Handles an interrupt, exception, or system call from user space.
///
/// # Safety
/// Called from `trampoline.rs`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrap() {
    unsafe {
        assert!(
            (sstatus::read() & sstatus::SPP) == 0,
            "usertrap: not from user mode"
        );

        // send subsequent interrupts and exceptions to kerneltrap, since we are in kernel mode now
        stvec::write(kernelvec as *const () as usize);

        let proc = current_proc();
        let data = proc.data_mut();
        let trapframe = data.trapframe.as_mut().unwrap();

        // save user program counter in case this handler yields to another core, and the new
        // core switches to user space, overwriting sepc.
        trapframe.epc = sepc::read();

        let scause = scause::Scause::from(scause::read());
        let mut which_dev = None;

        match scause.cause() {
            scause::Trap::Exception(scause::Exception::EnvironmentCall) => {
                if proc.inner.lock().killed {
                    proc::exit(-1);
                }

                // sepc points to the ecall instruction; return to the next instruction.
                trapframe.epc += 4;

                // an interrupt will change sepc, scause, and sstatus, so enable only now that
                // we're done with those registers.
                interrupts::enable();

                syscall(trapframe);
            }

            scause::Trap::Interrupt(intr)
                if {
                    which_dev = dev_intr(intr);
                    which_dev.is_some()
                } => {}

            _ => {
                let mut inner = proc.inner.lock();

                println!(
                    "usertrap: unexpected scause=0x{:X} pid={:?} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    inner.pid,
                    sepc::read(),
                    stval::read(),
                );

                inner.killed = true;
            }
        }

        if proc.inner.lock().killed {
            proc::exit(-1);
        }

        if Some(InterruptType::Timer) == which_dev {
            proc::r#yield();
        }

        usertrapret();
    }
}

/// Returns to user space.
///
/// # Safety
/// Called from `usertrap()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrapret() {
    let proc = current_proc();

    // we're about to switch the destination of traps from kerneltrap() to usertrap(), so turn
    // off interrupts until we're back in user space, where usertrap() is correct.
    interrupts::disable();

    let trampoline_uservec =
        TRAMPOLINE + (uservec as *const () as usize - trampoline as *const () as usize);
    unsafe { stvec::write(trampoline_uservec) };

    let data = unsafe { proc.data_mut() };
    let trapframe = data.trapframe.as_mut().unwrap();
    trapframe.kernel_satp = unsafe { satp::read() };
    trapframe.kernel_sp = (data.kstack + PGSIZE).as_usize();
    trapframe.kernel_trap = usertrap as *const () as usize;
    trapframe.kernel_hartid = unsafe { tp::read() };

    // set Supervisor Previous Privilege mode to User.
    let mut x = unsafe { sstatus::read() };
    x &= !sstatus::SPP;
    x |= sstatus::SPIE;
    unsafe { sstatus::write(x) };

    unsafe { sepc::write(trapframe.epc) };

    let user_satp = satp::make(data.pagetable.as_ref().unwrap().as_pa().as_usize());

    unsafe {
        let trampoline_userret: usize =
            TRAMPOLINE + (userret as *const () as usize - trampoline as *const () as usize);
        let trampoline_userret: extern "C" fn(usize) -> ! =
            core::mem::transmute(trampoline_userret);
        trampoline_userret(user_satp);
    }
}

/// Interrupts and exceptions from the kernel go here via `kernelvec`, on whatever the current
/// kernel stack is.
///
/// # Safety
/// Called from `kernelvec.rs`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kerneltrap() {
    unsafe {
        let sepc = sepc::read();
        let sstatus = sstatus::read();
        let scause = scause::Scause::from(scause::read());

        assert!(
            sstatus & sstatus::SPP != 0,
            "kerneltrap: not from supervisor mode"
        );

        assert!(!interrupts::get(), "kerneltrap: interrupts enabled");

        let which_dev;

        match scause.cause() {
            scause::Trap::Interrupt(intr)
                if {
                    which_dev = dev_intr(intr);
                    which_dev.is_some()
                } => {}

            _ => {
                println!(
                    "scause=0x{:X} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    sepc::read(),
                    stval::read()
                );
                panic!("kerneltrap");
            }
        }

        // If we got a timer interrupt, give up the cpu for another process.
        if Some(InterruptType::Timer) == which_dev && proc::current_proc_opt().is_some() {
            proc::r#yield();
        }

        // yield() may have caused some traps to occur, so restore trap registers for use by
        // kernelvec's sepc instruction.
        sepc::write(sepc);
        sstatus::write(sstatus);
    }
}

/// Handles clock interrupts.
pub fn clock_intr() {
    let _lock = proc::lock_current_cpu();
    let hart = unsafe { proc::current_id() };

    if hart == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        proc::wakeup(Channel::Ticks);
    }

    // Ask for the next timer interrupt. This also clears the interrupt request.
    // 1_000_000 is about a tenth of a second.
    unsafe { stimecmp::write(time::read() + 1_000_000) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptType {
    Device,
    Timer,
}

/// Checks if an interrupt is from an external device or the software timer.
fn dev_intr(intr: scause::Interrupt) -> Option<InterruptType> {
    match intr {
        scause::Interrupt::SupervisorExternal => {
            let irq = plic::claim();

            match irq as usize {
                UART0_IRQ => UART.handle_interrupt(),
                VIRTIO0_IRQ => {}
                _ => println!("unexpected interrupt irq = {}", irq),
            }

            if irq != 0 {
                plic::complete(irq);
            }

            Some(InterruptType::Device)
        }

        scause::Interrupt::SupervisorTimer => {
            clock_intr();
            Some(InterruptType::Timer)
        }

        _ => None,
    }
}

/// Initializes the trap handling code.
pub fn init() {
    println!("trap init");
}

/// Sets up to take exceptions and traps while in the kernel.
///
/// # Safety
/// Must be called only once per hart during system initialization.
pub unsafe fn init_hart() {
    unsafe { stvec::write(kernelvec as *const () as usize) };
}
