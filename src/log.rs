//! Minimal stand-in for the on-disk write-ahead log.
//!
//! The process subsystem only needs the `Operation` begin/end bracket around filesystem
//! calls (`exec`, `exit`'s cwd release) so that nested calls nest correctly; there is no
//! real block device or journal to commit here.

use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

struct LogInner {
    outstanding: u32,
}

static LOG: SpinLock<LogInner> = SpinLock::new(LogInner { outstanding: 0 }, "log");

/// A guard that begins a log operation on creation and ends it on drop.
#[derive(Debug)]
pub struct Operation {
    success: bool,
}

impl Operation {
    pub fn begin() -> Self {
        begin_op();
        Self { success: false }
    }

    pub fn success(&mut self) {
        self.success = true;
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        end_op();
    }
}

fn begin_op() {
    let mut inner = LOG.lock();
    inner.outstanding += 1;
}

fn end_op() {
    let mut inner = LOG.lock();
    inner.outstanding -= 1;

    if inner.outstanding == 0 {
        proc::wakeup(Channel::Log);
    }
}
