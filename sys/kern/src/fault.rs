// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable halves of the fault handlers.
//!
//! The architecture layer owns the entry stubs; what it delegates here is
//! policy: a fault taken in user mode kills the offending task (by
//! unwinding to its recorded OS stack pointer with exit code
//! `128 + SIGSEGV`), a fault taken in kernel mode prints a diagnostic
//! frame and halts. Page faults get a chance at recovery first.

use abi::LogLevel;

use crate::err::KResult;
use crate::pagemap::{self, PageFaultErrorCode};
use crate::startup::Kernel;

/// Exit code reported for a task terminated by an unrecoverable fault.
pub fn kill_exit_code() -> i32 {
    128 + abi::SIGSEGV
}

/// Unwind directive for the architecture layer: switch to
/// `os_stack_pointer` and return `exit_code` to the app runner, exactly
/// as the `exit` syscall would.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct KillDirective {
    pub os_stack_pointer: u64,
    pub exit_code: i32,
}

/// Handles a fault raised by user code: logs it and tells the entry stub
/// where to unwind to.
pub fn kill_current_task(kernel: &mut Kernel, what: &str) -> KillDirective {
    let task = kernel.tasks.current_task();
    klog!(
        LogLevel::Warn,
        "task {} killed: {}",
        task.id().0,
        what
    );
    KillDirective {
        os_stack_pointer: task.os_stack_pointer(),
        exit_code: kill_exit_code(),
    }
}

/// Attempts to service a page fault for the task on the CPU. `Ok(())`
/// means the page is now mapped and the faulting instruction can simply
/// be retried; `Err` means the fault is genuine and the caller should
/// proceed to the kill/diagnostic path.
pub fn handle_page_fault(
    kernel: &mut Kernel,
    error_code: u64,
    causal_addr: u64,
) -> KResult<()> {
    let root = crate::arch::active_page_table_root();
    let Kernel { tasks, frames, .. } = kernel;
    pagemap::handle_page_fault(
        tasks.current_task(),
        root,
        &mut **frames,
        PageFaultErrorCode::from_bits_truncate(error_code),
        causal_addr,
    )
}

/// Terminal handler for faults taken in kernel mode: report and stop.
pub fn kernel_fault(what: &str, rip: u64, error_code: u64, addr: u64) -> ! {
    klog!(
        LogLevel::Error,
        "kernel fault: {what} rip={rip:#x} error={error_code:#x} addr={addr:#x}"
    );
    crate::arch::halt()
}
