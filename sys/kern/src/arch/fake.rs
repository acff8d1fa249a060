// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inert architecture backend for hosted builds.
//!
//! Unit tests (and any future simulator) run the portable kernel against
//! this module. Context switches are recorded but do not transfer
//! control, interrupt gating is a no-op, and the "active page table" is a
//! thread-local the test harness points wherever it likes.

use core::cell::Cell;

use crate::pagemap::PageTable;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        assert_eq!($left, $right)
    };
}

/// Saved machine state of a task, hosted flavor: just enough record
/// keeping for the scheduler and the tests to look at.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    /// Address-space root, by analogy with CR3.
    pub cr3: u64,
    /// Recorded entry point from `initialize_context`.
    pub entry: usize,
    /// Recorded entry arguments.
    pub arg0: u64,
    pub arg1: i64,
    /// Recorded initial stack top.
    pub stack_top: u64,
}

impl SavedState {
    /// Physical address of this task's top-level page table.
    pub fn page_table_root(&self) -> u64 {
        self.cr3
    }
}

thread_local! {
    static ACTIVE_ROOT: Cell<*mut PageTable> =
        Cell::new(core::ptr::null_mut());
    static CONTEXT_SWITCHES: Cell<usize> = Cell::new(0);
}

/// Emits one log record. Hosted, that's stdout, which `cargo test`
/// captures per test.
pub fn klog_write(args: core::fmt::Arguments<'_>) {
    std::println!("{args}");
}

/// Anything at or above the (hosted, synthetic) null guard counts as a
/// user address; tests exercise the rejection path with pointers below
/// it.
pub fn is_user_address(addr: u64) -> bool {
    addr >= 0x1000
}

/// Runs `body` with "interrupts disabled". There are no interrupts here.
pub fn without_interrupts<R>(body: impl FnOnce() -> R) -> R {
    body()
}

pub fn cli() {}

pub fn sti() {}

/// Parks the CPU. Hosted, there is nothing to park.
pub fn wait_for_interrupt() {}

/// Hosted stand-in for the context switch: bookkeeping only. Control
/// returns to the caller immediately, which is what lets scheduler tests
/// drive suspension paths to completion.
pub unsafe fn switch_context(
    _current: *mut SavedState,
    _next: *const SavedState,
) {
    CONTEXT_SWITCHES.with(|c| c.set(c.get() + 1));
}

/// Hosted stand-in for the restore-only switch out of interrupt context.
pub unsafe fn restore_context(_next: *const SavedState) {
    CONTEXT_SWITCHES.with(|c| c.set(c.get() + 1));
}

/// Number of (pretend) context switches this thread has performed.
pub fn context_switch_count() -> usize {
    CONTEXT_SWITCHES.with(|c| c.get())
}

/// Records the initial execution state for a fresh task.
pub fn initialize_context(
    save: &mut SavedState,
    entry: usize,
    arg0: u64,
    arg1: i64,
    stack_top: u64,
) {
    save.entry = entry;
    save.arg0 = arg0;
    save.arg1 = arg1;
    save.stack_top = stack_top;
    save.cr3 = ACTIVE_ROOT.with(|r| r.get()) as u64;
}

/// The page-table root faults resolve against. Tests point this at a
/// fixture tree with `set_active_page_table_root`.
pub fn active_page_table_root() -> *mut PageTable {
    ACTIVE_ROOT.with(|r| r.get())
}

pub fn set_active_page_table_root(root: *mut PageTable) {
    ACTIVE_ROOT.with(|r| r.set(root));
}

/// Halts the machine after an unrecoverable kernel fault. Hosted, a panic
/// is the closest analogue and keeps the test harness informative.
pub fn halt() -> ! {
    panic!("kernel halt");
}
