// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for x86-64 PCs.
//!
//! # Entry sequences
//!
//! Three kinds of traps bring us in from user (or interrupted kernel)
//! code, and each has a different save discipline:
//!
//! - **Syscalls** arrive via the `syscall` instruction at
//!   `__syscall_entry`. The callee-saved registers the dispatcher might
//!   disturb, plus the user return state (`rcx`/`r11`), are parked on the
//!   user stack; the entry then hops onto the task's kernel stack (the
//!   recorded "OS stack pointer") and calls the portable dispatcher with
//!   the arguments still in their C ABI registers. `exit` is special: it
//!   unwinds straight back to the frame `__call_app` left on the kernel
//!   stack instead of `sysretq`-ing.
//!
//! - **The LAPIC timer interrupt** must be able to context-switch away
//!   from whatever it interrupted, so its stub deposits the *complete*
//!   machine state, FPU/SIMD area included, as a `SavedState` on the
//!   interrupt stack before calling into the timer service. If no switch
//!   happens the state is restored from that same copy. The platform is
//!   expected to install this vector with an IST stack, since the
//!   interrupted context may still be on the user stack during a syscall
//!   entry.
//!
//! - **Faults** only need their stubs to preserve scratch registers: a
//!   fault either returns to the interrupted instruction (page fault
//!   serviced), kills the current task by unwinding to its OS stack
//!   pointer (user-mode fault), or never returns at all (kernel-mode
//!   fault).
//!
//! The end-of-interrupt write always precedes a context switch out of an
//! interrupt handler; the outgoing context will not return to the handler
//! to issue it.
//!
//! Interrupt descriptor installation itself is platform init's job; the
//! `vector_table` function hands it our entry points.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use abi::TaskId;

use crate::ipc::Message;
use crate::pagemap::PageTable;
use crate::startup::Kernel;
use crate::syscalls::SyscallArgs;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed");
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            panic!("assertion failed");
        }
    };
}

/// Kernel code segment selector (GDT entry 1), as set up by platform
/// init.
pub const KERNEL_CS: u16 = 1 << 3;
/// Kernel stack segment selector (GDT entry 2).
pub const KERNEL_SS: u16 = 2 << 3;

/// Interrupt vector numbers for the devices the kernel itself services.
pub const XHCI_VECTOR: u8 = 0x40;
pub const LAPIC_TIMER_VECTOR: u8 = 0x41;

/// Saved machine state of a task.
///
/// The layout is load-bearing: the context-switch and interrupt assembly
/// below store and load fields by fixed offset, and the offsets are
/// pinned by the assertions at the bottom of this file. The FPU/SIMD area
/// is a raw `fxsave` image and needs 16-byte alignment.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct SavedState {
    pub cr3: u64,      // 0x00
    pub rip: u64,      // 0x08
    pub rflags: u64,   // 0x10
    pub reserved1: u64,
    pub cs: u64,       // 0x20
    pub ss: u64,       // 0x28
    pub fs: u64,       // 0x30
    pub gs: u64,       // 0x38
    pub rax: u64,      // 0x40
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,      // 0x60
    pub rsi: u64,
    pub rsp: u64,      // 0x70
    pub rbp: u64,
    pub r8: u64,       // 0x80
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,      // 0xb8
    pub fxsave_area: [u8; 512], // 0xc0
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            cr3: 0,
            rip: 0,
            rflags: 0,
            reserved1: 0,
            cs: 0,
            ss: 0,
            fs: 0,
            gs: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rdi: 0,
            rsi: 0,
            rsp: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            fxsave_area: [0; 512],
        }
    }
}

impl SavedState {
    /// Physical address of this task's top-level page table.
    pub fn page_table_root(&self) -> u64 {
        self.cr3
    }
}

use static_assertions::const_assert_eq;
const_assert_eq!(core::mem::size_of::<SavedState>(), 0xc0 + 512);
const_assert_eq!(core::mem::offset_of!(SavedState, rax), 0x40);
const_assert_eq!(core::mem::offset_of!(SavedState, rdi), 0x60);
const_assert_eq!(core::mem::offset_of!(SavedState, rsp), 0x70);
const_assert_eq!(core::mem::offset_of!(SavedState, r8), 0x80);
const_assert_eq!(core::mem::offset_of!(SavedState, fxsave_area), 0xc0);

/// Pointer to the one `Kernel`, for the benefit of the entry sequences.
static mut KERNEL: Option<NonNull<Kernel>> = None;

/// Records `kernel` as the kernel context.
///
/// # Safety
///
/// Call once, from `start_kernel`, before interrupts are enabled.
pub unsafe fn set_kernel(kernel: &'static mut Kernel) {
    let slot = &mut *core::ptr::addr_of_mut!(KERNEL);
    uassert!(slot.is_none());
    *slot = Some(NonNull::from(kernel));
}

/// Manufactures a mutable reference to the kernel context from thin air
/// and hands it to `body`. This bypasses borrow checking and should only
/// be used at kernel entry points.
///
/// # Safety
///
/// Sound on this single CPU as long as every flow of control that could
/// observe a half-updated kernel runs with interrupts disabled -- which
/// is the concurrency rule the whole kernel is built on. A suspended
/// syscall (one that slept inside `read_event` or `wait_finish`) does
/// hold a reference across its suspension; the scheduler only resumes it
/// in task context, never inside another entry sequence.
pub unsafe fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    let k = (*core::ptr::addr_of_mut!(KERNEL))
        .expect("kernel not started");
    body(&mut *k.as_ptr())
}

// --------------------------------------------------------------------
// Interrupt gating
// --------------------------------------------------------------------

pub fn cli() {
    // Safety: flipping IF has no memory-safety consequences.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
}

pub fn sti() {
    // Safety: as for `cli`.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

fn interrupts_enabled() -> bool {
    let rflags: u64;
    // Safety: reads flags only.
    unsafe {
        core::arch::asm!("pushfq", "pop {}", out(reg) rflags,
            options(nomem, preserves_flags));
    }
    rflags & 0x200 != 0
}

/// Runs `body` with interrupts disabled, restoring the previous state
/// afterwards. This is the uniprocessor lock.
pub fn without_interrupts<R>(body: impl FnOnce() -> R) -> R {
    let was_enabled = interrupts_enabled();
    cli();
    let r = body();
    if was_enabled {
        sti();
    }
    r
}

/// Parks the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    // Safety: `hlt` with interrupts enabled just waits.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
}

/// Stops for good, after a kernel-mode fault.
pub fn halt() -> ! {
    loop {
        cli();
        // Safety: final resting state.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
    }
}

/// User addresses occupy the upper half of the canonical space; anything
/// with bit 63 clear belongs to the kernel identity map and is rejected
/// at the syscall boundary.
pub fn is_user_address(addr: u64) -> bool {
    addr & (1 << 63) != 0
}

// --------------------------------------------------------------------
// Logging sink
// --------------------------------------------------------------------

static mut CONSOLE: Option<&'static mut dyn core::fmt::Write> = None;

/// Points the kernel log at a sink (the serial console, normally).
///
/// # Safety
///
/// Call once during platform init, before interrupts are enabled.
pub unsafe fn set_console(sink: &'static mut dyn core::fmt::Write) {
    *core::ptr::addr_of_mut!(CONSOLE) = Some(sink);
}

/// Emits one log record, if a sink is registered.
pub fn klog_write(args: core::fmt::Arguments<'_>) {
    without_interrupts(|| {
        // Safety: single CPU, interrupts disabled, sink registered once.
        let console = unsafe { &mut *core::ptr::addr_of_mut!(CONSOLE) };
        if let Some(sink) = console {
            let _ = sink.write_fmt(args);
            let _ = sink.write_str("\n");
        }
    })
}

// --------------------------------------------------------------------
// Context switching
// --------------------------------------------------------------------

extern "C" {
    fn __switch_context(next: *const SavedState, current: *mut SavedState);
    fn __restore_context(next: *const SavedState);
}

/// Saves the running context into `current` and resumes `next`. Returns
/// when somebody switches back to `current`.
///
/// # Safety
///
/// Both pointers must reference live, correctly initialized save areas,
/// and `next` must describe a context that is legal to resume.
pub unsafe fn switch_context(
    current: *mut SavedState,
    next: *const SavedState,
) {
    __switch_context(next, current);
}

/// Resumes `next` without saving anything; the running context is
/// abandoned. Used on the way out of interrupt handlers and task
/// termination.
///
/// # Safety
///
/// As for `switch_context`. Does not return.
pub unsafe fn restore_context(next: *const SavedState) {
    __restore_context(next);
}

core::arch::global_asm!(
    r#"
.global __switch_context
.global __restore_context

// __switch_context(next = rdi, current = rsi)
__switch_context:
    mov [rsi + 0x40], rax
    mov [rsi + 0x48], rbx
    mov [rsi + 0x50], rcx
    mov [rsi + 0x58], rdx
    mov [rsi + 0x60], rdi
    mov [rsi + 0x68], rsi
    lea rax, [rsp + 8]          // rsp as it will be after our return
    mov [rsi + 0x70], rax
    mov [rsi + 0x78], rbp
    mov [rsi + 0x80], r8
    mov [rsi + 0x88], r9
    mov [rsi + 0x90], r10
    mov [rsi + 0x98], r11
    mov [rsi + 0xa0], r12
    mov [rsi + 0xa8], r13
    mov [rsi + 0xb0], r14
    mov [rsi + 0xb8], r15
    mov rax, cr3
    mov [rsi + 0x00], rax
    mov rax, [rsp]              // return address doubles as resume rip
    mov [rsi + 0x08], rax
    pushfq
    pop qword ptr [rsi + 0x10]
    xor rax, rax
    mov ax, cs
    mov [rsi + 0x20], rax
    mov ax, ss
    mov [rsi + 0x28], rax
    mov ax, fs
    mov [rsi + 0x30], rax
    mov ax, gs
    mov [rsi + 0x38], rax
    fxsave [rsi + 0xc0]
    // fall through into the restore

// __restore_context(next = rdi)
__restore_context:
    // Build an iretq frame so privilege, stack, and flags all swap
    // atomically.
    push qword ptr [rdi + 0x28] // ss
    push qword ptr [rdi + 0x70] // rsp
    push qword ptr [rdi + 0x10] // rflags
    push qword ptr [rdi + 0x20] // cs
    push qword ptr [rdi + 0x08] // rip
    fxrstor [rdi + 0xc0]
    mov rax, [rdi + 0x00]
    mov cr3, rax
    mov rax, [rdi + 0x30]
    mov fs, ax
    mov rax, [rdi + 0x38]
    mov gs, ax
    mov rax, [rdi + 0x40]
    mov rbx, [rdi + 0x48]
    mov rcx, [rdi + 0x50]
    mov rdx, [rdi + 0x58]
    mov rsi, [rdi + 0x68]
    mov rbp, [rdi + 0x78]
    mov r8,  [rdi + 0x80]
    mov r9,  [rdi + 0x88]
    mov r10, [rdi + 0x90]
    mov r11, [rdi + 0x98]
    mov r12, [rdi + 0xa0]
    mov r13, [rdi + 0xa8]
    mov r14, [rdi + 0xb0]
    mov r15, [rdi + 0xb8]
    mov rdi, [rdi + 0x60]       // last, it was our argument register
    iretq
"#
);

/// Fills in the initial machine context for a fresh kernel-mode task:
/// entry point in `rip`, its two arguments in the C ABI registers, a
/// 16-byte-aligned stack, the shared address-space root, and an FPU area
/// with all exceptions masked.
pub fn initialize_context(
    save: &mut SavedState,
    entry: usize,
    arg0: u64,
    arg1: i64,
    stack_top: u64,
) {
    *save = SavedState::default();
    save.rip = entry as u64;
    save.rdi = arg0;
    save.rsi = arg1 as u64;
    save.cr3 = read_cr3();
    save.rflags = 0x202; // IF set
    save.cs = u64::from(KERNEL_CS);
    save.ss = u64::from(KERNEL_SS);
    save.rsp = (stack_top & !0xf) - 8;
    // x87 control word: mask all exceptions.
    save.fxsave_area[0] = 0x7f;
    save.fxsave_area[1] = 0x03;
    // MXCSR: mask all SSE exceptions.
    save.fxsave_area[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
}

fn read_cr3() -> u64 {
    let v: u64;
    // Safety: reading CR3 has no side effects at CPL 0.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack));
    }
    v
}

/// The PML4 of the address space on the CPU right now.
pub fn active_page_table_root() -> *mut PageTable {
    read_cr3() as *mut PageTable
}

// --------------------------------------------------------------------
// Syscall entry
// --------------------------------------------------------------------

const IA32_EFER: u32 = 0xc000_0080;
const IA32_STAR: u32 = 0xc000_0081;
const IA32_LSTAR: u32 = 0xc000_0082;
const IA32_FMASK: u32 = 0xc000_0084;

unsafe fn write_msr(msr: u32, value: u64) {
    core::arch::asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nomem, nostack),
    );
}

/// Enables the `syscall` instruction and points it at our entry
/// sequence. The STAR layout matches the GDT platform init builds:
/// kernel CS/SS from selectors 8/16, user CS/SS derived from base 16|3
/// the way `sysretq` insists.
///
/// # Safety
///
/// Call once during startup, before any task reaches user mode.
pub unsafe fn init_syscall() {
    write_msr(IA32_EFER, 0x0501);
    write_msr(IA32_LSTAR, __syscall_entry as usize as u64);
    write_msr(IA32_STAR, 8u64 << 32 | (16u64 | 3) << 48);
    write_msr(IA32_FMASK, 0);
}

extern "C" {
    fn __syscall_entry();
    fn __call_app(
        argc: i32,
        argv: *const *const u8,
        ss: u64,
        rip: u64,
        rsp: u64,
        os_stack_slot: *mut u64,
    ) -> i32;
}

/// Drops into user mode at `rip`/`rsp` with the given data selector
/// (`ss`; the code selector is `ss + 8` as the STAR layout requires),
/// recording the kernel stack pointer in `os_stack_slot` first. Returns
/// only when the app exits or is killed, with its exit code.
///
/// # Safety
///
/// `rip`/`rsp` must be mapped user memory in the current address space,
/// and `os_stack_slot` must point at the current task's OS stack slot.
pub unsafe fn call_app(
    argc: i32,
    argv: *const *const u8,
    ss: u16,
    rip: u64,
    rsp: u64,
    os_stack_slot: *mut u64,
) -> i32 {
    __call_app(argc, argv, u64::from(ss), rip, rsp, os_stack_slot)
}

/// Reports the current task's recorded OS stack pointer to the syscall
/// entry assembly.
#[no_mangle]
unsafe extern "C" fn current_task_os_stack_pointer() -> u64 {
    with_kernel(|k| k.tasks.current_task().os_stack_pointer())
}

/// Portable dispatch, in C ABI clothing for the entry assembly. Returns
/// the `(value, error)` pair in `rax:rdx`.
#[no_mangle]
unsafe extern "C" fn syscall_entry(
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
    nr: u64,
) -> abi::SyscallResult {
    with_kernel(|k| {
        crate::syscalls::dispatch(
            k,
            &SyscallArgs {
                nr,
                args: [a1, a2, a3, a4, a5, a6],
            },
        )
    })
}

core::arch::global_asm!(
    r#"
.global __syscall_entry
.global __call_app

// Entered by the `syscall` instruction: rcx = user rip, r11 = user
// rflags, rax = syscall number, arguments in rdi rsi rdx r10 r8 r9.
__syscall_entry:
    // Park what sysretq will need (and rbx, which carries the number
    // across the dispatcher call) on the user stack.
    push rbp
    push rcx
    push r11
    push rbx
    mov rbx, rax
    mov rbp, rsp
    // The helper call clobbers the argument registers; spill them.
    push rdi
    push rsi
    push rdx
    push r10
    push r8
    push r9
    cli
    call current_task_os_stack_pointer
    sti
    pop r9
    pop r8
    pop r10
    pop rdx
    pop rsi
    pop rdi
    // Hop onto the task's kernel stack and dispatch.
    mov rsp, rax
    and rsp, -16
    mov rcx, r10                // arg 4 into its C ABI register
    push rbx                    // seventh argument: the syscall number,
    push rbx                    // twice to keep the call site 16-aligned
    call syscall_entry
    mov rsp, rbp                // back to the parked user-stack frame
    cmp rbx, 2                  // exit?
    je 2f
    pop rbx
    pop r11
    pop rcx
    pop rbp
    sysretq

2:  // Exit: rax holds the recorded OS stack pointer, rdx the exit code.
    // Unwind into the frame __call_app left behind and return the code
    // to the app runner.
    mov rsp, rax
    mov eax, edx
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// __call_app(argc = rdi, argv = rsi, ss|3 = rdx, rip = rcx, user rsp =
// r8, &os_stack_slot = r9). Records the kernel stack for the exit
// unwind, then far-returns into ring 3.
__call_app:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [r9], rsp
    push rdx                    // ss
    push r8                     // rsp
    add rdx, 8
    push rdx                    // cs = ss + 8
    push rcx                    // rip
    retfq
"#
);

// --------------------------------------------------------------------
// Interrupt handlers
// --------------------------------------------------------------------

/// Hardware interrupt frame, as pushed by the CPU.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Timer interrupt, after the stub has parked the full interrupted
/// context: advance time, acknowledge, and preempt if the quantum
/// expired. EOI must come first; if we switch, nobody returns here to
/// issue it.
#[no_mangle]
unsafe extern "C" fn timer_interrupt_entry(ctx: *const SavedState) {
    with_kernel(|k| {
        let preemption_due = k.timers.tick(&mut k.tasks);
        lapic::end_of_interrupt();
        if preemption_due {
            k.tasks.preempt(&*ctx);
        }
    })
}

/// xHCI interrupt: hand the event to the USB service task and get out.
#[no_mangle]
unsafe extern "C" fn xhci_interrupt_entry() {
    with_kernel(|k| {
        let _ = k.tasks.send_message(TaskId::USB, Message::InterruptXhci);
    });
    lapic::end_of_interrupt();
}

static FAULT_NAMES: [&str; 21] = [
    "#DE", "#DB", "NMI", "#BP", "#OF", "#BR", "#UD", "#NM", "#DF", "CSO",
    "#TS", "#NP", "#SS", "#GP", "#PF", "-", "#MF", "#AC", "#MC", "#XM",
    "#VE",
];

/// Common fault policy, shared by every vector stub. A zero
/// `os_stack_pointer` in the returned directive tells the stub to just
/// `iretq` (nothing to do -- currently only the page-fault path uses
/// that); otherwise the stub unwinds the current task out of existence.
#[no_mangle]
unsafe extern "C" fn fault_entry(
    vector: u64,
    error_code: u64,
    frame: *const InterruptFrame,
) -> crate::fault::KillDirective {
    let frame = &*frame;
    let name: &str =
        FAULT_NAMES.get(vector as usize).copied().unwrap_or("#??");
    if frame.cs & 3 == 3 {
        with_kernel(|k| crate::fault::kill_current_task(k, name))
    } else {
        crate::fault::kernel_fault(name, frame.rip, error_code, 0)
    }
}

/// Page-fault flavor: try demand paging first; only genuine faults fall
/// through to the kill/diagnostic policy.
#[no_mangle]
unsafe extern "C" fn page_fault_entry(
    error_code: u64,
    cr2: u64,
    frame: *const InterruptFrame,
) -> crate::fault::KillDirective {
    let recovered =
        with_kernel(|k| crate::fault::handle_page_fault(k, error_code, cr2));
    if recovered.is_ok() {
        return crate::fault::KillDirective {
            os_stack_pointer: 0,
            exit_code: 0,
        };
    }

    let frame = &*frame;
    if frame.cs & 3 == 3 {
        with_kernel(|k| crate::fault::kill_current_task(k, "#PF"))
    } else {
        crate::fault::kernel_fault("#PF", frame.rip, error_code, cr2)
    }
}

core::arch::global_asm!(
    r#"
.macro PUSH_SCRATCH
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
.endm

.macro POP_SCRATCH
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
.endm

// Shared kill path: rax = OS stack pointer to unwind to, edx = exit
// code. Mirrors the exit unwind in __syscall_entry.
__fault_unwind:
    mov rsp, rax
    mov eax, edx
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// Fault without a hardware error code. Frame: [rsp] = rip.
.macro FAULT_NOERR name, vec
.global __fault_\name
__fault_\name:
    PUSH_SCRATCH
    mov rdi, \vec
    xor esi, esi
    lea rdx, [rsp + 72]
    cld
    call fault_entry
    test rax, rax
    jnz __fault_unwind
    POP_SCRATCH
    iretq
.endm

// Fault with a hardware error code. Frame: [rsp] = error, [rsp+8] = rip.
.macro FAULT_ERR name, vec
.global __fault_\name
__fault_\name:
    PUSH_SCRATCH
    sub rsp, 8                  // call-site alignment
    mov rdi, \vec
    mov rsi, [rsp + 80]
    lea rdx, [rsp + 88]
    cld
    call fault_entry
    test rax, rax
    jnz __fault_unwind
    add rsp, 8
    POP_SCRATCH
    add rsp, 8                  // drop the error code
    iretq
.endm

FAULT_NOERR de, 0
FAULT_NOERR db, 1
FAULT_NOERR bp, 3
FAULT_NOERR of, 4
FAULT_NOERR br, 5
FAULT_NOERR ud, 6
FAULT_NOERR nm, 7
FAULT_ERR   df, 8
FAULT_ERR   ts, 10
FAULT_ERR   np, 11
FAULT_ERR   ss, 12
FAULT_ERR   gp, 13
FAULT_NOERR mf, 16
FAULT_ERR   ac, 17
FAULT_NOERR mc, 18
FAULT_NOERR xm, 19
FAULT_NOERR ve, 20

// Page fault: like FAULT_ERR, but CR2 rides along and recovery is
// common enough that the iretq path is the hot one.
.global __fault_pf
__fault_pf:
    PUSH_SCRATCH
    sub rsp, 8
    mov rdi, [rsp + 80]
    mov rsi, cr2
    lea rdx, [rsp + 88]
    cld
    call page_fault_entry
    test rax, rax
    jnz __fault_unwind
    add rsp, 8
    POP_SCRATCH
    add rsp, 8
    iretq

// xHCI device interrupt: scratch save only, no switch ever happens
// here.
.global __xhci_interrupt
__xhci_interrupt:
    PUSH_SCRATCH
    sub rsp, 8
    cld
    call xhci_interrupt_entry
    add rsp, 8
    POP_SCRATCH
    iretq

// LAPIC timer: build a complete SavedState on the (IST) stack and hand
// it to the timer service, which may never come back.
.global __timer_interrupt
__timer_interrupt:
    push rbp
    mov rbp, rsp
    // Frame relative to rbp: [rbp] = saved rbp, +8 rip, +16 cs,
    // +24 rflags, +32 rsp, +40 ss.
    sub rsp, 512
    fxsave [rsp]
    push r15
    push r14
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push qword ptr [rbp]        // rbp
    push qword ptr [rbp + 32]   // rsp
    push rsi
    push rdi
    push rdx
    push rcx
    push rbx
    push rax
    xor rax, rax
    mov ax, gs
    push rax
    mov ax, fs
    push rax
    push qword ptr [rbp + 40]   // ss
    push qword ptr [rbp + 16]   // cs
    push rbp                    // reserved1 slot
    push qword ptr [rbp + 24]   // rflags
    push qword ptr [rbp + 8]    // rip
    mov rax, cr3
    push rax
    mov rdi, rsp
    cld
    call timer_interrupt_entry
    // No switch happened; unwind the SavedState we built.
    add rsp, 64                 // cr3 rip rflags reserved cs ss fs gs
    pop rax
    pop rbx
    pop rcx
    pop rdx
    pop rdi
    pop rsi
    add rsp, 16                 // rsp, rbp (restored below / by iretq)
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    fxrstor [rsp]
    add rsp, 512
    pop rbp
    iretq
"#
);

extern "C" {
    fn __fault_de();
    fn __fault_db();
    fn __fault_bp();
    fn __fault_of();
    fn __fault_br();
    fn __fault_ud();
    fn __fault_nm();
    fn __fault_df();
    fn __fault_ts();
    fn __fault_np();
    fn __fault_ss();
    fn __fault_gp();
    fn __fault_pf();
    fn __fault_mf();
    fn __fault_ac();
    fn __fault_mc();
    fn __fault_xm();
    fn __fault_ve();
    fn __xhci_interrupt();
    fn __timer_interrupt();
}

/// Every vector the kernel wants installed, for platform init to feed
/// into its IDT. The timer entry should get an IST stack; see the module
/// docs.
pub fn vector_table() -> [(u8, usize); 20] {
    [
        (0, __fault_de as usize),
        (1, __fault_db as usize),
        (3, __fault_bp as usize),
        (4, __fault_of as usize),
        (5, __fault_br as usize),
        (6, __fault_ud as usize),
        (7, __fault_nm as usize),
        (8, __fault_df as usize),
        (10, __fault_ts as usize),
        (11, __fault_np as usize),
        (12, __fault_ss as usize),
        (13, __fault_gp as usize),
        (14, __fault_pf as usize),
        (16, __fault_mf as usize),
        (17, __fault_ac as usize),
        (18, __fault_mc as usize),
        (19, __fault_xm as usize),
        (20, __fault_ve as usize),
        (XHCI_VECTOR, __xhci_interrupt as usize),
        (LAPIC_TIMER_VECTOR, __timer_interrupt as usize),
    ]
}

// --------------------------------------------------------------------
// Local APIC timer
// --------------------------------------------------------------------

mod lapic {
    pub const LVT_TIMER: *mut u32 = 0xfee0_0320 as *mut u32;
    pub const INITIAL_COUNT: *mut u32 = 0xfee0_0380 as *mut u32;
    pub const CURRENT_COUNT: *const u32 = 0xfee0_0390 as *const u32;
    pub const DIVIDE_CONFIG: *mut u32 = 0xfee0_03e0 as *mut u32;
    const END_OF_INTERRUPT: *mut u32 = 0xfee0_00b0 as *mut u32;

    const COUNT_MAX: u32 = u32::MAX;

    pub fn start() {
        // Safety: architectural MMIO register, mapped by the identity map.
        unsafe { INITIAL_COUNT.write_volatile(COUNT_MAX) }
    }

    pub fn elapsed() -> u32 {
        // Safety: as above.
        COUNT_MAX - unsafe { CURRENT_COUNT.read_volatile() }
    }

    pub fn stop() {
        // Safety: as above.
        unsafe { INITIAL_COUNT.write_volatile(0) }
    }

    /// Tells the interrupt controller the current handler is done.
    pub fn end_of_interrupt() {
        // Safety: as above; writing any value acknowledges.
        unsafe { END_OF_INTERRUPT.write_volatile(0) }
    }
}

pub use lapic::end_of_interrupt;

/// Measured LAPIC timer counts per second, set once by
/// `init_lapic_timer`.
static LAPIC_TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

pub fn lapic_timer_freq() -> u64 {
    LAPIC_TIMER_FREQ.load(Ordering::Relaxed)
}

/// The ACPI power-management timer, used once to calibrate the LAPIC
/// timer. It ticks at a fixed, known rate regardless of CPU frequency
/// scaling.
pub struct AcpiPmTimer {
    port: u16,
    bits32: bool,
}

impl AcpiPmTimer {
    /// Counts per second, fixed by the ACPI specification.
    const FREQ: u64 = 3_579_545;

    pub fn new(port: u16, bits32: bool) -> Self {
        Self { port, bits32 }
    }

    fn read(&self) -> u32 {
        let value: u32;
        // Safety: reading the PM timer port has no side effects.
        unsafe {
            core::arch::asm!(
                "in eax, dx",
                out("eax") value,
                in("dx") self.port,
                options(nomem, nostack),
            );
        }
        value
    }

    /// Busy-waits for `msec` milliseconds, handling the 24-bit variant's
    /// early wraparound.
    pub fn wait_milliseconds(&self, msec: u32) {
        let start = self.read();
        let mut end = start.wrapping_add(
            (Self::FREQ * u64::from(msec) / 1000) as u32,
        );
        if !self.bits32 {
            end &= 0x00ff_ffff;
        }
        if end < start {
            while self.read() >= start {}
        }
        while self.read() < end {}
    }
}

/// Calibrates the LAPIC timer against the PM timer over 100 ms, then
/// programs it to fire `TIMER_FREQ` times a second on our vector.
///
/// # Safety
///
/// Call once during startup, with interrupts disabled and the LAPIC
/// enabled by platform init.
pub unsafe fn init_lapic_timer(pm_timer: &AcpiPmTimer) {
    // Free-run once with the interrupt masked to measure the clock.
    lapic::DIVIDE_CONFIG.write_volatile(0b1011); // divide 1:1
    lapic::LVT_TIMER.write_volatile(0b001 << 16); // masked, one-shot

    lapic::start();
    pm_timer.wait_milliseconds(100);
    let elapsed = lapic::elapsed();
    lapic::stop();

    let freq = u64::from(elapsed) * 10;
    LAPIC_TIMER_FREQ.store(freq, Ordering::Relaxed);

    // Now go periodic at the kernel tick rate.
    lapic::DIVIDE_CONFIG.write_volatile(0b1011);
    lapic::LVT_TIMER.write_volatile(
        (0b010 << 16) | u32::from(LAPIC_TIMER_VECTOR),
    );
    lapic::INITIAL_COUNT
        .write_volatile((freq / crate::config::TIMER_FREQ) as u32);
}
