// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel context and startup.
//!
//! Early boot (segmentation, interrupt descriptor installation, the frame
//! bitmap, the heap) happens in the platform layer before control arrives
//! here with the collaborators in hand. This module collapses what would
//! otherwise be a pile of global singletons into one [`Kernel`] value; the
//! architecture layer keeps a single pointer to it for the benefit of the
//! interrupt and syscall entry sequences.

use abi::TaskId;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::err::KResult;
use crate::fd::FileSystem;
use crate::ipc::Message;
use crate::layer::{LayerId, LayerManager};
use crate::pagemap::{self, FrameAllocator, PageTable};
use crate::task::TaskManager;
use crate::timer::TimerService;

/// Everything mutable in the kernel, in one place.
pub struct Kernel {
    pub tasks: TaskManager,
    pub timers: TimerService,
    /// The window compositor collaborator.
    pub layers: Box<dyn LayerManager>,
    /// The physical frame allocator collaborator.
    pub frames: Box<dyn FrameAllocator>,
    /// The filesystem collaborator.
    pub fs: Box<dyn FileSystem>,
    /// Which task owns which layer; maintained by the window syscalls and
    /// consulted when routing compositor events.
    pub layer_owners: BTreeMap<LayerId, TaskId>,
}

impl Kernel {
    pub fn new(
        layers: Box<dyn LayerManager>,
        frames: Box<dyn FrameAllocator>,
        fs: Box<dyn FileSystem>,
    ) -> Self {
        Self {
            tasks: TaskManager::new(),
            timers: TimerService::new(),
            layers,
            frames,
            fs,
            layer_owners: BTreeMap::new(),
        }
    }

    /// Terminates the task on the CPU: reclaims its upper-half page
    /// tables and frames, drops its file table, records the exit code,
    /// and hands the CPU to the next runnable task. The lower-half kernel
    /// identity mappings are shared and persist.
    ///
    /// Called by the app runner once `exit` (or a fault kill) has unwound
    /// out of user mode.
    pub fn finish_current(&mut self, exit_code: i32) {
        let root =
            self.tasks.current_task().save().page_table_root() as *mut PageTable;
        if !root.is_null() {
            pagemap::clean_page_maps(root, 256, &mut *self.frames);
        }
        self.tasks.current_task().close_all_files();
        self.tasks.finish(exit_code);
    }

    /// Routes a compositor close request to the task owning `layer_id`.
    /// The task decides what to do about it (normally: exit).
    pub fn notify_window_close(&mut self, layer_id: LayerId) -> KResult<()> {
        let owner = *self
            .layer_owners
            .get(&layer_id)
            .ok_or(abi::KernError::IndexOutOfRange)?;
        self.tasks.send_message(owner, Message::WindowClose { layer_id })
    }
}

/// Boot parameters the platform layer discovered and the kernel proper
/// still needs.
#[cfg(target_os = "none")]
pub struct BootConfig {
    /// I/O port of the ACPI PM timer, from the FADT.
    pub acpi_pm_timer_port: u16,
    /// Whether the PM timer is the 32-bit variant (FADT flags bit 8).
    pub acpi_pm_timer_32bit: bool,
}

/// The main kernel entry point.
///
/// The platform layer calls this on its own fresh stack, with interrupts
/// still disabled and vectors for our handlers already installed. It does
/// not return; `main` becomes the body of the boot task (task 1, the USB
/// service task).
///
/// # Safety
///
/// This can be called exactly once per boot, after the global allocator
/// and interrupt vectors are in place.
#[cfg(target_os = "none")]
pub unsafe fn start_kernel(
    kernel: Kernel,
    config: BootConfig,
    main: fn() -> !,
) -> ! {
    use crate::config::{TASK_TIMER_PERIOD, TASK_TIMER_VALUE};
    use crate::timer::Timer;

    let kernel = Box::leak(Box::new(kernel));

    // Seed the preemption timer before interrupts can fire.
    let first = kernel.timers.current_tick() + TASK_TIMER_PERIOD;
    kernel
        .timers
        .add_timer(Timer::new(first, TASK_TIMER_VALUE, TaskId(1)));

    crate::arch::set_kernel(kernel);
    crate::arch::init_syscall();

    let pm_timer = crate::arch::AcpiPmTimer::new(
        config.acpi_pm_timer_port,
        config.acpi_pm_timer_32bit,
    );
    crate::arch::init_lapic_timer(&pm_timer);

    crate::arch::sti();
    main()
}
