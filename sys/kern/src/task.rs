// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks and the scheduler.
//!
//! Scheduling is preemptive round-robin within each level, strict priority
//! between levels: the runnable task at the head of the highest non-empty
//! level queue is the one on the CPU. `level_changed` defers the
//! highest-level rescan to the next pass through the scheduler, so a burst
//! of wakeups doesn't re-scan the queues once per wakeup.
//!
//! The fields of `Task` are private so that the scheduling invariants stay
//! in this module: a task is in exactly one of {the run queue for its
//! level, sleeping, finished}, and `running` tracks run-queue membership
//! (the task on the CPU is the head of the current level's queue).

use abi::{KernError, Level, LogLevel, TaskId, NUM_LEVELS};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use crate::arch;
use crate::config::{DEFAULT_LEVEL, DEFAULT_STACK_BYTES};
use crate::err::KResult;
use crate::fd::FileDescriptor;
use crate::ipc::{Mailbox, Message};
use crate::util::index2_distinct;

/// A reserved range of a task's address space backed by a file; the first
/// touch of each page loads the corresponding file slice.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileMapping {
    /// Index into the owning task's file table.
    pub fd: usize,
    /// First mapped address; 4 KiB aligned.
    pub vaddr_begin: u64,
    /// One past the last mapped address.
    pub vaddr_end: u64,
}

/// Internal representation of a task.
#[repr(C)] // so location of SavedState is predictable
pub struct Task {
    /// Saved machine state of the task.
    save: arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    /// Identity. Ids are assigned monotonically and never reused.
    id: TaskId,
    /// Current scheduling level.
    level: Level,
    /// Whether this task is runnable (present in a run queue). The task on
    /// the CPU is the runnable task at the head of the current level's
    /// queue.
    running: bool,
    /// Inbound message FIFO. Mutated only with interrupts disabled,
    /// because interrupt handlers post here.
    mailbox: Mailbox,
    /// Kernel stack backing this task's in-kernel execution.
    kernel_stack: Vec<u64>,
    /// Kernel stack pointer recorded on entry to user code, so `exit` (and
    /// fault kills) can unwind back into the in-kernel app runner.
    os_stack_pointer: u64,
    /// Demand-paging window: first touch of `[dpaging_begin, dpaging_end)`
    /// allocates a zeroed page.
    dpaging_begin: u64,
    dpaging_end: u64,
    /// Next free address for file mappings; they grow downward from here.
    file_map_end: u64,
    /// Registered file mappings, disjoint, all below `file_map_end`'s
    /// initial value.
    file_maps: Vec<FileMapping>,
    /// Sparse file table. Slots 0/1/2 conventionally carry stdin, stdout,
    /// stderr.
    files: Vec<Option<Box<dyn FileDescriptor>>>,
}

impl Task {
    fn new(id: TaskId) -> Self {
        Self {
            save: arch::SavedState::default(),
            id,
            level: DEFAULT_LEVEL,
            running: false,
            mailbox: Mailbox::new(),
            kernel_stack: Vec::new(),
            os_stack_pointer: 0,
            dpaging_begin: 0,
            dpaging_end: 0,
            file_map_end: 0,
            file_maps: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Checks if this task is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        self.running
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the
    /// task.
    pub fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }

    /// Allocates this task's kernel stack and fills in the initial machine
    /// context so that, once woken and scheduled, it starts executing
    /// `entry(id, data)` in kernel mode.
    pub fn init_context(&mut self, entry: fn(u64, i64), data: i64) -> &mut Self {
        self.kernel_stack = vec![0u64; DEFAULT_STACK_BYTES / 8];
        let stack_end =
            self.kernel_stack.as_ptr() as u64 + DEFAULT_STACK_BYTES as u64;
        arch::initialize_context(
            &mut self.save,
            entry as usize,
            self.id.0,
            data,
            stack_end & !0xf,
        );
        self
    }

    /// Removes and returns the oldest message in this task's mailbox.
    ///
    /// The caller must hold interrupts disabled.
    pub fn receive_message(&mut self) -> Option<Message> {
        self.mailbox.take()
    }

    fn post_message(&mut self, msg: Message) -> KResult<()> {
        self.mailbox.post(msg)
    }

    /// Number of undelivered messages; senders that implement
    /// back-pressure consult this.
    pub fn mailbox_len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn os_stack_pointer(&self) -> u64 {
        self.os_stack_pointer
    }

    /// Records the kernel stack pointer to unwind to when the task leaves
    /// user mode for the last time. Called by the app runner right before
    /// dropping to user code.
    pub fn set_os_stack_pointer(&mut self, sp: u64) {
        self.os_stack_pointer = sp;
    }

    pub fn dpaging_begin(&self) -> u64 {
        self.dpaging_begin
    }

    pub fn dpaging_end(&self) -> u64 {
        self.dpaging_end
    }

    pub fn set_dpaging_begin(&mut self, addr: u64) {
        self.dpaging_begin = addr;
    }

    pub fn set_dpaging_end(&mut self, addr: u64) {
        self.dpaging_end = addr;
    }

    pub fn file_map_end(&self) -> u64 {
        self.file_map_end
    }

    pub fn set_file_map_end(&mut self, addr: u64) {
        self.file_map_end = addr;
    }

    pub fn add_file_mapping(&mut self, m: FileMapping) {
        self.file_maps.push(m);
    }

    /// Finds the registered file mapping containing `vaddr`, if any.
    pub fn file_mapping_for(&self, vaddr: u64) -> Option<FileMapping> {
        self.file_maps
            .iter()
            .copied()
            .find(|m| m.vaddr_begin <= vaddr && vaddr < m.vaddr_end)
    }

    /// Looks up an occupied file table slot.
    pub fn file_mut(
        &mut self,
        fd: usize,
    ) -> Option<&mut Box<dyn FileDescriptor>> {
        self.files.get_mut(fd).and_then(|slot| slot.as_mut())
    }

    /// Returns the lowest free file table slot, growing the table if every
    /// slot is occupied.
    pub fn alloc_fd(&mut self) -> usize {
        for (i, slot) in self.files.iter().enumerate() {
            if slot.is_none() {
                return i;
            }
        }
        self.files.push(None);
        self.files.len() - 1
    }

    pub fn set_file(&mut self, fd: usize, file: Box<dyn FileDescriptor>) {
        if fd >= self.files.len() {
            self.files.resize_with(fd + 1, || None);
        }
        self.files[fd] = Some(file);
    }

    /// Drops every file descriptor; used during task teardown.
    pub fn close_all_files(&mut self) {
        self.files.clear();
        self.file_maps.clear();
    }
}

/// The task table plus the scheduler state.
pub struct TaskManager {
    /// All tasks ever created, boxed so their addresses (and in particular
    /// the address of each `save` area) stay stable as the table grows.
    /// Task with id `n` lives at index `n - 1`; entries are never removed.
    tasks: Vec<Box<Task>>,
    /// Per-level FIFO run queues. The CPU belongs to the head of
    /// `running[current_level]`.
    running: [VecDeque<TaskId>; NUM_LEVELS],
    current_level: usize,
    /// Set when a wakeup may have raised the highest non-empty level; the
    /// rescan is deferred to the next scheduler pass.
    level_changed: bool,
    /// Exit codes of finished tasks, until consumed by a waiter.
    finished: BTreeMap<TaskId, i32>,
    /// Who to wake when a given task finishes.
    finish_waiters: BTreeMap<TaskId, TaskId>,
}

impl TaskManager {
    /// Creates the manager along with the boot task (id 1), which
    /// represents the flow of control that called us and doubles as the
    /// USB service task.
    pub fn new() -> Self {
        let mut m = Self {
            tasks: Vec::new(),
            running: core::array::from_fn(|_| VecDeque::new()),
            current_level: DEFAULT_LEVEL.0 as usize,
            level_changed: false,
            finished: BTreeMap::new(),
            finish_waiters: BTreeMap::new(),
        };
        let main = m.new_task().id();
        let idx = m.index_of(main).unwrap();
        m.tasks[idx].running = true;
        m.running[m.current_level].push_back(main);
        m
    }

    /// Creates a task. It is born sleeping at the default level; arrange
    /// its context with `init_context` and make it runnable with `wakeup`.
    pub fn new_task(&mut self) -> &mut Task {
        let id = TaskId(self.tasks.len() as u64 + 1);
        self.tasks.push(Box::new(Task::new(id)));
        let idx = self.tasks.len() - 1;
        &mut self.tasks[idx]
    }

    fn index_of(&self, id: TaskId) -> KResult<usize> {
        if id.0 == 0 || id.0 > self.tasks.len() as u64 {
            return Err(KernError::NoSuchTask);
        }
        Ok(id.0 as usize - 1)
    }

    pub fn task(&self, id: TaskId) -> KResult<&Task> {
        self.index_of(id).map(|i| &*self.tasks[i])
    }

    pub fn task_mut(&mut self, id: TaskId) -> KResult<&mut Task> {
        let i = self.index_of(id)?;
        Ok(&mut self.tasks[i])
    }

    /// Id of the task on the CPU: the head of the current level's queue.
    ///
    /// # Panics
    ///
    /// If no task is runnable. The platform keeps the boot task (or an
    /// idle task) runnable, so this means a kernel bug.
    pub fn current_id(&self) -> TaskId {
        *self.running[self.current_level]
            .front()
            .expect("no tasks runnable")
    }

    pub fn current_task(&mut self) -> &mut Task {
        let id = self.current_id();
        let idx = self.index_of(id).unwrap();
        &mut self.tasks[idx]
    }

    /// Current level of the scheduler, exposed for diagnostics.
    pub fn current_level(&self) -> usize {
        self.current_level
    }

    /// Posts `msg` to task `id` and wakes it if it was sleeping.
    ///
    /// Non-blocking. A full mailbox drops the message (and still reports
    /// `Full`, which interrupt-context senders ignore); an unknown id is
    /// `NoSuchTask`.
    pub fn send_message(&mut self, id: TaskId, msg: Message) -> KResult<()> {
        let idx = self.index_of(id)?;
        let res = self.tasks[idx].post_message(msg);
        if res.is_err() {
            klog!(
                LogLevel::Debug,
                "mailbox full, dropping message for task {}",
                id.0
            );
        }
        self.wakeup(id, None)?;
        res
    }

    /// Makes `id` runnable at `level` (or its current level if `None`).
    ///
    /// Waking a task that is already runnable only adjusts its level.
    pub fn wakeup(&mut self, id: TaskId, level: Option<Level>) -> KResult<()> {
        let idx = self.index_of(id)?;
        if self.tasks[idx].running {
            if let Some(level) = level {
                self.change_level_running(id, level);
            }
            return Ok(());
        }

        let level = level.unwrap_or(self.tasks[idx].level);
        self.tasks[idx].level = level;
        self.tasks[idx].running = true;
        self.running[level.0 as usize].push_back(id);
        if level.0 as usize > self.current_level {
            self.level_changed = true;
        }
        Ok(())
    }

    /// Moves a runnable task to a new level. If the task is the one on the
    /// CPU it keeps the CPU (it is pushed at the *front* of its new
    /// queue), and the scheduler level follows it.
    fn change_level_running(&mut self, id: TaskId, level: Level) {
        let idx = self.index_of(id).unwrap();
        let old = self.tasks[idx].level;
        if level == old {
            return;
        }
        let lv = level.0 as usize;

        if id != self.current_id() {
            self.running[old.0 as usize].retain(|t| *t != id);
            self.running[lv].push_back(id);
            self.tasks[idx].level = level;
            if lv > self.current_level {
                self.level_changed = true;
            }
            return;
        }

        // Changing the level of the task on the CPU.
        self.running[self.current_level].pop_front();
        self.running[lv].push_front(id);
        self.tasks[idx].level = level;
        if lv < self.current_level {
            self.level_changed = true;
        }
        self.current_level = lv;
    }

    /// Puts `id` to sleep. Sleeping a task that is already sleeping is a
    /// no-op. If `id` is the task on the CPU this switches away and only
    /// returns once the task is woken and scheduled again.
    pub fn sleep(&mut self, id: TaskId) -> KResult<()> {
        let idx = self.index_of(id)?;
        if !self.tasks[idx].running {
            return Ok(());
        }
        self.tasks[idx].running = false;

        if id == self.current_id() {
            let outgoing = self.rotate_current_run_queue(true);
            uassert_eq!(outgoing, id);
            let next = self.current_id();
            let next_idx = self.index_of(next)?;
            let (out_task, next_task) =
                index2_distinct(&mut self.tasks, idx, next_idx);
            let out_save: *mut arch::SavedState = out_task.save_mut();
            let next_save: *const arch::SavedState = next_task.save();
            // Safety: both pointers reference distinct boxed save areas
            // that outlive the switch; this is the one place the kernel
            // suspends a flow of control.
            unsafe {
                arch::switch_context(out_save, next_save);
            }
        } else {
            let level = self.tasks[idx].level;
            self.running[level.0 as usize].retain(|t| *t != id);
        }
        Ok(())
    }

    /// Sleeps the task on the CPU.
    pub fn sleep_current(&mut self) {
        let id = self.current_id();
        let _ = self.sleep(id);
    }

    /// Preemption entry, called from the timer interrupt with the
    /// interrupted context. Stores `ctx` into the outgoing task, rotates
    /// its queue, and resumes the new head (which does not return here if
    /// the head changed).
    pub fn preempt(&mut self, ctx: &arch::SavedState) {
        let current = self.current_id();
        let idx = self.index_of(current).unwrap();
        *self.tasks[idx].save_mut() = ctx.clone();

        let outgoing = self.rotate_current_run_queue(false);
        let next = self.current_id();
        if next != outgoing {
            let next_idx = self.index_of(next).unwrap();
            let next_save: *const arch::SavedState =
                self.tasks[next_idx].save();
            // Safety: the interrupted context was just copied out; the
            // interrupt frame being abandoned is exactly the point.
            unsafe {
                arch::restore_context(next_save);
            }
        }
    }

    /// Pops the task at the head of the current queue and, unless it is
    /// going to sleep, re-appends it at the tail. Re-resolves the current
    /// level if a wakeup raised `level_changed` or the queue drained.
    /// Returns the outgoing (popped) task.
    fn rotate_current_run_queue(&mut self, current_sleep: bool) -> TaskId {
        let queue = &mut self.running[self.current_level];
        let outgoing = queue.pop_front().expect("no tasks runnable");
        if !current_sleep {
            queue.push_back(outgoing);
        }
        if queue.is_empty() {
            self.level_changed = true;
        }
        if self.level_changed {
            self.level_changed = false;
            for lv in (0..NUM_LEVELS).rev() {
                if !self.running[lv].is_empty() {
                    self.current_level = lv;
                    break;
                }
            }
        }
        outgoing
    }

    /// Terminates the task on the CPU with `exit_code`: records the code,
    /// wakes any waiter, and switches to the next runnable task. On
    /// hardware this never returns.
    pub fn finish(&mut self, exit_code: i32) {
        let current = self.current_id();
        let idx = self.index_of(current).unwrap();

        self.finished.insert(current, exit_code);
        if let Some(waiter) = self.finish_waiters.remove(&current) {
            let _ = self.wakeup(waiter, None);
        }

        self.tasks[idx].running = false;
        let outgoing = self.rotate_current_run_queue(true);
        uassert_eq!(outgoing, current);

        let next = self.current_id();
        let next_idx = self.index_of(next).unwrap();
        let next_save: *const arch::SavedState = self.tasks[next_idx].save();
        // Safety: the finished task's context is never resumed; we restore
        // the next task directly.
        unsafe {
            arch::restore_context(next_save);
        }
    }

    /// Consumes the recorded exit code of `id`, if it has finished.
    pub fn try_take_exit_code(&mut self, id: TaskId) -> Option<i32> {
        self.finished.remove(&id)
    }

    /// Registers the current task as the waiter for `id` and sleeps. On
    /// hardware this returns once `finish` wakes us.
    pub fn block_on_finish(&mut self, id: TaskId) {
        let current = self.current_id();
        self.finish_waiters.insert(id, current);
        let _ = self.sleep(current);
    }

    /// Waits for task `id` to finish and returns its exit code. Returns
    /// immediately if it already has; otherwise blocks the current task.
    pub fn wait_finish(&mut self, id: TaskId) -> KResult<i32> {
        loop {
            if let Some(code) = self.try_take_exit_code(id) {
                return Ok(code);
            }
            // Distinguish "not yet finished" from "no such task".
            self.index_of(id)?;
            self.block_on_finish(id);
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_ctx() -> arch::SavedState {
        arch::SavedState::default()
    }

    /// Spawns a task and makes it runnable at `level`.
    fn spawn_runnable(m: &mut TaskManager, level: Level) -> TaskId {
        let id = m.new_task().id();
        m.wakeup(id, Some(level)).unwrap();
        id
    }

    #[test]
    fn ids_are_monotonic_and_start_after_boot_task() {
        let mut m = TaskManager::new();
        assert_eq!(m.current_id(), TaskId(1));
        assert_eq!(m.new_task().id(), TaskId(2));
        assert_eq!(m.new_task().id(), TaskId(3));
    }

    #[test]
    fn new_tasks_are_born_sleeping() {
        let mut m = TaskManager::new();
        let t = m.new_task().id();
        assert!(!m.task(t).unwrap().is_runnable());
        assert_eq!(m.current_id(), TaskId(1));
    }

    #[test]
    fn round_robin_within_a_level() {
        let mut m = TaskManager::new();
        let t2 = spawn_runnable(&mut m, DEFAULT_LEVEL);
        let t3 = spawn_runnable(&mut m, DEFAULT_LEVEL);

        let ctx = dummy_ctx();
        let mut order = alloc::vec::Vec::new();
        for _ in 0..6 {
            m.preempt(&ctx);
            order.push(m.current_id());
        }
        assert_eq!(
            order,
            &[t2, t3, TaskId(1), t2, t3, TaskId(1)],
        );
    }

    #[test]
    fn higher_level_dominates() {
        let mut m = TaskManager::new();
        let lo = spawn_runnable(&mut m, Level(0));
        let hi = spawn_runnable(&mut m, Level(3));

        let ctx = dummy_ctx();
        // After the next scheduler pass the level-3 task owns the CPU and
        // keeps it; the level-0 task is never scheduled.
        for _ in 0..5 {
            m.preempt(&ctx);
            assert_eq!(m.current_id(), hi);
        }
        assert!(m.task(lo).unwrap().is_runnable());

        // Only once the high task sleeps does the scheduler fall back, and
        // it falls to the boot task's level first, not to level 0.
        m.sleep(hi).unwrap();
        assert_eq!(m.current_id(), TaskId(1));
        m.sleep(TaskId(1)).unwrap();
        assert_eq!(m.current_id(), lo);
    }

    #[test]
    fn sleep_of_sleeping_task_is_noop() {
        let mut m = TaskManager::new();
        let t = m.new_task().id();
        assert!(m.sleep(t).is_ok());
        assert!(m.sleep(t).is_ok());
        assert!(!m.task(t).unwrap().is_runnable());
    }

    #[test]
    fn wakeup_of_runnable_task_adjusts_level_only() {
        let mut m = TaskManager::new();
        let t = spawn_runnable(&mut m, Level(0));
        m.wakeup(t, Some(DEFAULT_LEVEL)).unwrap();
        assert_eq!(m.task(t).unwrap().level(), DEFAULT_LEVEL);

        // Still queued exactly once: further wakeups don't duplicate it in
        // the rotation, so over two full cycles it runs exactly twice.
        let ctx = dummy_ctx();
        m.wakeup(t, None).unwrap();
        m.wakeup(t, Some(DEFAULT_LEVEL)).unwrap();
        let mut seen = 0;
        for _ in 0..4 {
            m.preempt(&ctx);
            if m.current_id() == t {
                seen += 1;
            }
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn wakeup_unknown_task_fails() {
        let mut m = TaskManager::new();
        assert_eq!(m.wakeup(TaskId(42), None), Err(KernError::NoSuchTask));
    }

    #[test]
    fn send_message_wakes_sleeping_receiver() {
        let mut m = TaskManager::new();
        let t = m.new_task().id();
        assert!(!m.task(t).unwrap().is_runnable());

        m.send_message(t, Message::InterruptXhci).unwrap();
        assert!(m.task(t).unwrap().is_runnable());
        assert_eq!(
            m.task_mut(t).unwrap().receive_message(),
            Some(Message::InterruptXhci)
        );
    }

    #[test]
    fn send_message_unknown_task() {
        let mut m = TaskManager::new();
        assert_eq!(
            m.send_message(TaskId(9), Message::InterruptXhci),
            Err(KernError::NoSuchTask)
        );
    }

    #[test]
    fn messages_fifo_per_producer() {
        let mut m = TaskManager::new();
        let t = m.new_task().id();
        for i in 0..4 {
            m.send_message(
                t,
                Message::TimerTimeout {
                    timeout: crate::time::Tick::from(i),
                    value: i as i32,
                },
            )
            .unwrap();
        }
        for i in 0..4 {
            match m.task_mut(t).unwrap().receive_message().unwrap() {
                Message::TimerTimeout { value, .. } => {
                    assert_eq!(value, i as i32)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn wait_finish_after_exit_returns_immediately() {
        let mut m = TaskManager::new();
        let child = spawn_runnable(&mut m, DEFAULT_LEVEL);

        // Rotate the child onto the CPU and finish it there.
        let ctx = dummy_ctx();
        m.preempt(&ctx);
        assert_eq!(m.current_id(), child);
        m.finish(42);
        assert_eq!(m.current_id(), TaskId(1));

        assert_eq!(m.wait_finish(child), Ok(42));
        // The code is consumed.
        assert_eq!(m.try_take_exit_code(child), None);
    }

    #[test]
    fn wait_before_exit_wakes_parent_with_code() {
        let mut m = TaskManager::new();
        let child = spawn_runnable(&mut m, DEFAULT_LEVEL);

        // Parent (boot task) blocks first.
        m.block_on_finish(child);
        assert!(!m.task(TaskId(1)).unwrap().is_runnable());
        assert_eq!(m.current_id(), child);

        // Child exits; parent is woken and can consume the code.
        m.finish(42);
        assert!(m.task(TaskId(1)).unwrap().is_runnable());
        assert_eq!(m.current_id(), TaskId(1));
        assert_eq!(m.try_take_exit_code(child), Some(42));
    }

    #[test]
    fn wait_finish_unknown_task() {
        let mut m = TaskManager::new();
        assert_eq!(m.wait_finish(TaskId(77)), Err(KernError::NoSuchTask));
    }

    #[test]
    fn finished_task_never_scheduled_again() {
        let mut m = TaskManager::new();
        let child = spawn_runnable(&mut m, DEFAULT_LEVEL);
        let ctx = dummy_ctx();
        m.preempt(&ctx);
        assert_eq!(m.current_id(), child);
        m.finish(0);

        for _ in 0..4 {
            m.preempt(&ctx);
            assert_ne!(m.current_id(), child);
        }
    }

    #[test]
    fn fairness_bound_within_level() {
        // Every runnable task at the current level is scheduled within
        // N rotations, N being the number of runnable tasks at that level.
        let mut m = TaskManager::new();
        let mut ids = alloc::vec![TaskId(1)];
        for _ in 0..3 {
            ids.push(spawn_runnable(&mut m, DEFAULT_LEVEL));
        }

        let ctx = dummy_ctx();
        let mut seen = alloc::collections::BTreeMap::new();
        for _ in 0..ids.len() {
            m.preempt(&ctx);
            *seen.entry(m.current_id()).or_insert(0) += 1;
        }
        for id in &ids {
            assert_eq!(seen.get(id), Some(&1), "task {id:?} starved");
        }
    }
}
