// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static kernel configuration.
//!
//! The system takes a single shape chosen at compile time; these constants
//! are that shape.

use abi::Level;

/// Kernel tick rate, in ticks per second. The timer interrupt is programmed
/// to fire at this frequency.
pub const TIMER_FREQ: u64 = 100;

/// Interval between preemptions, in ticks. Two ticks at 100 Hz gives a
/// 20 ms scheduling quantum.
pub const TASK_TIMER_PERIOD: u64 = 2;

/// Sentinel timer value marking the kernel's internal preemption timer.
/// User timers are stored with negated (strictly negative) values, so this
/// can never collide with one.
pub const TASK_TIMER_VALUE: i32 = i32::MIN;

/// Bound on each task's mailbox. A producer that finds the mailbox full
/// drops its message; senders that care are expected to budget against
/// this.
pub const MAILBOX_CAPACITY: usize = 128;

/// Scheduling level assigned to newly created tasks (and the boot task)
/// unless the creator chooses otherwise.
pub const DEFAULT_LEVEL: Level = Level(1);

/// Size of the kernel stack allocated to each task.
pub const DEFAULT_STACK_BYTES: usize = 8 * 1024;

/// Size of one page / page frame.
pub const PAGE_SIZE: u64 = 4096;
