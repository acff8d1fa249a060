// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical timer service.
//!
//! One min-heap multiplexes every timeout in the system over the single
//! periodic hardware timer: user timers created through `CreateTimer`,
//! kernel-internal timers, and the scheduler's own preemption timer. The
//! interrupt handler pays O(log n) per expiry; delivery is decoupled from
//! the handler by posting `TimerTimeout` messages instead of running
//! callbacks.
//!
//! All mutation happens in interrupt context or with interrupts disabled.

use abi::TaskId;
use alloc::collections::BinaryHeap;

use crate::config::{TASK_TIMER_PERIOD, TASK_TIMER_VALUE};
use crate::ipc::Message;
use crate::task::TaskManager;
use crate::time::Tick;

/// One scheduled timeout.
///
/// `value` is returned to the owning task in the timeout message. By
/// convention, negative values mark user-created timers (the syscall layer
/// negates on creation and un-negates on delivery) and `TASK_TIMER_VALUE`
/// marks the preemption timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timer {
    timeout: Tick,
    value: i32,
    task: TaskId,
}

impl Timer {
    pub fn new(timeout: Tick, value: i32, task: TaskId) -> Self {
        Self {
            timeout,
            value,
            task,
        }
    }

    pub fn timeout(&self) -> Tick {
        self.timeout
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn task(&self) -> TaskId {
        self.task
    }
}

/// A timer with a *farther* timeout is ordered *smaller*, so that
/// `BinaryHeap` (a max-heap) pops the nearest timeout first. The remaining
/// fields participate only to keep the order total.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.timeout, self.value, self.task)
            .cmp(&(other.timeout, other.value, other.task))
            .reverse()
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The timer service: the monotonic tick counter plus the timeout heap.
pub struct TimerService {
    tick: Tick,
    timers: BinaryHeap<Timer>,
}

impl TimerService {
    pub fn new() -> Self {
        let mut timers = BinaryHeap::new();
        // Sentinel with an unreachable timeout, so `peek` below is always
        // `Some` and the expiry loop needs no emptiness check.
        timers.push(Timer::new(Tick::MAX, 0, TaskId(0)));
        Self {
            tick: Tick::from(0),
            timers,
        }
    }

    /// Schedules `timer`. Interrupt-safe only under the usual
    /// interrupts-disabled discipline.
    pub fn add_timer(&mut self, timer: Timer) {
        self.timers.push(timer);
    }

    /// Current value of the monotonic tick counter.
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// Advances time by one tick and expires every timer that is now due.
    ///
    /// Expired user/kernel timers turn into `TimerTimeout` messages to
    /// their owning tasks (messages to vanished tasks are dropped). The
    /// preemption timer is special: it is rescheduled one period out, and
    /// its expiry is reported to the caller, which is expected to invoke
    /// the scheduler once the interrupt controller has been acknowledged.
    #[must_use]
    pub fn tick(&mut self, tasks: &mut TaskManager) -> bool {
        self.tick = self.tick + 1;

        let mut preemption_due = false;
        loop {
            let t = *self.timers.peek().unwrap();
            if t.timeout() > self.tick {
                break;
            }
            self.timers.pop();

            if t.value() == TASK_TIMER_VALUE {
                preemption_due = true;
                self.timers.push(Timer::new(
                    self.tick + TASK_TIMER_PERIOD,
                    TASK_TIMER_VALUE,
                    TaskId(1),
                ));
                continue;
            }

            let _ = tasks.send_message(
                t.task(),
                Message::TimerTimeout {
                    timeout: t.timeout(),
                    value: t.value(),
                },
            );
        }

        preemption_due
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (TimerService, TaskManager) {
        (TimerService::new(), TaskManager::new())
    }

    fn drain_timeouts(tasks: &mut TaskManager, id: TaskId) -> alloc::vec::Vec<(u64, i32)> {
        let mut out = alloc::vec::Vec::new();
        while let Some(m) = tasks.task_mut(id).unwrap().receive_message() {
            match m {
                Message::TimerTimeout { timeout, value } => {
                    out.push((u64::from(timeout), value))
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        out
    }

    #[test]
    fn tick_is_monotonic() {
        let (mut timers, mut tasks) = fixture();
        let mut last = u64::from(timers.current_tick());
        for _ in 0..10 {
            let _ = timers.tick(&mut tasks);
            let now = u64::from(timers.current_tick());
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn delivery_not_before_timeout() {
        let (mut timers, mut tasks) = fixture();
        let main = tasks.current_id();
        timers.add_timer(Timer::new(Tick::from(3), 7, main));

        for _ in 0..2 {
            let _ = timers.tick(&mut tasks);
            assert!(tasks.task_mut(main).unwrap().receive_message().is_none());
        }
        let _ = timers.tick(&mut tasks);
        assert_eq!(drain_timeouts(&mut tasks, main), &[(3, 7)]);
    }

    #[test]
    fn multiple_expiries_in_one_tick() {
        let (mut timers, mut tasks) = fixture();
        let main = tasks.current_id();
        timers.add_timer(Timer::new(Tick::from(1), 1, main));
        timers.add_timer(Timer::new(Tick::from(1), 2, main));
        timers.add_timer(Timer::new(Tick::from(2), 3, main));

        let _ = timers.tick(&mut tasks);
        let got = drain_timeouts(&mut tasks, main);
        assert_eq!(got.len(), 2);
        assert!(got.contains(&(1, 1)) && got.contains(&(1, 2)));
    }

    #[test]
    fn unknown_task_timer_is_dropped() {
        let (mut timers, mut tasks) = fixture();
        timers.add_timer(Timer::new(Tick::from(1), 1, TaskId(999)));
        // Must not panic, and time still advances.
        let _ = timers.tick(&mut tasks);
        assert_eq!(u64::from(timers.current_tick()), 1);
    }

    #[test]
    fn preemption_timer_reschedules_itself() {
        let (mut timers, mut tasks) = fixture();
        timers.add_timer(Timer::new(
            timers.current_tick() + TASK_TIMER_PERIOD,
            TASK_TIMER_VALUE,
            TaskId(1),
        ));

        let mut preemptions = 0;
        for _ in 0..10 {
            if timers.tick(&mut tasks) {
                preemptions += 1;
            }
        }
        // Period 2 over 10 ticks: due at ticks 2,4,6,8,10.
        assert_eq!(preemptions, 5);
        // And the preemption timer never surfaces as a message.
        let me = tasks.current_id();
        assert!(drain_timeouts(&mut tasks, me).is_empty());
    }
}
