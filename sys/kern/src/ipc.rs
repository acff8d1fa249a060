// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed messages and per-task mailboxes.
//!
//! Messages are small, copied by value, and flow one way: interrupt
//! handlers and peer tasks post them, the owning task drains them. Posting
//! happens with interrupts disabled, which on this single CPU is the whole
//! mutual-exclusion story.
//!
//! Ordering: a single producer's messages are delivered in the order it
//! posted them (it's one FIFO). Nothing is promised about interleaving
//! between producers.

use abi::TaskId;
use alloc::collections::VecDeque;

use crate::config::MAILBOX_CAPACITY;
use crate::err::KResult;
use crate::layer::{LayerId, Rect};
use crate::time::Tick;

/// Operations carried by a `Message::Layer` request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayerOperation {
    Move,
    MoveRelative,
    Draw,
    DrawArea,
}

/// A message deliverable to a task's mailbox.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Message {
    /// The xHCI controller raised its interrupt; delivered to the USB
    /// service task.
    InterruptXhci,
    /// A timer created for this task expired. `value` is negative for
    /// user-created timers (the syscall layer flips the sign back before
    /// handing it to the task).
    TimerTimeout { timeout: Tick, value: i32 },
    /// Keyboard input routed to the focused task.
    KeyPush { modifier: u8, keycode: u8, ascii: u8, press: bool },
    /// Mouse movement over one of the task's windows.
    MouseMove { x: i32, y: i32, dx: i32, dy: i32, buttons: u8 },
    /// Mouse button transition over one of the task's windows.
    MouseButton { x: i32, y: i32, press: bool, button: u8 },
    /// The compositor asks the owner of `layer_id` to close. The task
    /// decides whether to exit; the kernel only routes the request.
    WindowClose { layer_id: LayerId },
    /// A request for the compositor task to manipulate a layer on behalf
    /// of `src_task`, which will be waiting for `LayerFinish`.
    Layer {
        op: LayerOperation,
        layer_id: LayerId,
        src_task: TaskId,
        area: Rect,
    },
    /// Compositor's completion reply to a `Layer` request.
    LayerFinish { src_task: TaskId },
}

/// A task's inbound FIFO.
///
/// The queue is bounded by `MAILBOX_CAPACITY`; see `post` for the overflow
/// policy.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg`, unless the mailbox is full, in which case the message
    /// is dropped and `Full` is returned. Interrupt-context producers
    /// ignore the error; that is the back-pressure policy, not an oversight.
    pub fn post(&mut self, msg: Message) -> KResult<()> {
        if self.queue.len() >= MAILBOX_CAPACITY {
            return Err(abi::KernError::Full);
        }
        self.queue.push_back(msg);
        Ok(())
    }

    /// Removes and returns the oldest message, if any.
    pub fn take(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
