// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in this crate is part of the contract between the kernel and
//! user tasks: syscall numbers, error codes, the event record delivered by
//! `ReadEvent`, and the various flag words. Changing anything here changes
//! the ABI.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a task.
///
/// Task ids are 64-bit, assigned monotonically starting at 1, and never
/// reused. This means an id uniquely identifies one incarnation of one task
/// for the lifetime of the system, so peers can hold ids without worrying
/// about them being recycled out from under them.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Task id 1 is reserved for the USB service task, which is the
    /// recipient of xHCI interrupt messages.
    pub const USB: Self = Self(1);
}

/// Indicates the scheduling level (priority) of a task.
///
/// Levels are small numbers starting from zero. Numerically *higher* levels
/// are more important: a runnable task at level 3 always runs before any
/// task at level 2 or below.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means more important
/// or less.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Level(pub u8);

impl Level {
    /// Highest (most important) level.
    pub const MAX: Self = Self(3);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Number of distinct scheduling levels, `0..=Level::MAX`.
pub const NUM_LEVELS: usize = Level::MAX.0 as usize + 1;

/// Enumeration of syscall numbers.
///
/// The dispatch table is indexed by these. Numbers not listed here are
/// rejected with `ErrorCode::NoSys`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum Sysnum {
    LogString = 0x0,
    PutString = 0x1,
    Exit = 0x2,
    OpenWindow = 0x3,
    WinWriteString = 0x4,
    WinFillRectangle = 0x5,
    GetCurrentTick = 0x6,
    WinRedraw = 0x7,
    WinDrawLine = 0x8,
    CloseWindow = 0x9,
    ReadEvent = 0xa,
    CreateTimer = 0xb,
    OpenFile = 0xc,
    ReadFile = 0xd,
    DemandPages = 0xe,
    MapFile = 0xf,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u64> for Sysnum {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            0x0 => Ok(Self::LogString),
            0x1 => Ok(Self::PutString),
            0x2 => Ok(Self::Exit),
            0x3 => Ok(Self::OpenWindow),
            0x4 => Ok(Self::WinWriteString),
            0x5 => Ok(Self::WinFillRectangle),
            0x6 => Ok(Self::GetCurrentTick),
            0x7 => Ok(Self::WinRedraw),
            0x8 => Ok(Self::WinDrawLine),
            0x9 => Ok(Self::CloseWindow),
            0xa => Ok(Self::ReadEvent),
            0xb => Ok(Self::CreateTimer),
            0xc => Ok(Self::OpenFile),
            0xd => Ok(Self::ReadFile),
            0xe => Ok(Self::DemandPages),
            0xf => Ok(Self::MapFile),
            _ => Err(()),
        }
    }
}

/// POSIX-style error codes returned in the second word of the syscall
/// result pair. A zero means success; these are the nonzero cases.
///
/// The numeric values follow the conventional errno assignments so that
/// user-side `strerror`-alikes produce familiar output.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u64)]
pub enum ErrorCode {
    /// EPERM: operation not permitted (e.g. a bogus log level).
    Perm = 1,
    /// ENOENT: no such file.
    NoEnt = 2,
    /// E2BIG: argument list (here: string argument) too long.
    TooBig = 7,
    /// EBADF: bad file descriptor or window/layer id.
    BadFd = 9,
    /// EFAULT: bad address from user code.
    Fault = 14,
    /// EINVAL: invalid argument value.
    Inval = 22,
    /// ENOSYS: syscall number not implemented.
    NoSys = 38,
}

/// Kernel-internal error taxonomy, used between kernel components and at
/// collaborator seams. Syscalls map these onto `ErrorCode` at the boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KernError {
    /// A task id named a task that does not exist.
    NoSuchTask,
    /// A bounded queue was full and the item was not accepted.
    Full,
    /// A mapping operation touched a page that is already present
    /// (protection violation on a present page).
    AlreadyAllocated,
    /// An address or index fell outside every registered range.
    IndexOutOfRange,
    /// The frame allocator could not satisfy a request.
    NoEnoughMemory,
    /// The display reported a pixel format the kernel cannot drive.
    UnknownPixelFormat,
    /// The USB host controller would not halt during initialization.
    HostControllerNotHalted,
}

/// Log levels for the kernel console, syslog-flavored. The `LogString`
/// syscall accepts exactly these values.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(u64)]
pub enum LogLevel {
    Error = 3,
    Warn = 4,
    Info = 6,
    Debug = 7,
}

impl core::convert::TryFrom<u64> for LogLevel {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, ()> {
        match x {
            3 => Ok(Self::Error),
            4 => Ok(Self::Warn),
            6 => Ok(Self::Info),
            7 => Ok(Self::Debug),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Keyboard modifier byte, HID boot protocol layout.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct KeyModifiers: u8 {
        const L_CTRL = 1 << 0;
        const L_SHIFT = 1 << 1;
        const L_ALT = 1 << 2;
        const L_GUI = 1 << 3;
        const R_CTRL = 1 << 4;
        const R_SHIFT = 1 << 5;
        const R_ALT = 1 << 6;
        const R_GUI = 1 << 7;
    }
}

impl KeyModifiers {
    /// Either control key.
    pub const CONTROL: Self = Self::L_CTRL.union(Self::R_CTRL);
}

/// HID usage id of the Q key; Ctrl+Q (pressed) is the quit chord that
/// `ReadEvent` translates into a single `Quit` event.
pub const QUIT_KEYCODE: u8 = 20;

/// Bit 32 of the composite `layer_id | flags` argument taken by the
/// window-mutating syscalls. When set, the syscall applies the mutation but
/// does not request a redraw, letting callers batch mutations and finish
/// with one explicit `WinRedraw`.
pub const LAYER_NO_REDRAW: u64 = 1 << 32;

/// Mask extracting the layer id from the composite argument.
pub const LAYER_ID_MASK: u64 = 0xffff_ffff;

/// `CreateTimer` mode: the timeout argument is an absolute time in ms.
pub const TIMER_ONESHOT_ABS: u64 = 0;
/// `CreateTimer` mode: the timeout argument is relative to now, in ms.
pub const TIMER_ONESHOT_REL: u64 = 1;

/// `OpenFile` flag words (fcntl-compatible access modes).
pub const O_RDONLY: u64 = 0;
pub const O_WRONLY: u64 = 1;
pub const O_RDWR: u64 = 2;
pub const O_ACCMODE: u64 = 3;

/// Signal number used to derive the exit code (`128 + SIGSEGV`) of a task
/// killed by an unrecoverable fault.
pub const SIGSEGV: i32 = 11;

/// Discriminator for `AppEvent`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum AppEventKind {
    Quit = 0,
    KeyPush = 1,
    MouseMove = 2,
    MouseButton = 3,
    TimerTimeout = 4,
}

impl core::convert::TryFrom<u32> for AppEventKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Quit),
            1 => Ok(Self::KeyPush),
            2 => Ok(Self::MouseMove),
            3 => Ok(Self::MouseButton),
            4 => Ok(Self::TimerTimeout),
            _ => Err(()),
        }
    }
}

/// Event record written into user memory by `ReadEvent`.
///
/// This is a flattened form of a tagged union: `kind` selects which of the
/// remaining fields are meaningful, and everything else is zero. Keeping
/// the layout flat (48 bytes, no padding) means any byte pattern is a valid
/// `AppEvent`, which is what lets the kernel treat user event buffers as
/// plain memory.
///
/// Field validity by kind:
///
/// - `Quit`: no payload.
/// - `KeyPush`: `modifier`, `keycode`, `ascii`, `press`.
/// - `MouseMove`: `x`, `y`, `dx`, `dy`, `buttons`.
/// - `MouseButton`: `x`, `y`, `press`, `button`.
/// - `TimerTimeout`: `timeout` (tick), `value` (positive, user-chosen).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct AppEvent {
    pub kind: u32,
    pub modifier: u8,
    pub keycode: u8,
    pub ascii: u8,
    pub press: u8,
    pub x: i32,
    pub y: i32,
    pub dx: i32,
    pub dy: i32,
    pub buttons: u8,
    pub button: u8,
    pub reserved: [u8; 6],
    pub timeout: u64,
    pub value: i64,
}

impl AppEvent {
    pub fn quit() -> Self {
        Self {
            kind: AppEventKind::Quit as u32,
            ..Self::default()
        }
    }

    pub fn key_push(modifier: u8, keycode: u8, ascii: u8, press: bool) -> Self {
        Self {
            kind: AppEventKind::KeyPush as u32,
            modifier,
            keycode,
            ascii,
            press: press as u8,
            ..Self::default()
        }
    }

    pub fn mouse_move(x: i32, y: i32, dx: i32, dy: i32, buttons: u8) -> Self {
        Self {
            kind: AppEventKind::MouseMove as u32,
            x,
            y,
            dx,
            dy,
            buttons,
            ..Self::default()
        }
    }

    pub fn mouse_button(x: i32, y: i32, press: bool, button: u8) -> Self {
        Self {
            kind: AppEventKind::MouseButton as u32,
            x,
            y,
            press: press as u8,
            button,
            ..Self::default()
        }
    }

    pub fn timer_timeout(timeout: u64, value: i64) -> Self {
        Self {
            kind: AppEventKind::TimerTimeout as u32,
            timeout,
            value,
            ..Self::default()
        }
    }
}

/// The syscall return convention: a pair of 64-bit words. `error` is zero
/// on success, or an `ErrorCode` value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct SyscallResult {
    pub value: u64,
    pub error: u64,
}

impl SyscallResult {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn app_event_has_no_padding() {
        // IntoBytes would fail to derive if padding existed; this pins the
        // overall size so the user-side struct cannot drift.
        assert_eq!(core::mem::size_of::<AppEvent>(), 48);
    }

    #[test]
    fn sysnum_round_trip() {
        for n in 0..0x10u64 {
            let s = Sysnum::try_from(n).unwrap();
            assert_eq!(s as u64, n);
        }
        assert!(Sysnum::try_from(0x10).is_err());
        assert!(Sysnum::try_from(u64::MAX).is_err());
    }

    #[test]
    fn level_importance() {
        assert!(Level(3).is_more_important_than(Level(0)));
        assert!(!Level(0).is_more_important_than(Level(0)));
        assert!(!Level(1).is_more_important_than(Level(2)));
    }

    #[test]
    fn control_is_either_ctrl() {
        assert!(KeyModifiers::CONTROL.intersects(KeyModifiers::L_CTRL));
        assert!(KeyModifiers::CONTROL.intersects(KeyModifiers::R_CTRL));
        assert!(!KeyModifiers::CONTROL.intersects(KeyModifiers::L_SHIFT));
    }
}
