// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-task syscall interface.
//!
//! Thin, typed wrappers over the raw syscall ABI: number in `rax`,
//! arguments in `rdi rsi rdx r10 r8 r9`, result pair in `rax:rdx`. The
//! kernel preserves callee-saved registers across a syscall and nothing
//! else.
//!
//! On anything other than the bare-metal target the raw stubs are
//! compiled as panics, so user-task crates can still be type-checked and
//! unit-tested hosted.

#![cfg_attr(target_os = "none", no_std)]

use abi::{AppEvent, ErrorCode, SyscallResult, Sysnum};
use core::ffi::CStr;

/// A nonzero error word from the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Error(pub u64);

impl Error {
    pub fn is(&self, code: ErrorCode) -> bool {
        self.0 == code as u64
    }
}

fn result(r: SyscallResult) -> Result<u64, Error> {
    if r.error == 0 {
        Ok(r.value)
    } else {
        Err(Error(r.error))
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        /// Raw syscall with up to six arguments.
        ///
        /// # Safety
        ///
        /// Pointer-carrying arguments must satisfy whatever the given
        /// syscall's contract says about them.
        unsafe fn syscall6(
            nr: Sysnum,
            a1: u64,
            a2: u64,
            a3: u64,
            a4: u64,
            a5: u64,
            a6: u64,
        ) -> SyscallResult {
            let value: u64;
            let error: u64;
            // The kernel runs the dispatcher through the C ABI, so every
            // caller-saved register comes back clobbered; the `=> _`
            // outputs say so.
            core::arch::asm!(
                "syscall",
                inout("rax") nr as u64 => value,
                inout("rdi") a1 => _,
                inout("rsi") a2 => _,
                inout("rdx") a3 => error,
                inout("r10") a4 => _,
                inout("r8") a5 => _,
                inout("r9") a6 => _,
                out("rcx") _,
                out("r11") _,
            );
            SyscallResult { value, error }
        }
    } else {
        unsafe fn syscall6(
            nr: Sysnum,
            _a1: u64,
            _a2: u64,
            _a3: u64,
            _a4: u64,
            _a5: u64,
            _a6: u64,
        ) -> SyscallResult {
            unimplemented!("syscall {nr:?} requires the bare-metal target")
        }
    }
}

unsafe fn syscall3(nr: Sysnum, a1: u64, a2: u64, a3: u64) -> SyscallResult {
    syscall6(nr, a1, a2, a3, 0, 0, 0)
}

/// Writes a line to the kernel console at the given log level.
pub fn sys_log_string(level: abi::LogLevel, s: &CStr) -> Result<u64, Error> {
    result(unsafe {
        syscall3(Sysnum::LogString, level as u64, s.as_ptr() as u64, 0)
    })
}

/// Writes bytes to one of the task's file descriptors (1 = terminal).
pub fn sys_put_string(fd: u64, s: &[u8]) -> Result<u64, Error> {
    result(unsafe {
        syscall3(Sysnum::PutString, fd, s.as_ptr() as u64, s.len() as u64)
    })
}

/// Terminates the calling task. Does not return.
pub fn sys_exit(code: i32) -> ! {
    unsafe {
        syscall3(Sysnum::Exit, code as u64, 0, 0);
    }
    // The kernel unwound away from us; nothing executes here.
    unreachable!()
}

/// Opens a `w` x `h` window at `(x, y)`. Returns the layer id.
pub fn sys_open_window(
    w: i32,
    h: i32,
    x: i32,
    y: i32,
    title: &CStr,
) -> Result<u64, Error> {
    result(unsafe {
        syscall6(
            Sysnum::OpenWindow,
            w as u64,
            h as u64,
            x as u64,
            y as u64,
            title.as_ptr() as u64,
            0,
        )
    })
}

/// Draws a string. `layer_id_flags` may carry `abi::LAYER_NO_REDRAW`.
pub fn sys_win_write_string(
    layer_id_flags: u64,
    x: i32,
    y: i32,
    color: u32,
    s: &CStr,
) -> Result<u64, Error> {
    result(unsafe {
        syscall6(
            Sysnum::WinWriteString,
            layer_id_flags,
            x as u64,
            y as u64,
            u64::from(color),
            s.as_ptr() as u64,
            0,
        )
    })
}

pub fn sys_win_fill_rectangle(
    layer_id_flags: u64,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    color: u32,
) -> Result<u64, Error> {
    result(unsafe {
        syscall6(
            Sysnum::WinFillRectangle,
            layer_id_flags,
            x as u64,
            y as u64,
            w as u64,
            h as u64,
            u64::from(color),
        )
    })
}

/// Reads the kernel clock: `(tick, ticks_per_second)`.
pub fn sys_get_current_tick() -> (u64, u64) {
    let r = unsafe { syscall3(Sysnum::GetCurrentTick, 0, 0, 0) };
    (r.value, r.error)
}

pub fn sys_win_redraw(layer_id: u64) -> Result<u64, Error> {
    result(unsafe { syscall3(Sysnum::WinRedraw, layer_id, 0, 0) })
}

pub fn sys_win_draw_line(
    layer_id_flags: u64,
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    color: u32,
) -> Result<u64, Error> {
    result(unsafe {
        syscall6(
            Sysnum::WinDrawLine,
            layer_id_flags,
            x0 as u64,
            y0 as u64,
            x1 as u64,
            y1 as u64,
            u64::from(color),
        )
    })
}

pub fn sys_close_window(layer_id: u64) -> Result<u64, Error> {
    result(unsafe { syscall3(Sysnum::CloseWindow, layer_id, 0, 0) })
}

/// Blocks until at least one event is available, then fills `events`.
/// Returns how many were delivered.
pub fn sys_read_event(events: &mut [AppEvent]) -> Result<usize, Error> {
    result(unsafe {
        syscall3(
            Sysnum::ReadEvent,
            events.as_mut_ptr() as u64,
            events.len() as u64,
            0,
        )
    })
    .map(|n| n as usize)
}

/// Arms a one-shot timer. `mode` is `abi::TIMER_ONESHOT_REL` or
/// `abi::TIMER_ONESHOT_ABS`; `value` (positive) comes back in the
/// timeout event. Returns the absolute timeout in milliseconds.
pub fn sys_create_timer(
    mode: u64,
    value: i32,
    millis: u64,
) -> Result<u64, Error> {
    result(unsafe {
        syscall3(Sysnum::CreateTimer, mode, value as u64, millis)
    })
}

/// Opens a file. Returns the new descriptor number.
pub fn sys_open_file(path: &CStr, flags: u64) -> Result<u64, Error> {
    result(unsafe {
        syscall3(Sysnum::OpenFile, path.as_ptr() as u64, flags, 0)
    })
}

pub fn sys_read_file(fd: u64, buf: &mut [u8]) -> Result<usize, Error> {
    result(unsafe {
        syscall3(
            Sysnum::ReadFile,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u64,
        )
    })
    .map(|n| n as usize)
}

/// Grows the demand-paging window by `num_pages` pages and returns the
/// base address of the new pages.
pub fn sys_demand_pages(num_pages: u64) -> Result<u64, Error> {
    result(unsafe { syscall3(Sysnum::DemandPages, num_pages, 0, 0) })
}

/// Maps the file behind `fd` into the address space. Returns the base
/// address and the file size; pages load on first touch.
pub fn sys_map_file(fd: u64) -> Result<(u64, u64), Error> {
    let mut size: u64 = 0;
    let base = result(unsafe {
        syscall3(Sysnum::MapFile, fd, &mut size as *mut u64 as u64, 0)
    })?;
    Ok((base, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_matching() {
        let e = Error(ErrorCode::BadFd as u64);
        assert!(e.is(ErrorCode::BadFd));
        assert!(!e.is(ErrorCode::NoEnt));
    }
}
