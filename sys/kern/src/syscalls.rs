// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*`
//! modules: the entry sequence has already hopped onto the task's kernel
//! stack and marshalled the six argument registers into a [`SyscallArgs`]
//! by the time [`dispatch`] runs. The return convention is a
//! `(value, error)` pair; `error` is zero or an `ErrorCode`.
//!
//! Most syscalls are implemented by functions with the signature
//!
//! ```ignore
//! fn syscall(kernel: &mut Kernel, args: &SyscallArgs) -> Result<u64, ErrorCode>;
//! ```
//!
//! and a common wrapper turns the result into the pair. `Exit` and
//! `GetCurrentTick` are irregular -- both words of their return pair are
//! meaningful -- so they construct the pair themselves.
//!
//! Syscalls run with interrupts enabled and bracket their critical
//! sections explicitly; the scheduler may preempt a task mid-syscall at
//! any point outside those brackets.

use abi::{
    AppEvent, ErrorCode, KeyModifiers, LogLevel, Sysnum, SyscallResult,
    LAYER_ID_MASK, LAYER_NO_REDRAW, O_ACCMODE, O_WRONLY, QUIT_KEYCODE,
};
use core::convert::TryFrom;

use crate::arch;
use crate::config::TIMER_FREQ;
use crate::ipc::Message;
use crate::layer::{LayerId, Rect, Window};
use crate::startup::Kernel;
use crate::task::FileMapping;
use crate::time::Tick;
use crate::timer::Timer;
use crate::umem::{copy_user_c_str, USlice};
use crate::util::{ceil_div, floor_div};

/// Longest string argument (log lines, `PutString` payloads) a task may
/// pass.
const MAX_STRING_LEN: usize = 1024;

/// The raw syscall request: number plus the six argument registers.
#[derive(Copy, Clone, Debug)]
pub struct SyscallArgs {
    pub nr: u64,
    pub args: [u64; 6],
}

/// Decodes and executes one syscall for the task on the CPU.
pub fn dispatch(kernel: &mut Kernel, args: &SyscallArgs) -> SyscallResult {
    let res = match Sysnum::try_from(args.nr) {
        Ok(Sysnum::LogString) => log_string(kernel, args),
        Ok(Sysnum::PutString) => put_string(kernel, args),
        Ok(Sysnum::Exit) => return exit(kernel, args),
        Ok(Sysnum::OpenWindow) => open_window(kernel, args),
        Ok(Sysnum::WinWriteString) => win_write_string(kernel, args),
        Ok(Sysnum::WinFillRectangle) => win_fill_rectangle(kernel, args),
        Ok(Sysnum::GetCurrentTick) => return get_current_tick(kernel),
        Ok(Sysnum::WinRedraw) => win_redraw(kernel, args),
        Ok(Sysnum::WinDrawLine) => win_draw_line(kernel, args),
        Ok(Sysnum::CloseWindow) => close_window(kernel, args),
        Ok(Sysnum::ReadEvent) => read_event(kernel, args),
        Ok(Sysnum::CreateTimer) => create_timer(kernel, args),
        Ok(Sysnum::OpenFile) => open_file(kernel, args),
        Ok(Sysnum::ReadFile) => read_file(kernel, args),
        Ok(Sysnum::DemandPages) => demand_pages(kernel, args),
        Ok(Sysnum::MapFile) => map_file(kernel, args),
        Err(()) => Err(ErrorCode::NoSys),
    };
    match res {
        Ok(value) => SyscallResult { value, error: 0 },
        Err(e) => SyscallResult {
            value: 0,
            error: e as u64,
        },
    }
}

/// Syscall 0x0: writes a line to the kernel console at the given level.
fn log_string(
    _kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let level =
        LogLevel::try_from(args.args[0]).map_err(|_| ErrorCode::Perm)?;
    // Safety: the string lives in the calling task's address space; a bad
    // pointer faults in that task.
    let s = unsafe {
        copy_user_c_str(args.args[1] as usize, MAX_STRING_LEN)?
    };
    let len = s.len() as u64;
    klog!(level, "{}", s);
    Ok(len)
}

/// Syscall 0x1: writes bytes to one of the task's file descriptors
/// (conventionally 1, the terminal).
fn put_string(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let fd = args.args[0] as usize;
    let len = args.args[2] as usize;
    if len > MAX_STRING_LEN {
        return Err(ErrorCode::TooBig);
    }
    let slice = USlice::<u8>::from_raw(args.args[1] as usize, len)?;
    // Safety: task memory, same argument as for `log_string`.
    let bytes = unsafe { slice.assume_readable() };

    let task = kernel.tasks.current_task();
    let file = task.file_mut(fd).ok_or(ErrorCode::BadFd)?;
    file.write(bytes);
    Ok(len as u64)
}

/// Syscall 0x2: leaves user mode for good.
///
/// Irregular return: `value` is the task's recorded OS stack pointer and
/// `error` the exit code. The entry stub unwinds to that stack, which
/// resumes the in-kernel app runner; the runner then calls
/// `Kernel::finish_current` to tear the task down.
fn exit(kernel: &mut Kernel, args: &SyscallArgs) -> SyscallResult {
    let os_sp = arch::without_interrupts(|| {
        kernel.tasks.current_task().os_stack_pointer()
    });
    SyscallResult {
        value: os_sp,
        error: args.args[0],
    }
}

/// Syscall 0x3: creates a window (a compositor layer) and focuses it.
fn open_window(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let (w, h) = (args.args[0] as u32, args.args[1] as u32);
    let (x, y) = (args.args[2] as i32, args.args[3] as i32);
    // Safety: task memory, same argument as for `log_string`.
    let title = unsafe {
        copy_user_c_str(args.args[4] as usize, MAX_STRING_LEN)?
    };

    let id = arch::without_interrupts(|| {
        let id = kernel.layers.new_layer(w, h, x, y, &title);
        kernel.layers.activate(id);
        let owner = kernel.tasks.current_id();
        kernel.layer_owners.insert(id, owner);
        id
    });
    Ok(u64::from(id.0))
}

/// Common shape of the window-mutating syscalls: resolve the composite
/// `layer_id | flags` argument, apply `body` to the window, and redraw
/// that layer and everything above it unless the no-redraw bit is set.
fn with_window(
    kernel: &mut Kernel,
    layer_id_flags: u64,
    body: impl FnOnce(&mut dyn Window) -> Result<u64, ErrorCode>,
) -> Result<u64, ErrorCode> {
    let layer_id = LayerId((layer_id_flags & LAYER_ID_MASK) as u32);

    let value = {
        let layer = arch::without_interrupts(|| {
            kernel.layers.find_layer(layer_id)
        });
        let layer = layer.ok_or(ErrorCode::BadFd)?;
        body(layer.window())?
    };

    if layer_id_flags & LAYER_NO_REDRAW == 0 {
        arch::without_interrupts(|| kernel.layers.draw_layer(layer_id));
    }
    Ok(value)
}

/// Syscall 0x4: draws a string into a window.
fn win_write_string(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let (x, y) = (args.args[1] as i32, args.args[2] as i32);
    let color = args.args[3] as u32;
    // Safety: task memory, same argument as for `log_string`.
    let s = unsafe {
        copy_user_c_str(args.args[4] as usize, MAX_STRING_LEN)?
    };
    with_window(kernel, args.args[0], |win| {
        win.write_string(x, y, color, &s);
        Ok(0)
    })
}

/// Syscall 0x5: fills a rectangle in a window.
fn win_fill_rectangle(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let (x, y) = (args.args[1] as i32, args.args[2] as i32);
    let (w, h) = (args.args[3] as i32, args.args[4] as i32);
    let color = args.args[5] as u32;
    with_window(kernel, args.args[0], |win| {
        win.fill_rectangle(x, y, w, h, color);
        Ok(0)
    })
}

/// Syscall 0x6: reads the kernel clock.
///
/// Irregular return: `value` is the tick count and `error` the tick
/// frequency, so tasks can convert without a second call.
fn get_current_tick(kernel: &mut Kernel) -> SyscallResult {
    SyscallResult {
        value: u64::from(kernel.timers.current_tick()),
        error: TIMER_FREQ,
    }
}

/// Syscall 0x7: redraws a window, typically after a batch of no-redraw
/// mutations.
fn win_redraw(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    with_window(kernel, args.args[0], |_| Ok(0))
}

/// Draws the segment from `(x0, y0)` to `(x1, y1)` by walking the major
/// axis, rounding the minor coordinate toward the start point. Integer
/// floor/ceil divisions stand in for the usual floating-point slope.
fn draw_line(
    win: &mut dyn Window,
    mut x0: i32,
    mut y0: i32,
    mut x1: i32,
    mut y1: i32,
    color: u32,
) {
    fn sign(x: i32) -> i32 {
        match x {
            _ if x > 0 => 1,
            _ if x < 0 => -1,
            _ => 0,
        }
    }

    // Inclusive spans; the extra `sign` keeps single-pixel segments from
    // dividing by zero below.
    let dx = x1 - x0 + sign(x1 - x0);
    let dy = y1 - y0 + sign(y1 - y0);

    if dx == 0 && dy == 0 {
        win.writer().write(x0, y0, color);
        return;
    }

    if dx.abs() >= dy.abs() {
        if dx < 0 {
            core::mem::swap(&mut x0, &mut x1);
            core::mem::swap(&mut y0, &mut y1);
        }
        let round_down = y1 >= y0;
        for x in x0..=x1 {
            let num = dy as i64 * (x - x0) as i64;
            let frac = if round_down {
                floor_div(num, dx as i64)
            } else {
                ceil_div(num, dx as i64)
            };
            win.writer().write(x, y0 + frac as i32, color);
        }
    } else {
        if dy < 0 {
            core::mem::swap(&mut x0, &mut x1);
            core::mem::swap(&mut y0, &mut y1);
        }
        let round_down = x1 >= x0;
        for y in y0..=y1 {
            let num = dx as i64 * (y - y0) as i64;
            let frac = if round_down {
                floor_div(num, dy as i64)
            } else {
                ceil_div(num, dy as i64)
            };
            win.writer().write(x0 + frac as i32, y, color);
        }
    }
}

/// Syscall 0x8: draws a line segment into a window.
fn win_draw_line(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let (x0, y0) = (args.args[1] as i32, args.args[2] as i32);
    let (x1, y1) = (args.args[3] as i32, args.args[4] as i32);
    let color = args.args[5] as u32;
    with_window(kernel, args.args[0], |win| {
        draw_line(win, x0, y0, x1, y1, color);
        Ok(0)
    })
}

/// Syscall 0x9: closes a window, heals the exposed region, and drops the
/// layer <-> task association.
fn close_window(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let layer_id = LayerId((args.args[0] & LAYER_ID_MASK) as u32);

    arch::without_interrupts(|| {
        let (pos, size) = {
            let layer =
                kernel.layers.find_layer(layer_id).ok_or(ErrorCode::BadFd)?;
            (layer.position(), layer.window().size())
        };

        kernel.layers.activate(LayerId::NONE);
        kernel.layers.remove_layer(layer_id);
        kernel.layers.draw_rect(Rect {
            x: pos.0,
            y: pos.1,
            w: size.0 as i32,
            h: size.1 as i32,
        });
        kernel.layer_owners.remove(&layer_id);
        Ok(0)
    })
}

/// Turns one kernel message into the user-visible event record, or
/// nothing if the message is not for user eyes.
///
/// The quit chord is exactly Ctrl+Q *pressed*: that one keystroke becomes
/// a single `Quit` event (a release of the same chord is an ordinary key
/// event). Timer messages surface only for user-created timers, whose
/// negated tag is flipped back positive here; kernel-internal timer
/// values stay internal. A compositor close request also surfaces as
/// `Quit`, since that is the decision being requested of the task.
fn translate_event(msg: Message) -> Option<AppEvent> {
    match msg {
        Message::KeyPush {
            modifier,
            keycode,
            ascii,
            press,
        } => {
            let mods = KeyModifiers::from_bits_truncate(modifier);
            if keycode == QUIT_KEYCODE
                && mods.intersects(KeyModifiers::CONTROL)
                && press
            {
                Some(AppEvent::quit())
            } else {
                Some(AppEvent::key_push(modifier, keycode, ascii, press))
            }
        }
        Message::MouseMove {
            x,
            y,
            dx,
            dy,
            buttons,
        } => Some(AppEvent::mouse_move(x, y, dx, dy, buttons)),
        Message::MouseButton {
            x,
            y,
            press,
            button,
        } => Some(AppEvent::mouse_button(x, y, press, button)),
        Message::TimerTimeout { timeout, value } => {
            if value < 0 {
                Some(AppEvent::timer_timeout(
                    u64::from(timeout),
                    -(value as i64),
                ))
            } else {
                None
            }
        }
        Message::WindowClose { .. } => Some(AppEvent::quit()),
        other => {
            klog!(LogLevel::Info, "uncaught event type: {:?}", other);
            None
        }
    }
}

/// Syscall 0xa: drains the task's mailbox into a user buffer, blocking
/// until at least one translatable event arrives.
fn read_event(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    if !arch::is_user_address(args.args[0]) {
        return Err(ErrorCode::Fault);
    }
    let mut slice =
        USlice::<AppEvent>::from_raw(args.args[0] as usize, args.args[1] as usize)?;
    // Safety: the buffer is in the calling task's address space and stays
    // alive for the duration of the call; a bad address faults in that
    // task.
    let events = unsafe { slice.assume_writable() };

    let mut i = 0;
    while i < events.len() {
        arch::cli();
        let msg = kernel.tasks.current_task().receive_message();
        if msg.is_none() && i == 0 {
            // Nothing delivered yet. Sleep inside the syscall, on this
            // task's own kernel stack; `send_message` wakes us and the
            // loop re-checks. Interrupts come back on with the next
            // task's saved flags.
            kernel.tasks.sleep_current();
            continue;
        }
        arch::sti();

        let Some(msg) = msg else { break };
        if let Some(ev) = translate_event(msg) {
            events[i] = ev;
            i += 1;
        }
    }
    Ok(i as u64)
}

/// Syscall 0xb: arms a one-shot timer owned by the calling task.
///
/// Mode bit 0 selects a relative timeout; the value is stored negated to
/// tag it as user-created. Returns the absolute timeout in milliseconds.
fn create_timer(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let mode = args.args[0];
    let value = args.args[1] as i32;
    if value <= 0 {
        return Err(ErrorCode::Inval);
    }

    let mut timeout = args.args[2] * TIMER_FREQ / 1000;
    if mode & abi::TIMER_ONESHOT_REL != 0 {
        timeout += u64::from(kernel.timers.current_tick());
    }

    arch::without_interrupts(|| {
        let task = kernel.tasks.current_id();
        kernel
            .timers
            .add_timer(Timer::new(Tick::from(timeout), -value, task));
    });
    Ok(timeout * 1000 / TIMER_FREQ)
}

/// Syscall 0xc: opens a file, returning a descriptor number.
fn open_file(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    // Safety: task memory, same argument as for `log_string`.
    let path = unsafe {
        copy_user_c_str(args.args[0] as usize, MAX_STRING_LEN)?
    };
    let flags = args.args[1];

    // "@stdin" names the standard input already in slot 0.
    if path == "@stdin" {
        return Ok(0);
    }
    if flags & O_ACCMODE == O_WRONLY {
        return Err(ErrorCode::Inval);
    }

    let file = kernel.fs.open(&path, flags)?;
    let task = kernel.tasks.current_task();
    let fd = task.alloc_fd();
    task.set_file(fd, file);
    Ok(fd as u64)
}

/// Syscall 0xd: reads from an open descriptor at its cursor.
fn read_file(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let fd = args.args[0] as usize;
    let count = args.args[2] as usize;
    let mut slice = USlice::<u8>::from_raw(args.args[1] as usize, count)?;

    let task = kernel.tasks.current_task();
    let file = task.file_mut(fd).ok_or(ErrorCode::BadFd)?;
    // Safety: the buffer is in the calling task's address space.
    let buf = unsafe { slice.assume_writable() };
    Ok(file.read(buf) as u64)
}

/// Syscall 0xe: grows the task's demand-paging window by `num_pages`,
/// returning the old end (the base of the new pages). The pages
/// materialize, zeroed, on first touch.
fn demand_pages(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let num_pages = args.args[0];
    let task = kernel.tasks.current_task();
    let dp_end = task.dpaging_end();
    task.set_dpaging_end(dp_end + 4096 * num_pages);
    Ok(dp_end)
}

/// Syscall 0xf: reserves a file-backed range below `file_map_end`,
/// growing downward, and reports the file's size through the second
/// argument. Pages load lazily on first touch.
fn map_file(
    kernel: &mut Kernel,
    args: &SyscallArgs,
) -> Result<u64, ErrorCode> {
    let fd = args.args[0] as usize;
    let mut size_out = USlice::<u64>::from_raw(args.args[1] as usize, 1)?;

    let task = kernel.tasks.current_task();
    let size = task.file_mut(fd).ok_or(ErrorCode::BadFd)?.size() as u64;
    // Safety: the out-pointer is in the calling task's address space.
    unsafe {
        size_out.assume_writable()[0] = size;
    }

    let vaddr_end = task.file_map_end();
    let vaddr_begin = (vaddr_end - size) & 0xffff_ffff_ffff_f000;
    task.set_file_map_end(vaddr_begin);
    task.add_file_mapping(FileMapping {
        fd,
        vaddr_begin,
        vaddr_end,
    });
    Ok(vaddr_begin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::FileDescriptor;
    use crate::layer::LayerManager;
    use crate::startup::Kernel;
    use crate::test_support::{
        MemFile, TestFrames, TestFs, TestLayerManager,
    };
    use abi::AppEventKind;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    fn kernel() -> Kernel {
        kernel_with_fs(TestFs::new())
    }

    fn kernel_with_fs(fs: TestFs) -> Kernel {
        Kernel::new(
            Box::new(TestLayerManager::new()),
            Box::new(TestFrames::new()),
            Box::new(fs),
        )
    }

    fn call(k: &mut Kernel, nr: u64, args: [u64; 6]) -> SyscallResult {
        dispatch(k, &SyscallArgs { nr, args })
    }

    /// Peeks at the concrete layer-manager fake behind the trait object.
    fn layers(k: &mut Kernel) -> &mut TestLayerManager {
        unsafe {
            &mut *(k.layers.as_mut() as *mut dyn LayerManager
                as *mut TestLayerManager)
        }
    }

    fn open_test_window(k: &mut Kernel) -> u64 {
        let title = b"win\0";
        let r = call(
            k,
            0x3,
            [40, 30, 10, 10, title.as_ptr() as u64, 0],
        );
        assert_eq!(r.error, 0);
        r.value
    }

    #[test]
    fn unknown_numbers_are_enosys() {
        let mut k = kernel();
        for nr in [0x10u64, 0x100, u64::MAX] {
            let r = call(&mut k, nr, [0; 6]);
            assert_eq!(
                (r.value, r.error),
                (0, ErrorCode::NoSys as u64)
            );
        }
    }

    #[test]
    fn log_string_validates_level_first() {
        let mut k = kernel();
        let msg = b"hello\0";
        let r = call(&mut k, 0x0, [5, msg.as_ptr() as u64, 0, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::Perm as u64);

        let r = call(&mut k, 0x0, [3, msg.as_ptr() as u64, 0, 0, 0, 0]);
        assert_eq!((r.value, r.error), (5, 0));
    }

    #[test]
    fn log_string_rejects_long_strings() {
        let mut k = kernel();
        let mut long = vec![b'a'; 1100];
        long.push(0);
        let r = call(&mut k, 0x0, [3, long.as_ptr() as u64, 0, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::TooBig as u64);
    }

    #[test]
    fn put_string_writes_to_fd_one() {
        let mut k = kernel();
        k.tasks
            .current_task()
            .set_file(1, Box::new(MemFile::new(Vec::new())));

        let text = b"terminal says hi";
        let r = call(
            &mut k,
            0x1,
            [1, text.as_ptr() as u64, text.len() as u64, 0, 0, 0],
        );
        assert_eq!((r.value, r.error), (text.len() as u64, 0));

        let file = k.tasks.current_task().file_mut(1).unwrap();
        let mem = unsafe {
            &*(file.as_mut() as *mut dyn FileDescriptor as *const MemFile)
        };
        assert_eq!(mem.written(), text);
    }

    #[test]
    fn put_string_bad_fd() {
        let mut k = kernel();
        let text = b"x";
        let r = call(&mut k, 0x1, [7, text.as_ptr() as u64, 1, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::BadFd as u64);
    }

    #[test]
    fn put_string_too_big() {
        let mut k = kernel();
        let r = call(&mut k, 0x1, [1, 0x2000, 4096, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::TooBig as u64);
    }

    #[test]
    fn exit_returns_unwind_pair() {
        let mut k = kernel();
        k.tasks.current_task().set_os_stack_pointer(0xcafe_f000);
        let r = call(&mut k, 0x2, [42, 0, 0, 0, 0, 0]);
        assert_eq!((r.value, r.error), (0xcafe_f000, 42));
    }

    #[test]
    fn open_window_focuses_and_records_owner() {
        let mut k = kernel();
        let id = open_test_window(&mut k);
        assert_eq!(id, 1);

        let owner = k.layer_owners[&LayerId(1)];
        assert_eq!(owner, k.tasks.current_id());
        assert_eq!(layers(&mut k).active, LayerId(1));
        assert_eq!(layers(&mut k).layers[&1].title, "win");
    }

    #[test]
    fn window_ops_reject_unknown_layer() {
        let mut k = kernel();
        let s = b"x\0";
        for (nr, args) in [
            (0x4u64, [99u64, 0, 0, 0, s.as_ptr() as u64, 0]),
            (0x5, [99, 0, 0, 5, 5, 0]),
            (0x7, [99, 0, 0, 0, 0, 0]),
            (0x8, [99, 0, 0, 3, 3, 0]),
            (0x9, [99, 0, 0, 0, 0, 0]),
        ] {
            let r = call(&mut k, nr, args);
            assert_eq!(r.error, ErrorCode::BadFd as u64, "syscall {nr:#x}");
        }
    }

    #[test]
    fn fill_rectangle_draws_and_redraws() {
        let mut k = kernel();
        let id = open_test_window(&mut k);

        let r = call(&mut k, 0x5, [id, 2, 3, 4, 2, 0xff00ff]);
        assert_eq!(r.error, 0);

        let lm = layers(&mut k);
        // Committed to the screen because the redraw bit was clear.
        let screen = lm.screen_of(LayerId(id as u32)).unwrap();
        let (w, _) = (40usize, 30usize);
        for dy in 0..2 {
            for dx in 0..4 {
                assert_eq!(screen[(3 + dy) * w + 2 + dx], 0xff00ff);
            }
        }
        assert_eq!(lm.draw_calls.len(), 1);
    }

    #[test]
    fn no_redraw_batches_coalesce() {
        // K mutations with the no-redraw bit plus one WinRedraw must end
        // with the same committed pixels as K redrawing mutations.
        let mut a = kernel();
        let mut b = kernel();
        let ida = open_test_window(&mut a);
        let idb = open_test_window(&mut b);

        let rects: [[u64; 4]; 3] = [[0, 0, 8, 8], [4, 4, 8, 8], [10, 2, 5, 20]];
        for (i, [x, y, w, h]) in rects.iter().enumerate() {
            let color = 0x111111 * (i as u64 + 1);
            let r = call(
                &mut a,
                0x5,
                [ida | LAYER_NO_REDRAW, *x, *y, *w, *h, color],
            );
            assert_eq!(r.error, 0);
            let r = call(&mut b, 0x5, [idb, *x, *y, *w, *h, color]);
            assert_eq!(r.error, 0);
        }
        // Nothing committed yet on the batching side.
        assert!(layers(&mut a).draw_calls.is_empty());

        let r = call(&mut a, 0x7, [ida, 0, 0, 0, 0, 0]);
        assert_eq!(r.error, 0);

        let sa = layers(&mut a).screen_of(LayerId(ida as u32)).unwrap().clone();
        let sb = layers(&mut b).screen_of(LayerId(idb as u32)).unwrap().clone();
        assert_eq!(sa, sb);
        assert_eq!(layers(&mut a).draw_calls.len(), 1);
        assert_eq!(layers(&mut b).draw_calls.len(), 3);
    }

    #[test]
    fn get_current_tick_returns_tick_and_freq() {
        let mut k = kernel();
        let Kernel { tasks, timers, .. } = &mut k;
        for _ in 0..7 {
            let _ = timers.tick(tasks);
        }
        let r = call(&mut k, 0x6, [0; 6]);
        assert_eq!((r.value, r.error), (7, TIMER_FREQ));
    }

    #[test]
    fn draw_line_matches_float_reference() {
        let mut k = kernel();
        let id = open_test_window(&mut k);

        let segments =
            [(0, 0, 10, 4), (10, 4, 0, 0), (3, 20, 5, 2), (7, 7, 7, 7)];
        for (x0, y0, x1, y1) in segments {
            let r = call(
                &mut k,
                0x8,
                [
                    id,
                    x0 as u64,
                    y0 as u64,
                    x1 as u64,
                    y1 as u64,
                    0xabcdef,
                ],
            );
            assert_eq!(r.error, 0);
        }

        // Reference rasterizer: the same walk in floating point.
        let mut expected = vec![0u32; 40 * 30];
        let mut put = |x: i64, y: i64| {
            if (0..40).contains(&x) && (0..30).contains(&y) {
                expected[(y * 40 + x) as usize] = 0xabcdef;
            }
        };
        for (x0, y0, x1, y1) in segments {
            let (mut x0, mut y0, mut x1, mut y1) =
                (x0 as i64, y0 as i64, x1 as i64, y1 as i64);
            let sign = |v: i64| (v > 0) as i64 - (v < 0) as i64;
            let dx = x1 - x0 + sign(x1 - x0);
            let dy = y1 - y0 + sign(y1 - y0);
            if dx == 0 && dy == 0 {
                put(x0, y0);
                continue;
            }
            if dx.abs() >= dy.abs() {
                if dx < 0 {
                    core::mem::swap(&mut x0, &mut x1);
                    core::mem::swap(&mut y0, &mut y1);
                }
                let m = dy as f64 / dx as f64;
                for x in x0..=x1 {
                    let v = m * (x - x0) as f64 + y0 as f64;
                    let y =
                        if y1 >= y0 { v.floor() } else { v.ceil() } as i64;
                    put(x, y);
                }
            } else {
                if dy < 0 {
                    core::mem::swap(&mut x0, &mut x1);
                    core::mem::swap(&mut y0, &mut y1);
                }
                let m = dx as f64 / dy as f64;
                for y in y0..=y1 {
                    let v = m * (y - y0) as f64 + x0 as f64;
                    let x =
                        if x1 >= x0 { v.floor() } else { v.ceil() } as i64;
                    put(x, y);
                }
            }
        }

        assert_eq!(layers(&mut k).layers[&(id as u32)].buf, expected);
    }

    #[test]
    fn close_window_heals_and_unmaps_owner() {
        let mut k = kernel();
        let id = open_test_window(&mut k);

        let r = call(&mut k, 0x9, [id, 0, 0, 0, 0, 0]);
        assert_eq!(r.error, 0);

        assert!(!k.layer_owners.contains_key(&LayerId(id as u32)));
        let lm = layers(&mut k);
        assert_eq!(lm.active, LayerId::NONE);
        assert!(lm.layers.is_empty());
        assert_eq!(
            lm.rect_draws,
            vec![Rect {
                x: 10,
                y: 10,
                w: 40,
                h: 30
            }]
        );

        // Closing again is EBADF.
        let r = call(&mut k, 0x9, [id, 0, 0, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::BadFd as u64);
    }

    #[test]
    fn read_event_rejects_kernel_pointers() {
        let mut k = kernel();
        let r = call(&mut k, 0xa, [0x10, 1, 0, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::Fault as u64);
    }

    fn read_events(k: &mut Kernel, buf: &mut [AppEvent]) -> u64 {
        let r = call(
            k,
            0xa,
            [buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0, 0],
        );
        assert_eq!(r.error, 0);
        r.value
    }

    #[test]
    fn quit_chord_translates_to_exactly_one_quit() {
        let mut k = kernel();
        let me = k.tasks.current_id();
        k.tasks
            .send_message(
                me,
                Message::KeyPush {
                    modifier: KeyModifiers::L_CTRL.bits(),
                    keycode: QUIT_KEYCODE,
                    ascii: 0,
                    press: true,
                },
            )
            .unwrap();

        let mut buf = [AppEvent::default(); 4];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0].kind, AppEventKind::Quit as u32);
    }

    #[test]
    fn quit_chord_release_is_an_ordinary_key() {
        let mut k = kernel();
        let me = k.tasks.current_id();
        k.tasks
            .send_message(
                me,
                Message::KeyPush {
                    modifier: KeyModifiers::R_CTRL.bits(),
                    keycode: QUIT_KEYCODE,
                    ascii: 0,
                    press: false,
                },
            )
            .unwrap();

        let mut buf = [AppEvent::default(); 4];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0].kind, AppEventKind::KeyPush as u32);
        assert_eq!(buf[0].keycode, QUIT_KEYCODE);
        assert_eq!(buf[0].press, 0);
    }

    #[test]
    fn ctrl_with_other_key_is_not_quit() {
        let mut k = kernel();
        let me = k.tasks.current_id();
        k.tasks
            .send_message(
                me,
                Message::KeyPush {
                    modifier: KeyModifiers::L_CTRL.bits(),
                    keycode: 4, // 'A'
                    ascii: b'a',
                    press: true,
                },
            )
            .unwrap();

        let mut buf = [AppEvent::default(); 4];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0].kind, AppEventKind::KeyPush as u32);
    }

    #[test]
    fn kernel_timer_values_are_suppressed() {
        let mut k = kernel();
        let me = k.tasks.current_id();
        // A kernel-internal (positive) timer value must not surface, the
        // user (negative) one must, sign-flipped.
        k.tasks
            .send_message(
                me,
                Message::TimerTimeout {
                    timeout: Tick::from(5),
                    value: 3,
                },
            )
            .unwrap();
        k.tasks
            .send_message(
                me,
                Message::TimerTimeout {
                    timeout: Tick::from(6),
                    value: -7,
                },
            )
            .unwrap();

        let mut buf = [AppEvent::default(); 4];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0].kind, AppEventKind::TimerTimeout as u32);
        assert_eq!(buf[0].timeout, 6);
        assert_eq!(buf[0].value, 7);
    }

    #[test]
    fn read_event_respects_capacity_and_order() {
        let mut k = kernel();
        let me = k.tasks.current_id();
        for i in 0..5 {
            k.tasks
                .send_message(
                    me,
                    Message::MouseMove {
                        x: i,
                        y: 0,
                        dx: 1,
                        dy: 0,
                        buttons: 0,
                    },
                )
                .unwrap();
        }

        let mut buf = [AppEvent::default(); 3];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 3);
        for (i, ev) in buf.iter().enumerate() {
            assert_eq!(ev.kind, AppEventKind::MouseMove as u32);
            assert_eq!(ev.x, i as i32);
        }

        // The remainder is still queued.
        let mut buf = [AppEvent::default(); 8];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 2);
        assert_eq!(buf[0].x, 3);
        assert_eq!(buf[1].x, 4);
    }

    #[test]
    fn window_close_request_surfaces_as_quit() {
        let mut k = kernel();
        let id = open_test_window(&mut k);
        k.notify_window_close(LayerId(id as u32)).unwrap();

        let mut buf = [AppEvent::default(); 2];
        let n = read_events(&mut k, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0].kind, AppEventKind::Quit as u32);
    }

    #[test]
    fn create_timer_validates_value() {
        let mut k = kernel();
        for bad in [0u64, (-5i64) as u64] {
            let r = call(&mut k, 0xb, [1, bad, 100, 0, 0, 0]);
            assert_eq!(r.error, ErrorCode::Inval as u64);
        }
    }

    #[test]
    fn create_timer_relative_mode_and_delivery() {
        let mut k = kernel();
        // Advance to tick 4 first.
        {
            let Kernel { tasks, timers, .. } = &mut k;
            for _ in 0..4 {
                let _ = timers.tick(tasks);
            }
        }

        // 30 ms at 100 Hz is 3 ticks; relative puts it at tick 7 and the
        // syscall reports 70 ms absolute.
        let r = call(&mut k, 0xb, [abi::TIMER_ONESHOT_REL, 9, 30, 0, 0, 0]);
        assert_eq!((r.value, r.error), (70, 0));

        let Kernel { tasks, timers, .. } = &mut k;
        let me = tasks.current_id();
        for _ in 0..2 {
            let _ = timers.tick(tasks);
            assert!(tasks.task_mut(me).unwrap().receive_message().is_none());
        }
        let _ = timers.tick(tasks);
        assert_eq!(
            tasks.task_mut(me).unwrap().receive_message(),
            Some(Message::TimerTimeout {
                timeout: Tick::from(7),
                value: -9
            })
        );
    }

    #[test]
    fn create_timer_absolute_mode() {
        let mut k = kernel();
        let r = call(&mut k, 0xb, [abi::TIMER_ONESHOT_ABS, 1, 50, 0, 0, 0]);
        // 50 ms absolute = tick 5, reported back as 50 ms.
        assert_eq!((r.value, r.error), (50, 0));
    }

    #[test]
    fn periodic_rearm_delivers_nearly_every_quantum() {
        // A high-priority task re-arming a 10 ms timer must see at least
        // 90 timeouts over a simulated second, no matter what else runs.
        let mut k = kernel();
        let me = k.tasks.current_id();

        let r = call(&mut k, 0xb, [abi::TIMER_ONESHOT_REL, 1, 10, 0, 0, 0]);
        assert_eq!(r.error, 0);

        let mut delivered = 0;
        for _ in 0..100 {
            {
                let Kernel { tasks, timers, .. } = &mut k;
                let _ = timers.tick(tasks);
            }
            let msg = k.tasks.task_mut(me).unwrap().receive_message();
            if let Some(Message::TimerTimeout { value, .. }) = msg {
                assert_eq!(value, -1);
                delivered += 1;
                // Immediately re-arm, like the app would.
                let r =
                    call(&mut k, 0xb, [abi::TIMER_ONESHOT_REL, 1, 10, 0, 0, 0]);
                assert_eq!(r.error, 0);
            }
        }
        assert!(delivered >= 90, "only {delivered} timeouts in 1 s");
    }

    #[test]
    fn open_file_error_cases() {
        let mut k = kernel_with_fs(TestFs::new().with_file("data.txt", b"x"));

        let missing = b"nope.txt\0";
        let r = call(&mut k, 0xc, [missing.as_ptr() as u64, 0, 0, 0, 0, 0]);
        assert_eq!(r.error, ErrorCode::NoEnt as u64);

        let path = b"data.txt\0";
        let r = call(
            &mut k,
            0xc,
            [path.as_ptr() as u64, O_WRONLY, 0, 0, 0, 0],
        );
        assert_eq!(r.error, ErrorCode::Inval as u64);

        let stdin = b"@stdin\0";
        let r = call(&mut k, 0xc, [stdin.as_ptr() as u64, 0, 0, 0, 0, 0]);
        assert_eq!((r.value, r.error), (0, 0));
    }

    #[test]
    fn open_and_read_file() {
        let mut k = kernel_with_fs(
            TestFs::new().with_file("notes.txt", b"paging is lazy"),
        );
        let path = b"notes.txt\0";
        let r = call(&mut k, 0xc, [path.as_ptr() as u64, 0, 0, 0, 0, 0]);
        assert_eq!(r.error, 0);
        let fd = r.value;

        let mut buf = [0u8; 6];
        let r = call(
            &mut k,
            0xd,
            [fd, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        );
        assert_eq!((r.value, r.error), (6, 0));
        assert_eq!(&buf, b"paging");

        // The cursor advanced.
        let mut buf = [0u8; 16];
        let r = call(
            &mut k,
            0xd,
            [fd, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        );
        assert_eq!(r.value, 8);
        assert_eq!(&buf[..8], b" is lazy");
    }

    #[test]
    fn read_file_bad_fd() {
        let mut k = kernel();
        let mut buf = [0u8; 4];
        let r = call(
            &mut k,
            0xd,
            [3, buf.as_mut_ptr() as u64, 4, 0, 0, 0],
        );
        assert_eq!(r.error, ErrorCode::BadFd as u64);
    }

    #[test]
    fn demand_pages_extends_the_window() {
        let mut k = kernel();
        let base = 0xffff_8000_0100_0000u64;
        {
            let t = k.tasks.current_task();
            t.set_dpaging_begin(base);
            t.set_dpaging_end(base);
        }

        let r = call(&mut k, 0xe, [3, 0, 0, 0, 0, 0]);
        assert_eq!((r.value, r.error), (base, 0));
        let r = call(&mut k, 0xe, [2, 0, 0, 0, 0, 0]);
        assert_eq!(r.value, base + 3 * 4096);
        assert_eq!(
            k.tasks.current_task().dpaging_end(),
            base + 5 * 4096
        );
    }

    #[test]
    fn map_file_reserves_downward_and_reports_size() {
        let mut k =
            kernel_with_fs(TestFs::new().with_file("img", &[7u8; 10_000]));
        let top = 0xffff_a000_0000_0000u64;
        k.tasks.current_task().set_file_map_end(top);

        let path = b"img\0";
        let r = call(&mut k, 0xc, [path.as_ptr() as u64, 0, 0, 0, 0, 0]);
        let fd = r.value;

        let mut size: u64 = 0;
        let r = call(
            &mut k,
            0xf,
            [fd, &mut size as *mut u64 as u64, 0, 0, 0, 0],
        );
        assert_eq!(r.error, 0);
        assert_eq!(size, 10_000);

        let begin = r.value;
        assert_eq!(begin, (top - 10_000) & !0xfff);
        assert_eq!(k.tasks.current_task().file_map_end(), begin);
        let m = k.tasks.current_task().file_mapping_for(begin + 1).unwrap();
        assert_eq!(m.vaddr_end, top);

        // A second mapping lands strictly below the first.
        let r2 = call(&mut k, 0xc, [path.as_ptr() as u64, 0, 0, 0, 0, 0]);
        let r = call(
            &mut k,
            0xf,
            [r2.value, &mut size as *mut u64 as u64, 0, 0, 0, 0],
        );
        assert!(r.value < begin);
    }

    #[test]
    fn map_file_bad_fd() {
        let mut k = kernel();
        let mut size: u64 = 0;
        let r = call(
            &mut k,
            0xf,
            [5, &mut size as *mut u64 as u64, 0, 0, 0, 0],
        );
        assert_eq!(r.error, ErrorCode::BadFd as u64);
    }

    #[test]
    fn mapped_file_faults_in_lazily() {
        // End-to-end: open, map, fault, and the page holds the file
        // bytes; past EOF reads zero. The file is a hair short of 32 KiB
        // so the page-aligned mapping has tail slack past end-of-file.
        let content: Vec<u8> =
            (0..32 * 1024u32 - 100).map(|i| (i * 7 % 256) as u8).collect();
        let mut k =
            kernel_with_fs(TestFs::new().with_file("anim.g4g", &content));

        let mut frames = TestFrames::new();
        let root = frames.new_root();
        crate::arch::set_active_page_table_root(root);
        k.tasks.current_task().set_file_map_end(0xffff_a000_0000_0000);

        let path = b"anim.g4g\0";
        let fd = call(&mut k, 0xc, [path.as_ptr() as u64, 0, 0, 0, 0, 0]).value;
        let mut size: u64 = 0;
        let begin = call(
            &mut k,
            0xf,
            [fd, &mut size as *mut u64 as u64, 0, 0, 0, 0],
        )
        .value;

        // Touch byte 4096*3+7.
        let causal = begin + 4096 * 3 + 7;
        crate::fault::handle_page_fault(&mut k, 0, causal).unwrap();
        let frame = crate::pagemap::resolve(root, causal & !0xfff).unwrap();
        let page = unsafe {
            core::slice::from_raw_parts(frame.addr() as *const u8, 4096)
        };
        // The mapping base is page-aligned but the file starts at
        // `begin`, which equals vaddr_begin here, so offsets line up.
        assert_eq!(page[7], content[4096 * 3 + 7]);

        // Touch past EOF (the mapping is page-rounded).
        let causal = begin + size + 1;
        crate::fault::handle_page_fault(&mut k, 0, causal).unwrap();
        let frame = crate::pagemap::resolve(root, causal & !0xfff).unwrap();
        let page = unsafe {
            core::slice::from_raw_parts(frame.addr() as *const u8, 4096)
        };
        let eof_offset = (size as usize) & 0xfff;
        assert!(page[eof_offset..].iter().all(|&b| b == 0));
    }
}
