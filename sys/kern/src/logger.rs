// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leveled kernel logging.
//!
//! Where the log output actually goes is architecture-specific (a serial
//! console on hardware, stdout under the fake arch); this module owns the
//! level filter and the formatting entry point. The `LogString` syscall
//! feeds user-task log lines through the same path.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use abi::LogLevel;

/// Current filter. Messages with a numerically larger level (less severe)
/// than this are dropped.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Adjusts the level filter.
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Reads the current level filter.
pub fn log_level() -> u8 {
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Formats and emits one log record, if it passes the filter.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level as u8 <= LOG_LEVEL.load(Ordering::Relaxed) {
        crate::arch::klog_write(args);
    }
}

/// Log things from kernel context.
///
/// The sink is architecture-specific; see `arch::klog_write`. Takes a level
/// and then `format_args` arguments.
macro_rules! klog {
    ($level:expr, $($tt:tt)*) => {
        $crate::logger::log($level, format_args!($($tt)*))
    };
}
