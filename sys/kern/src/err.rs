// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Two error domains meet in this kernel. Between kernel components (and
//! at collaborator seams) errors are `KernError`, a tagged kind with no
//! payload; this module's `KResult` is the shorthand for that domain. At
//! the syscall boundary errors become POSIX-style `ErrorCode`s, returned
//! to the task in the second word of the result pair -- the mapping is
//! done case by case in `syscalls`, because the right code depends on
//! which argument was at fault, not just on what went wrong internally.

use abi::KernError;

/// Shorthand for results in the kernel error domain.
pub type KResult<T> = Result<T, KernError>;
