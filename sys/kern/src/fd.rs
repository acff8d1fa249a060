// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File descriptor capability interface.
//!
//! A file descriptor is a capability set {read, write, size, load} carried
//! behind a trait object. Concrete implementations (FAT-resident file,
//! pipe, terminal) are collaborators; the kernel uses `read` for the
//! `ReadFile` syscall, `write` for `PutString`, and `load` for demand
//! paging of file-mapped ranges.

use abi::ErrorCode;
use alloc::boxed::Box;

pub trait FileDescriptor {
    /// Reads up to `buf.len()` bytes at the descriptor's cursor, advancing
    /// it. Returns the number of bytes read; 0 means end of data.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Writes `buf`, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Total size of the underlying object, in bytes.
    fn size(&self) -> usize;

    /// Reads up to `buf.len()` bytes starting at `offset`, without touching
    /// the cursor. Short reads past end-of-file leave the remainder of
    /// `buf` untouched (the paging layer pre-zeroes its pages, which is
    /// where the zero-padding at EOF comes from).
    fn load(&mut self, buf: &mut [u8], offset: usize) -> usize;
}

/// Pathname resolution, provided by the filesystem collaborator (FAT
/// directory traversal lives behind this).
pub trait FileSystem {
    /// Opens `path` with fcntl-style `flags`. Expected failures: `NoEnt`
    /// when the path does not resolve (including a trailing component
    /// under a non-directory).
    fn open(
        &mut self,
        path: &str,
        flags: u64,
    ) -> Result<Box<dyn FileDescriptor>, ErrorCode>;
}
