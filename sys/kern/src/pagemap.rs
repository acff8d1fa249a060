// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! 4-level page tables, demand paging, and memory-mapped files.
//!
//! Address spaces are the usual x86-64 radix tree: PML4 -> PDP -> PD -> PT
//! with 4 KiB leaf pages. The kernel's identity mapping of the low half is
//! set up by platform init and shared by every task; everything this
//! module creates lives in the upper half, is user-accessible, and belongs
//! to exactly one task.
//!
//! Physical frames come from the `FrameAllocator` collaborator. Table
//! frames are reached through the kernel identity mapping, which is why
//! `FrameId::addr` doubles as a pointer; hosted tests exploit the same
//! seam by fabricating frames from real allocations.

use abi::KernError;

use crate::config::PAGE_SIZE;
use crate::err::KResult;
use crate::fd::FileDescriptor;
use crate::task::{FileMapping, Task};

/// Names one 4 KiB page frame by index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Physical address of the frame, which the kernel identity mapping
    /// makes directly dereferenceable.
    pub fn addr(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE
    }

    pub fn from_addr(addr: u64) -> Self {
        Self((addr / PAGE_SIZE) as usize)
    }
}

/// The physical frame allocator collaborator. A global singleton in
/// practice, accessed only with interrupts disabled.
pub trait FrameAllocator {
    /// Allocates `num_frames` contiguous frames.
    fn allocate(&mut self, num_frames: usize) -> KResult<FrameId>;
    /// Returns `num_frames` contiguous frames starting at `frame`.
    fn free(&mut self, frame: FrameId, num_frames: usize);
}

bitflags::bitflags! {
    /// Hardware error code pushed by a page fault.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PageFaultErrorCode: u64 {
        /// The fault was a protection violation on a present page (as
        /// opposed to a non-present page).
        const PROTECTION_VIOLATION = 1 << 0;
        const CAUSED_BY_WRITE = 1 << 1;
        const USER_MODE = 1 << 2;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// One 64-bit entry of any level of the translation tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct PageMapEntry(pub u64);

impl PageMapEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    pub fn present(&self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn writable(&self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn user(&self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn addr(&self) -> u64 {
        self.0 & Self::ADDR_MASK
    }

    fn set_addr(&mut self, addr: u64) {
        self.0 = (self.0 & !Self::ADDR_MASK) | (addr & Self::ADDR_MASK);
    }

    fn set_flags(&mut self, flags: u64) {
        self.0 |= flags;
    }

    /// The next-level table this entry points at.
    ///
    /// # Safety
    ///
    /// The entry must be present and its address must name a table frame
    /// reachable through the identity mapping.
    unsafe fn table(&self) -> &'static mut PageTable {
        &mut *(self.addr() as *mut PageTable)
    }
}

/// One page of translation entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageMapEntry; 512],
}

impl PageTable {
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageMapEntry(0); 512],
        }
    }
}

/// A linear address viewed as its four 9-bit table indices plus offset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct LinearAddress(pub u64);

impl LinearAddress {
    /// Index into the table at `level` (4 = PML4 down to 1 = PT).
    pub fn part(&self, level: u8) -> usize {
        ((self.0 >> (12 + 9 * (level - 1) as u64)) & 0x1ff) as usize
    }

    pub fn set_part(&mut self, level: u8, part: usize) {
        let shift = 12 + 9 * (level - 1) as u64;
        self.0 = (self.0 & !(0x1ffu64 << shift))
            | (((part as u64) & 0x1ff) << shift);
    }

    /// Aligns down to the containing page.
    pub fn page_base(&self) -> LinearAddress {
        LinearAddress(self.0 & !(PAGE_SIZE - 1))
    }
}

/// Allocates one zeroed frame to serve as a table (or, at the bottom
/// level, a data page).
fn new_page_table(
    alloc: &mut dyn FrameAllocator,
) -> KResult<&'static mut PageTable> {
    let frame = alloc.allocate(1)?;
    // Safety: a freshly allocated frame is ours, reachable through the
    // identity mapping, and about to be fully initialized.
    unsafe {
        core::ptr::write_bytes(frame.addr() as *mut u8, 0, PAGE_SIZE as usize);
        Ok(&mut *(frame.addr() as *mut PageTable))
    }
}

/// If `entry` is present, returns the table it points at; otherwise
/// allocates a zeroed frame, points `entry` at it, and returns that.
/// Touching an already-present entry is deliberately a no-op, which is
/// what makes the mapping operations idempotent.
fn set_new_page_map_if_not_present(
    entry: &mut PageMapEntry,
    alloc: &mut dyn FrameAllocator,
) -> KResult<&'static mut PageTable> {
    if entry.present() {
        // Safety: present entries in task trees always point at frames we
        // installed ourselves.
        return Ok(unsafe { entry.table() });
    }

    let child = new_page_table(alloc)?;
    entry.set_addr(child as *mut PageTable as u64);
    entry.set_flags(PageMapEntry::PRESENT);
    Ok(child)
}

/// Recursive worker for `setup_page_maps`. Returns how many pages remain
/// to be mapped (the caller continues in the next entry of the level
/// above when a table fills up).
fn setup_page_map(
    table: &mut PageTable,
    level: u8,
    mut addr: LinearAddress,
    mut num_4k_pages: usize,
    alloc: &mut dyn FrameAllocator,
) -> KResult<usize> {
    while num_4k_pages > 0 {
        let entry_index = addr.part(level);

        let child =
            set_new_page_map_if_not_present(&mut table.entries[entry_index], alloc)?;
        table.entries[entry_index]
            .set_flags(PageMapEntry::WRITABLE | PageMapEntry::USER);

        if level == 1 {
            // `child` is the data page itself.
            num_4k_pages -= 1;
        } else {
            num_4k_pages =
                setup_page_map(child, level - 1, addr, num_4k_pages, alloc)?;
        }

        if entry_index == 511 {
            break;
        }
        addr.set_part(level, entry_index + 1);
        for lower in 1..level {
            addr.set_part(lower, 0);
        }
    }
    Ok(num_4k_pages)
}

/// Maps `num_4k_pages` user-writable zeroed pages starting at
/// `addr`, allocating intermediate tables as needed. Already-present
/// pages are left untouched.
pub fn setup_page_maps(
    root: *mut PageTable,
    addr: LinearAddress,
    num_4k_pages: usize,
    alloc: &mut dyn FrameAllocator,
) -> KResult<()> {
    // Safety: the root is the active (or a task's) PML4, which the caller
    // owns while interrupts are disabled.
    let table = unsafe { &mut *root };
    let remain =
        setup_page_map(table, 4, addr.page_base(), num_4k_pages, alloc)?;
    uassert_eq!(remain, 0);
    Ok(())
}

/// Walks the tree and returns the frame backing `vaddr`, if mapped.
pub fn resolve(root: *const PageTable, vaddr: u64) -> Option<FrameId> {
    let addr = LinearAddress(vaddr);
    // Safety: same ownership argument as `setup_page_maps`.
    let mut table = unsafe { &*root };
    for level in (2..=4).rev() {
        let entry = &table.entries[addr.part(level)];
        if !entry.present() {
            return None;
        }
        // Safety: present entries point at installed tables.
        table = unsafe { &*(entry.addr() as *const PageTable) };
    }
    let entry = &table.entries[addr.part(1)];
    if !entry.present() {
        return None;
    }
    Some(FrameId::from_addr(entry.addr()))
}

fn clean_page_map(
    table: &mut PageTable,
    level: u8,
    alloc: &mut dyn FrameAllocator,
) {
    for entry in table.entries.iter_mut() {
        if !entry.present() {
            continue;
        }
        if level > 1 {
            // Safety: present entries point at installed tables.
            clean_page_map(unsafe { entry.table() }, level - 1, alloc);
        }
        alloc.free(FrameId::from_addr(entry.addr()), 1);
        *entry = PageMapEntry(0);
    }
}

/// Frees every table and data frame reachable from the PML4 entries
/// `start_index..512` and clears those entries. Passing 256 reclaims the
/// upper half -- a terminated task's private mappings -- while the shared
/// identity mapping in the lower half persists.
pub fn clean_page_maps(
    root: *mut PageTable,
    start_index: usize,
    alloc: &mut dyn FrameAllocator,
) {
    // Safety: the caller owns this task's tree; nothing else references
    // it once the task cannot run again.
    let table = unsafe { &mut *root };
    for entry in table.entries[start_index..].iter_mut() {
        if !entry.present() {
            continue;
        }
        // Safety: present entries point at installed tables.
        clean_page_map(unsafe { entry.table() }, 3, alloc);
        alloc.free(FrameId::from_addr(entry.addr()), 1);
        *entry = PageMapEntry(0);
    }
}

/// Maps the page containing `causal_vaddr` and fills it from the mapped
/// file: byte `i` of the page is byte `page_base - vaddr_begin + i` of the
/// file. Pages past end-of-file stay zero, courtesy of the pre-zeroed
/// frame.
pub fn prepare_page_cache(
    fd: &mut dyn FileDescriptor,
    m: &FileMapping,
    causal_vaddr: u64,
    root: *mut PageTable,
    alloc: &mut dyn FrameAllocator,
) -> KResult<()> {
    let page_vaddr = LinearAddress(causal_vaddr).page_base();
    setup_page_maps(root, page_vaddr, 1, alloc)?;

    let frame = resolve(root, page_vaddr.0).ok_or(KernError::IndexOutOfRange)?;
    let file_offset = (page_vaddr.0 - m.vaddr_begin) as usize;
    // Safety: the frame was just mapped for this fault and belongs to the
    // faulting task alone.
    let page = unsafe {
        core::slice::from_raw_parts_mut(
            frame.addr() as *mut u8,
            PAGE_SIZE as usize,
        )
    };
    fd.load(page, file_offset);
    Ok(())
}

/// Demand-paging fault dispatch.
///
/// A protection violation is never recoverable here (`AlreadyAllocated`).
/// Faults in the task's demand-paging window allocate a zeroed page;
/// faults in a registered file mapping load the corresponding file slice;
/// anything else is `IndexOutOfRange`. Unrecoverable returns lead to the
/// task being killed by the fault layer.
pub fn handle_page_fault(
    task: &mut Task,
    root: *mut PageTable,
    alloc: &mut dyn FrameAllocator,
    error_code: PageFaultErrorCode,
    causal_addr: u64,
) -> KResult<()> {
    if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        return Err(KernError::AlreadyAllocated);
    }
    if task.dpaging_begin() <= causal_addr && causal_addr < task.dpaging_end()
    {
        return setup_page_maps(root, LinearAddress(causal_addr), 1, alloc);
    }
    if let Some(m) = task.file_mapping_for(causal_addr) {
        let fd = task.file_mut(m.fd).ok_or(KernError::IndexOutOfRange)?;
        return prepare_page_cache(fd.as_mut(), &m, causal_addr, root, alloc);
    }
    Err(KernError::IndexOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskManager;
    use crate::test_support::{MemFile, TestFrames};

    const USER_BASE: u64 = 0xffff_8000_0000_0000;

    fn read_page(root: *const PageTable, vaddr: u64) -> &'static [u8] {
        let frame = resolve(root, vaddr).expect("page not mapped");
        unsafe {
            core::slice::from_raw_parts(
                frame.addr() as *const u8,
                PAGE_SIZE as usize,
            )
        }
    }

    #[test]
    fn linear_address_parts() {
        let a = LinearAddress(USER_BASE + (3 << 30) + (5 << 21) + (7 << 12) + 9);
        assert_eq!(a.part(4), 256);
        assert_eq!(a.part(3), 3);
        assert_eq!(a.part(2), 5);
        assert_eq!(a.part(1), 7);
        assert_eq!(a.page_base().0 & 0xfff, 0);
    }

    #[test]
    fn setup_is_idempotent_and_user_writable() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();

        let va = USER_BASE + 0x4000;
        setup_page_maps(root, LinearAddress(va), 1, &mut frames).unwrap();
        let first = resolve(root, va).unwrap();

        // Every level of the chain is user+writable.
        let table = unsafe { &*root };
        let mut t = table;
        let a = LinearAddress(va);
        for level in (2..=4).rev() {
            let e = &t.entries[a.part(level)];
            assert!(e.present() && e.writable() && e.user());
            t = unsafe { &*(e.addr() as *const PageTable) };
        }
        let leaf = &t.entries[a.part(1)];
        assert!(leaf.present() && leaf.writable() && leaf.user());

        // Mapping again must not replace the frame.
        setup_page_maps(root, LinearAddress(va), 1, &mut frames).unwrap();
        assert_eq!(resolve(root, va), Some(first));
    }

    #[test]
    fn mapped_page_reads_as_zeros() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();
        let mut tasks = TaskManager::new();
        let task = tasks.current_task();
        task.set_dpaging_begin(USER_BASE);
        task.set_dpaging_end(USER_BASE + 0x10000);

        handle_page_fault(
            task,
            root,
            &mut frames,
            PageFaultErrorCode::CAUSED_BY_WRITE | PageFaultErrorCode::USER_MODE,
            USER_BASE + 0x2345,
        )
        .unwrap();

        assert!(read_page(root, USER_BASE + 0x2000).iter().all(|&b| b == 0));
    }

    #[test]
    fn protection_violation_is_already_allocated() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();
        let mut tasks = TaskManager::new();
        let task = tasks.current_task();
        task.set_dpaging_begin(USER_BASE);
        task.set_dpaging_end(USER_BASE + 0x1000);

        let r = handle_page_fault(
            task,
            root,
            &mut frames,
            PageFaultErrorCode::PROTECTION_VIOLATION,
            USER_BASE,
        );
        assert_eq!(r, Err(KernError::AlreadyAllocated));
    }

    #[test]
    fn fault_outside_all_ranges_is_rejected() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();
        let mut tasks = TaskManager::new();
        let task = tasks.current_task();

        let r = handle_page_fault(
            task,
            root,
            &mut frames,
            PageFaultErrorCode::USER_MODE,
            USER_BASE + 0x8000,
        );
        assert_eq!(r, Err(KernError::IndexOutOfRange));
    }

    #[test]
    fn file_map_fault_loads_the_right_slice() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();
        let mut tasks = TaskManager::new();
        let task = tasks.current_task();

        // A 32 KiB file with distinctive contents.
        let content: alloc::vec::Vec<u8> =
            (0..32 * 1024u32).map(|i| (i % 251) as u8).collect();
        let fd = task.alloc_fd();
        task.set_file(fd, alloc::boxed::Box::new(MemFile::new(content.clone())));

        let begin = USER_BASE + 0x10_0000;
        task.add_file_mapping(crate::task::FileMapping {
            fd,
            vaddr_begin: begin,
            vaddr_end: begin + 32 * 1024,
        });

        // Fault in the middle of page 3.
        let causal = begin + 4096 * 3 + 7;
        handle_page_fault(
            task,
            root,
            &mut frames,
            PageFaultErrorCode::USER_MODE,
            causal,
        )
        .unwrap();

        let page = read_page(root, begin + 4096 * 3);
        assert_eq!(page[7], content[4096 * 3 + 7]);
        assert_eq!(page, &content[4096 * 3..4096 * 4]);
    }

    #[test]
    fn file_map_fault_past_eof_reads_zero() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();
        let mut tasks = TaskManager::new();
        let task = tasks.current_task();

        // File is shorter than its (page-rounded) mapping.
        let content = alloc::vec![0xaau8; 100];
        let fd = task.alloc_fd();
        task.set_file(fd, alloc::boxed::Box::new(MemFile::new(content)));

        let begin = USER_BASE + 0x20_0000;
        task.add_file_mapping(crate::task::FileMapping {
            fd,
            vaddr_begin: begin,
            vaddr_end: begin + 4096,
        });

        handle_page_fault(
            task,
            root,
            &mut frames,
            PageFaultErrorCode::USER_MODE,
            begin + 200,
        )
        .unwrap();

        let page = read_page(root, begin);
        assert!(page[..100].iter().all(|&b| b == 0xaa));
        assert!(page[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn clean_reclaims_every_upper_half_frame() {
        let mut frames = TestFrames::new();
        let root = frames.new_root();

        setup_page_maps(root, LinearAddress(USER_BASE), 3, &mut frames)
            .unwrap();
        setup_page_maps(
            root,
            LinearAddress(USER_BASE + (1 << 30)),
            1,
            &mut frames,
        )
        .unwrap();
        let outstanding = frames.outstanding();
        assert!(outstanding > 0);

        clean_page_maps(root, 256, &mut frames);
        // Everything allocated for the tree is back (the root itself is
        // not allocated through the FrameAllocator in this fixture).
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(resolve(root, USER_BASE), None);
    }
}
