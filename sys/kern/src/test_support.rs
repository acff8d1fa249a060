// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborator fakes shared by the unit tests: an in-memory file and
//! filesystem, a frame arena backed by leaked host allocations, and a
//! recording layer manager.

use abi::ErrorCode;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::err::KResult;
use crate::fd::{FileDescriptor, FileSystem};
use crate::layer::{Layer, LayerId, LayerManager, PixelWriter, Rect, Window};
use crate::pagemap::{FrameAllocator, FrameId, PageTable};

/// Frame allocator handing out leaked, page-aligned host allocations, so
/// `FrameId::addr` round-trips through real pointers.
pub struct TestFrames {
    outstanding: usize,
}

impl TestFrames {
    pub fn new() -> Self {
        Self { outstanding: 0 }
    }

    /// A PML4 for tests. Deliberately not counted against `outstanding`,
    /// mirroring how the real root comes from early boot rather than the
    /// frame allocator.
    pub fn new_root(&mut self) -> *mut PageTable {
        Box::leak(Box::new(PageTable::zeroed()))
    }

    /// Frames allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl FrameAllocator for TestFrames {
    fn allocate(&mut self, num_frames: usize) -> KResult<FrameId> {
        uassert_eq!(num_frames, 1);
        let table = Box::leak(Box::new(PageTable::zeroed()));
        self.outstanding += 1;
        Ok(FrameId::from_addr(table as *mut PageTable as u64))
    }

    fn free(&mut self, _frame: FrameId, num_frames: usize) {
        // The backing memory is leaked on purpose; the tests only care
        // about balance.
        self.outstanding -= num_frames;
    }
}

/// An in-memory file. Reads consume from a cursor, writes append to a
/// separate capture buffer (so tests can assert terminal output), and
/// loads are cursor-independent.
pub struct MemFile {
    data: Vec<u8>,
    pos: usize,
    written: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl FileDescriptor for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len() - self.pos.min(self.data.len()));
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.written.extend_from_slice(buf);
        buf.len()
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn load(&mut self, buf: &mut [u8], offset: usize) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}

/// Filesystem fake: a path -> contents map.
pub struct TestFs {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl TestFs {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(path.to_string(), data.to_vec());
        self
    }
}

impl FileSystem for TestFs {
    fn open(
        &mut self,
        path: &str,
        _flags: u64,
    ) -> Result<Box<dyn FileDescriptor>, ErrorCode> {
        match self.files.get(path) {
            Some(data) => Ok(Box::new(MemFile::new(data.clone()))),
            None => Err(ErrorCode::NoEnt),
        }
    }
}

/// One fake compositor layer: a pixel buffer plus position.
pub struct TestLayer {
    id: LayerId,
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub title: String,
    /// Working pixel buffer, mutated immediately by draw calls.
    pub buf: Vec<u32>,
}

impl TestLayer {
    fn pixel_index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as u32 >= self.w || y as u32 >= self.h {
            return None;
        }
        Some(y as usize * self.w as usize + x as usize)
    }
}

impl PixelWriter for TestLayer {
    fn write(&mut self, x: i32, y: i32, color: u32) {
        if let Some(i) = self.pixel_index(x, y) {
            self.buf[i] = color;
        }
    }
}

impl Window for TestLayer {
    fn size(&self) -> (u32, u32) {
        (self.w, self.h)
    }

    fn writer(&mut self) -> &mut dyn PixelWriter {
        self
    }

    fn write_string(&mut self, x: i32, y: i32, color: u32, s: &str) {
        // One "pixel" per character is plenty for asserting placement.
        for (i, ch) in s.chars().enumerate() {
            self.write(x + i as i32, y, color ^ ch as u32);
        }
    }

    fn fill_rectangle(&mut self, x: i32, y: i32, w: i32, h: i32, color: u32) {
        for dy in 0..h {
            for dx in 0..w {
                self.write(x + dx, y + dy, color);
            }
        }
    }
}

impl Layer for TestLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    fn window(&mut self) -> &mut dyn Window {
        self
    }
}

/// Recording layer manager. "The screen" is the per-layer committed copy
/// of the working buffer, refreshed by `draw_layer`; that split is what
/// lets tests observe no-redraw coalescing.
pub struct TestLayerManager {
    pub layers: BTreeMap<u32, TestLayer>,
    next_id: u32,
    pub active: LayerId,
    pub screen: BTreeMap<u32, Vec<u32>>,
    pub draw_calls: Vec<LayerId>,
    pub rect_draws: Vec<Rect>,
}

impl TestLayerManager {
    pub fn new() -> Self {
        Self {
            layers: BTreeMap::new(),
            next_id: 1,
            active: LayerId::NONE,
            screen: BTreeMap::new(),
            draw_calls: Vec::new(),
            rect_draws: Vec::new(),
        }
    }

    pub fn screen_of(&self, id: LayerId) -> Option<&Vec<u32>> {
        self.screen.get(&id.0)
    }
}

impl LayerManager for TestLayerManager {
    fn new_layer(
        &mut self,
        w: u32,
        h: u32,
        x: i32,
        y: i32,
        title: &str,
    ) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        self.layers.insert(
            id.0,
            TestLayer {
                id,
                x,
                y,
                w,
                h,
                title: title.to_string(),
                buf: alloc::vec![0; (w * h) as usize],
            },
        );
        id
    }

    fn find_layer(&mut self, id: LayerId) -> Option<&mut dyn Layer> {
        self.layers.get_mut(&id.0).map(|l| l as &mut dyn Layer)
    }

    fn move_layer(&mut self, id: LayerId, x: i32, y: i32) {
        if let Some(l) = self.layers.get_mut(&id.0) {
            l.x = x;
            l.y = y;
        }
    }

    fn draw_layer(&mut self, id: LayerId) {
        self.draw_calls.push(id);
        if let Some(l) = self.layers.get(&id.0) {
            self.screen.insert(id.0, l.buf.clone());
        }
    }

    fn draw_rect(&mut self, area: Rect) {
        self.rect_draws.push(area);
    }

    fn remove_layer(&mut self, id: LayerId) {
        self.layers.remove(&id.0);
        self.screen.remove(&id.0);
    }

    fn activate(&mut self, id: LayerId) {
        self.active = id;
    }
}
