// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the layered window compositor.
//!
//! The compositor itself (layer stacking, damage tracking, the actual pixel
//! plumbing to the frame buffer) is a collaborator; the kernel manipulates
//! it through these traits on behalf of syscalls, always with interrupts
//! disabled. Layers are named by stable 32-bit ids, never by pointers, so
//! the task <-> layer relationship can live in a plain table.

/// Identifies a compositor layer. Id 0 conventionally means "no layer" and
/// is what `activate` is handed to drop focus.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct LayerId(pub u32);

impl LayerId {
    pub const NONE: Self = Self(0);
}

/// An axis-aligned rectangle in screen or window coordinates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Destination for individual pixel writes.
pub trait PixelWriter {
    /// Writes one pixel. `color` is `0xRRGGBB`. Out-of-bounds writes are
    /// the implementation's problem to clip.
    fn write(&mut self, x: i32, y: i32, color: u32);
}

/// The drawable surface of one window.
///
/// String and rectangle drawing are provided by the implementation (it owns
/// the font and the fill loops); line drawing is built in the kernel on top
/// of `writer`.
pub trait Window {
    fn size(&self) -> (u32, u32);
    fn writer(&mut self) -> &mut dyn PixelWriter;
    fn write_string(&mut self, x: i32, y: i32, color: u32, s: &str);
    fn fill_rectangle(&mut self, x: i32, y: i32, w: i32, h: i32, color: u32);
}

/// One compositor layer: a positioned window surface.
pub trait Layer {
    fn id(&self) -> LayerId;
    fn position(&self) -> (i32, i32);
    fn window(&mut self) -> &mut dyn Window;
}

/// The compositor.
///
/// Contract notes the kernel relies on:
///
/// - `draw_layer(id)` redraws that layer and everything above it, and is
///   idempotent.
/// - `remove_layer(id)` followed by `draw_rect` over the layer's former
///   bounds heals the exposed region.
/// - All calls happen with interrupts disabled.
pub trait LayerManager {
    /// Creates a layer with a fresh id, sized and titled for a toplevel
    /// window, positioned at `(x, y)`.
    fn new_layer(&mut self, w: u32, h: u32, x: i32, y: i32, title: &str) -> LayerId;
    fn find_layer(&mut self, id: LayerId) -> Option<&mut dyn Layer>;
    fn move_layer(&mut self, id: LayerId, x: i32, y: i32);
    /// Redraws the given layer and the layers above it.
    fn draw_layer(&mut self, id: LayerId);
    /// Redraws every layer intersecting `area`.
    fn draw_rect(&mut self, area: Rect);
    fn remove_layer(&mut self, id: LayerId);
    /// Gives `id` the input focus; `LayerId::NONE` drops focus.
    fn activate(&mut self, id: LayerId);
}
