//! Coordinate mapping between the operator window and the VM framebuffer.
//!
//! The VM frame is shown 1:1, so the transform is a pure translation by the
//! pan offset. Window points are relative to the top-left corner of the
//! area the frame is drawn into, not to the whole operator window.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= 0 && p.y >= 0 && (p.x as i64) < self.width as i64 && (p.y as i64) < self.height as i64
    }
}

/// Pan offset plus the two extents it is bounded by.
///
/// Invariant: `0 <= pan_offset.x <= max(0, vm_frame_size.width - window_size.width)`
/// and likewise for `y`. Every mutator re-establishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportState {
    pub pan_offset: Point,
    pub window_size: Size,
    pub vm_frame_size: Size,
}

impl ViewportState {
    pub fn new(window_size: Size, vm_frame_size: Size) -> Self {
        Self {
            pan_offset: Point::ORIGIN,
            window_size,
            vm_frame_size,
        }
    }

    /// Largest valid pan offset on each axis. Zero on axes where the frame fits.
    pub fn max_pan(&self) -> Point {
        Point::new(
            self.vm_frame_size.width.saturating_sub(self.window_size.width) as i32,
            self.vm_frame_size.height.saturating_sub(self.window_size.height) as i32,
        )
    }

    pub fn needs_panning(&self) -> bool {
        self.max_pan() != Point::ORIGIN
    }

    pub fn clamp_pan(&mut self) {
        let max = self.max_pan();
        self.pan_offset.x = self.pan_offset.x.clamp(0, max.x);
        self.pan_offset.y = self.pan_offset.y.clamp(0, max.y);
    }

    pub fn is_valid(&self) -> bool {
        let max = self.max_pan();
        (0..=max.x).contains(&self.pan_offset.x) && (0..=max.y).contains(&self.pan_offset.y)
    }

    /// Part of the window actually covered by the VM frame.
    pub fn visible_size(&self) -> Size {
        Size::new(
            self.window_size.width.min(self.vm_frame_size.width),
            self.window_size.height.min(self.vm_frame_size.height),
        )
    }
}

/// Window point to VM pixel. Results outside the frame are clamped to the
/// nearest in-bounds pixel so clicks at the very edge still register.
pub fn to_vm(window_point: Point, state: &ViewportState) -> Point {
    let raw = Point::new(
        window_point.x.saturating_add(state.pan_offset.x),
        window_point.y.saturating_add(state.pan_offset.y),
    );
    clamp_to_frame(raw, state.vm_frame_size)
}

/// VM pixel to window point. May fall outside the window when the pixel is
/// not currently visible.
pub fn to_window(vm_point: Point, state: &ViewportState) -> Point {
    Point::new(
        vm_point.x.saturating_sub(state.pan_offset.x),
        vm_point.y.saturating_sub(state.pan_offset.y),
    )
}

pub fn clamp_to_frame(p: Point, frame: Size) -> Point {
    let max_x = frame.width.max(1) as i32 - 1;
    let max_y = frame.height.max(1) as i32 - 1;
    Point::new(p.x.clamp(0, max_x), p.y.clamp(0, max_y))
}
