use crate::mapper::{self, Point, Size, ViewportState};

/// Distance from a window edge, in pixels, at which edge panning starts.
pub const DEFAULT_PAN_MARGIN: u32 = 50;
/// Pan speed in pixels per second with the cursor right on the edge.
pub const DEFAULT_PAN_SPEED: f32 = 1200.0;

/// Owns the viewport state and moves the pan offset when the cursor nears a
/// window edge.
#[derive(Debug, Clone)]
pub struct ViewportController {
    state: ViewportState,
    margin: f32,
    max_speed: f32,
    // Sub-pixel movement not yet applied to the integer offset.
    carry_x: f32,
    carry_y: f32,
}

/// Visible region as fractions of the VM frame, for drawing a minimap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimapRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ViewportController {
    pub fn new(window_size: Size, vm_frame_size: Size) -> Self {
        Self {
            state: ViewportState::new(window_size, vm_frame_size),
            margin: DEFAULT_PAN_MARGIN as f32,
            max_speed: DEFAULT_PAN_SPEED,
            carry_x: 0.0,
            carry_y: 0.0,
        }
    }

    pub fn with_panning(mut self, margin: u32, max_speed: f32) -> Self {
        self.margin = margin.max(1) as f32;
        self.max_speed = max_speed.max(0.0);
        self
    }

    pub fn state(&self) -> &ViewportState {
        &self.state
    }

    pub fn pan_offset(&self) -> Point {
        self.state.pan_offset
    }

    pub fn to_vm(&self, window_point: Point) -> Point {
        mapper::to_vm(window_point, &self.state)
    }

    pub fn to_window(&self, vm_point: Point) -> Point {
        mapper::to_window(vm_point, &self.state)
    }

    /// Advances edge panning by `dt` seconds and returns the new offset.
    ///
    /// Inside the edge margin the offset moves toward that edge at a rate
    /// proportional to `margin - distance`. With `pan_enabled` false the
    /// offset only gets re-clamped.
    pub fn update(&mut self, cursor: Point, dt: f32, pan_enabled: bool) -> Point {
        if !pan_enabled || dt <= 0.0 {
            self.carry_x = 0.0;
            self.carry_y = 0.0;
            self.state.clamp_pan();
            return self.state.pan_offset;
        }

        let max = self.state.max_pan();
        let vx = if max.x > 0 {
            self.axis_velocity(cursor.x, self.state.window_size.width)
        } else {
            0.0
        };
        let vy = if max.y > 0 {
            self.axis_velocity(cursor.y, self.state.window_size.height)
        } else {
            0.0
        };

        self.carry_x += vx * dt;
        self.carry_y += vy * dt;
        let step_x = self.carry_x.trunc();
        let step_y = self.carry_y.trunc();
        self.carry_x -= step_x;
        self.carry_y -= step_y;

        self.state.pan_offset.x = self.state.pan_offset.x.saturating_add(step_x as i32);
        self.state.pan_offset.y = self.state.pan_offset.y.saturating_add(step_y as i32);
        self.state.clamp_pan();

        if self.state.pan_offset.x == 0 || self.state.pan_offset.x == max.x {
            self.carry_x = 0.0;
        }
        if self.state.pan_offset.y == 0 || self.state.pan_offset.y == max.y {
            self.carry_y = 0.0;
        }
        self.state.pan_offset
    }

    fn axis_velocity(&self, pos: i32, extent: u32) -> f32 {
        if pos < 0 || pos as i64 >= extent as i64 {
            return 0.0;
        }
        let near = pos as f32;
        let far = (extent as f32 - 1.0) - near;
        if near < self.margin {
            -self.max_speed * (self.margin - near) / self.margin
        } else if far < self.margin {
            self.max_speed * (self.margin - far) / self.margin
        } else {
            0.0
        }
    }

    /// New window size. The offset is re-clamped, nothing else changes.
    pub fn resize(&mut self, new_window_size: Size) {
        if self.state.window_size == new_window_size {
            return;
        }
        self.state.window_size = new_window_size;
        self.state.clamp_pan();
    }

    pub fn set_frame_size(&mut self, vm_frame_size: Size) {
        if self.state.vm_frame_size == vm_frame_size {
            return;
        }
        self.state.vm_frame_size = vm_frame_size;
        self.state.clamp_pan();
    }

    pub fn set_pan_offset(&mut self, offset: Point) {
        self.state.pan_offset = offset;
        self.state.clamp_pan();
    }

    pub fn minimap(&self) -> Option<MinimapRect> {
        if !self.state.needs_panning() {
            return None;
        }
        let frame = self.state.vm_frame_size;
        let visible = self.state.visible_size();
        let fw = frame.width as f32;
        let fh = frame.height as f32;
        Some(MinimapRect {
            x: self.state.pan_offset.x as f32 / fw,
            y: self.state.pan_offset.y as f32 / fh,
            width: visible.width as f32 / fw,
            height: visible.height as f32 / fh,
        })
    }
}
