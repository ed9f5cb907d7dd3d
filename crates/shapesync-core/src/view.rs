//! Per-client view state: zoom, pan and grid toggles.
//!
//! None of this is replicated.

use kurbo::{Affine, Point, Vec2};
use serde::{Deserialize, Serialize};

/// Grid size used by snapping and the visual grid.
pub const GRID_SIZE: f64 = 20.0;

/// Zoom, pan and display toggles for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// Current translation offset (pan)
    pub offset: Vec2,
    pub zoom: f64,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub show_grid: bool,
    pub show_rulers: bool,
    pub snap_to_grid: bool,
    pub grid_size: f64,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            offset: Vec2::ZERO,
            zoom: 1.0,
            min_zoom: 0.1,
            max_zoom: 10.0,
            show_grid: true,
            show_rulers: false,
            snap_to_grid: false,
            grid_size: GRID_SIZE,
        }
    }
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// World to screen transform.
    pub fn transform(&self) -> Affine {
        Affine::translate(self.offset) * Affine::scale(self.zoom)
    }

    pub fn screen_to_world(&self, screen_point: Point) -> Point {
        self.transform().inverse() * screen_point
    }

    pub fn world_to_screen(&self, world_point: Point) -> Point {
        self.transform() * world_point
    }

    /// Pan by a delta in screen coordinates.
    pub fn pan(&mut self, delta: Vec2) {
        self.offset += delta;
    }

    /// Zoom, keeping the given screen point fixed.
    pub fn zoom_at(&mut self, screen_point: Point, factor: f64) {
        let new_zoom = (self.zoom * factor).clamp(self.min_zoom, self.max_zoom);
        if (new_zoom - self.zoom).abs() < f64::EPSILON {
            return;
        }

        let world_point = self.screen_to_world(screen_point);
        self.zoom = new_zoom;
        let new_screen = self.world_to_screen(world_point);
        self.offset += screen_point - new_screen;
    }

    pub fn reset(&mut self) {
        self.offset = Vec2::ZERO;
        self.zoom = 1.0;
    }

    pub fn toggle_grid(&mut self) {
        self.show_grid = !self.show_grid;
    }

    pub fn toggle_rulers(&mut self) {
        self.show_rulers = !self.show_rulers;
    }

    pub fn toggle_snap(&mut self) {
        self.snap_to_grid = !self.snap_to_grid;
    }

    /// Snap a world point to the nearest grid intersection when snapping is on.
    pub fn snap(&self, point: Point) -> Point {
        if !self.snap_to_grid || self.grid_size <= 0.0 {
            return point;
        }
        Point::new(
            (point.x / self.grid_size).round() * self.grid_size,
            (point.y / self.grid_size).round() * self.grid_size,
        )
    }
}
