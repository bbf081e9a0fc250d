// SPDX-License-Identifier: GPL-3.0-only

use cgmath::Point2;
use tracing::{debug, warn};
use warpplay_config::{CornerPosition, KeystoneConfig};

pub mod homography;

pub use self::homography::{Homography, HomographyError};

pub const MIN_COORDINATE: f64 = -1.0;
pub const MAX_COORDINATE: f64 = 2.0;
pub const MIN_STEP: f64 = 0.001;
pub const MAX_STEP: f64 = 0.1;
pub const MIN_BORDER_WIDTH: u32 = 1;
pub const MAX_BORDER_WIDTH: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corner {
    TopLeft = 0,
    TopRight = 1,
    BottomLeft = 2,
    BottomRight = 3,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    pub fn from_index(index: usize) -> Option<Corner> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Commands that edit the keystone geometry or its overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoneCommand {
    Toggle,
    Select(Corner),
    Move(Direction),
    IncreaseStep,
    DecreaseStep,
    Reset,
    ToggleBorder,
    WidenBorder,
    NarrowBorder,
    ToggleMarkers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeystoneState {
    corners: [Point2<f64>; 4],
    active: Corner,
    step: f64,
    enabled: bool,
    border_visible: bool,
    border_width: u32,
    markers_visible: bool,

    transform: Homography,
    dirty: bool,
}

impl Default for KeystoneState {
    fn default() -> Self {
        KeystoneState::from(&KeystoneConfig::default())
    }
}

impl From<&KeystoneConfig> for KeystoneState {
    fn from(config: &KeystoneConfig) -> Self {
        let mut state = KeystoneState {
            corners: config.corners.map(|c| Point2::new(c.x, c.y)),
            active: Corner::from_index(config.active_corner).unwrap_or(Corner::TopLeft),
            step: config.step,
            enabled: config.enabled,
            border_visible: config.border_visible,
            border_width: config.border_width,
            markers_visible: config.markers_visible,
            transform: Homography::identity(),
            dirty: true,
        };
        state.sanitize();
        state
    }
}

impl From<&KeystoneState> for KeystoneConfig {
    fn from(state: &KeystoneState) -> Self {
        KeystoneConfig {
            enabled: state.enabled,
            corners: state.corners.map(|c| CornerPosition::new(c.x, c.y)),
            border_visible: state.border_visible,
            border_width: state.border_width,
            markers_visible: state.markers_visible,
            active_corner: state.active.index(),
            step: state.step,
        }
    }
}

impl KeystoneState {
    fn sanitize(&mut self) {
        for corner in self.corners.iter_mut() {
            *corner = clamp_point(*corner);
        }
        if !self.step.is_finite() {
            self.step = warpplay_config::keystone::DEFAULT_STEP;
        }
        self.step = self.step.clamp(MIN_STEP, MAX_STEP);
        self.border_width = self.border_width.clamp(MIN_BORDER_WIDTH, MAX_BORDER_WIDTH);
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn corners(&self) -> &[Point2<f64>; 4] {
        &self.corners
    }

    pub fn corner(&self, corner: Corner) -> Point2<f64> {
        self.corners[corner.index()]
    }

    pub fn active_corner(&self) -> Corner {
        self.active
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn border_visible(&self) -> bool {
        self.border_visible
    }

    pub fn border_width(&self) -> u32 {
        self.border_width
    }

    pub fn markers_visible(&self) -> bool {
        self.markers_visible
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Moves a corner, clamped to the extended range that allows some overscan.
    pub fn set_corner(&mut self, corner: Corner, position: Point2<f64>) {
        let position = clamp_point(position);
        if self.corners[corner.index()] != position {
            self.corners[corner.index()] = position;
            self.dirty = true;
        }
    }

    pub fn reset(&mut self) {
        let enabled = self.enabled;
        *self = KeystoneState::default();
        self.enabled = enabled;
    }

    /// Returns the current transform, solving it again if a corner moved since the last call.
    ///
    /// Degenerate corner configurations keep the previous transform.
    pub fn transform(&mut self) -> &Homography {
        if self.dirty {
            self.recompute_transform();
        }
        &self.transform
    }

    pub fn recompute_transform(&mut self) {
        match Homography::from_unit_square(&self.corners) {
            Ok(transform) => self.transform = transform,
            Err(err) => warn!(?err, corners = ?self.corners, "Keeping previous keystone transform."),
        }
        self.dirty = false;
    }

    /// Applies an interactive command, returning whether anything visible changed.
    pub fn apply(&mut self, command: KeystoneCommand) -> bool {
        match command {
            KeystoneCommand::Toggle => {
                self.enabled = !self.enabled;
                debug!(enabled = self.enabled, "Toggled keystone correction.");
                true
            }
            KeystoneCommand::Select(corner) => {
                let changed = self.active != corner;
                self.active = corner;
                changed && self.markers_visible
            }
            KeystoneCommand::Move(direction) => {
                let before = self.corner(self.active);
                let mut position = before;
                match direction {
                    Direction::Up => position.y -= self.step,
                    Direction::Down => position.y += self.step,
                    Direction::Left => position.x -= self.step,
                    Direction::Right => position.x += self.step,
                }
                self.set_corner(self.active, position);
                self.corner(self.active) != before
            }
            KeystoneCommand::IncreaseStep => {
                self.step = (self.step * 2.0).min(MAX_STEP);
                false
            }
            KeystoneCommand::DecreaseStep => {
                self.step = (self.step / 2.0).max(MIN_STEP);
                false
            }
            KeystoneCommand::Reset => {
                self.reset();
                true
            }
            KeystoneCommand::ToggleBorder => {
                self.border_visible = !self.border_visible;
                true
            }
            KeystoneCommand::WidenBorder => {
                let width = (self.border_width + 1).min(MAX_BORDER_WIDTH);
                let changed = width != self.border_width;
                self.border_width = width;
                changed
            }
            KeystoneCommand::NarrowBorder => {
                let width = self.border_width.saturating_sub(1).max(MIN_BORDER_WIDTH);
                let changed = width != self.border_width;
                self.border_width = width;
                changed
            }
            KeystoneCommand::ToggleMarkers => {
                self.markers_visible = !self.markers_visible;
                true
            }
        }
    }
}

fn clamp_point(point: Point2<f64>) -> Point2<f64> {
    let clamp = |v: f64| {
        if v.is_finite() {
            v.clamp(MIN_COORDINATE, MAX_COORDINATE)
        } else {
            0.0
        }
    };
    Point2::new(clamp(point.x), clamp(point.y))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn moving_a_corner_invalidates_the_transform() {
        let mut state = KeystoneState::default();
        state.set_enabled(true);
        let centre = state.transform().apply(Point2::new(0.5, 0.5)).unwrap();
        assert!((centre.x - 0.5).abs() < 1e-12 && (centre.y - 0.5).abs() < 1e-12);
        assert!(!state.is_dirty());

        assert!(state.apply(KeystoneCommand::Select(Corner::BottomRight)));
        assert!(state.apply(KeystoneCommand::Move(Direction::Left)));
        assert!(state.is_dirty());
        let moved = state.corner(Corner::BottomRight);
        assert!((moved.x - (1.0 - state.step())).abs() < 1e-12);

        let transform = *state.transform();
        assert!(!state.is_dirty());
        let mapped = transform.apply(Point2::new(1.0, 1.0)).unwrap();
        assert!((mapped.x - moved.x).abs() < 1e-9);
    }

    #[test]
    fn corners_are_clamped_to_extended_range() {
        let mut state = KeystoneState::default();
        state.set_corner(Corner::TopLeft, Point2::new(-5.0, 3.5));
        assert_eq!(state.corner(Corner::TopLeft), Point2::new(-1.0, 2.0));
        state.set_corner(Corner::TopRight, Point2::new(f64::NAN, 0.5));
        assert_eq!(state.corner(Corner::TopRight), Point2::new(0.0, 0.5));
    }

    #[test]
    fn degenerate_quad_keeps_previous_transform() {
        let mut state = KeystoneState::default();
        state.set_corner(Corner::TopRight, Point2::new(0.9, 0.1));
        let good = *state.transform();

        state.set_corner(Corner::TopRight, Point2::new(0.0, 0.0));
        state.set_corner(Corner::BottomRight, Point2::new(0.0, 0.0));
        assert_eq!(*state.transform(), good);
        assert!(!state.is_dirty());
    }

    #[test]
    fn step_and_border_stay_in_range() {
        let mut state = KeystoneState::default();
        for _ in 0..20 {
            state.apply(KeystoneCommand::IncreaseStep);
            state.apply(KeystoneCommand::WidenBorder);
        }
        assert_eq!(state.step(), MAX_STEP);
        assert_eq!(state.border_width(), MAX_BORDER_WIDTH);
        for _ in 0..40 {
            state.apply(KeystoneCommand::DecreaseStep);
            state.apply(KeystoneCommand::NarrowBorder);
        }
        assert_eq!(state.step(), MIN_STEP);
        assert_eq!(state.border_width(), MIN_BORDER_WIDTH);
    }

    #[test]
    fn reset_restores_unwarped_corners_but_keeps_mode() {
        let mut state = KeystoneState::default();
        state.apply(KeystoneCommand::Toggle);
        state.apply(KeystoneCommand::Move(Direction::Down));
        state.apply(KeystoneCommand::Reset);
        assert!(state.enabled());
        assert_eq!(
            KeystoneConfig::from(&state).corners,
            KeystoneConfig::UNWARPED
        );
    }

    #[test]
    fn config_conversion_is_lossless() {
        let mut state = KeystoneState::default();
        state.apply(KeystoneCommand::Toggle);
        state.apply(KeystoneCommand::Select(Corner::BottomLeft));
        state.apply(KeystoneCommand::Move(Direction::Right));
        state.apply(KeystoneCommand::ToggleMarkers);
        let config = KeystoneConfig::from(&state);
        let restored = KeystoneState::from(&config);
        assert_eq!(KeystoneConfig::from(&restored), config);
        assert_eq!(restored.active_corner(), Corner::BottomLeft);
    }
}
