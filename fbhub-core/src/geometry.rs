//! Sizes, rectangles, and the logical/scaled dimension pair.
//!
//! Components are signed so a peer can *send* a negative size; such
//! requests are rejected by [`Dimensions::validate`] before anything
//! is mutated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FramebufferError;

// ── Size ─────────────────────────────────────────────────────────

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Both components strictly greater than zero.
    pub const fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Pixel count, or zero for a non-positive size.
    pub fn area(&self) -> u64 {
        if self.is_positive() {
            self.width as u64 * self.height as u64
        } else {
            0
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The rectangle at the origin covering `size`.
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlapping area of two rectangles, `None` when they are disjoint.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as i64 || y1 <= y0 as i64 {
            return None;
        }
        Some(Rect::new(x0, y0, (x1 - x0 as i64) as i32, (y1 - y0 as i64) as i32))
    }

    /// Smallest rectangle containing both. Empty inputs are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        let width = (x1 - x0 as i64).min(i32::MAX as i64) as i32;
        let height = (y1 - y0 as i64).min(i32::MAX as i64) as i32;
        Rect::new(x0, y0, width, height)
    }

    /// `true` when `other` lies entirely inside `self`.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        !other.is_empty()
            && other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) {}x{}", self.x, self.y, self.width, self.height)
    }
}

// ── Dimensions ───────────────────────────────────────────────────

/// The logical device size paired with the scaled (backing) size.
///
/// The backing store is allocated at `scaled`; `device` is what the
/// render server lays out against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub device: Size,
    pub scaled: Size,
}

impl Dimensions {
    pub const fn new(device: Size, scaled: Size) -> Self {
        Self { device, scaled }
    }

    pub const fn is_valid(&self) -> bool {
        self.device.is_positive() && self.scaled.is_positive()
    }

    /// Reject any pair with a non-positive component.
    pub fn validate(self) -> Result<Self, FramebufferError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(FramebufferError::InvalidDimensions(self))
        }
    }

    /// Full-frame bounds in backing-store pixels.
    pub const fn bounds(&self) -> Rect {
        Rect::from_size(self.scaled)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.device, self.scaled)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_dimensions_rejected() {
        let good = Dimensions::new(Size::new(390, 844), Size::new(1170, 2532));
        assert!(good.validate().is_ok());

        for bad in [
            Dimensions::new(Size::new(0, 844), Size::new(1170, 2532)),
            Dimensions::new(Size::new(390, -1), Size::new(1170, 2532)),
            Dimensions::new(Size::new(390, 844), Size::new(0, 0)),
        ] {
            assert!(matches!(
                bad.validate(),
                Err(FramebufferError::InvalidDimensions(_))
            ));
        }
    }

    #[test]
    fn intersection_clips_to_bounds() {
        let bounds = Rect::new(0, 0, 100, 50);
        let r = Rect::new(80, 40, 40, 40);
        assert_eq!(bounds.intersection(&r), Some(Rect::new(80, 40, 20, 10)));
        assert_eq!(bounds.intersection(&Rect::new(200, 0, 5, 5)), None);
        assert_eq!(bounds.intersection(&Rect::new(0, 0, 0, 5)), None);
    }

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.union(&Rect::default()), a);
        assert_eq!(Rect::default().union(&a), a);
        assert_eq!(a.union(&Rect::new(0, 0, 2, 2)), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn contains_full_frame() {
        let bounds = Rect::from_size(Size::new(64, 32));
        assert!(bounds.contains_rect(&Rect::new(0, 0, 64, 32)));
        assert!(!bounds.contains_rect(&Rect::new(1, 0, 64, 32)));
    }

    #[test]
    fn area_of_negative_size_is_zero() {
        assert_eq!(Size::new(-4, 10).area(), 0);
        assert_eq!(Size::new(4, 10).area(), 40);
    }
}
