//! The pixel buffer behind one service.
//!
//! A store is allocated for exactly one [`Dimensions`] pair and never
//! resized. The execution pipeline replaces it whenever the requested
//! dimensions change. Writing pixels is the render server's business;
//! the service only tracks which region changed.

use serde::{Deserialize, Serialize};

use crate::error::FramebufferError;
use crate::geometry::{Dimensions, Rect};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    #[default]
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
        }
    }
}

// ── FramebufferBackingStore ──────────────────────────────────────

/// Pixel storage at the scaled size of one dimension pair.
///
/// The buffer holds `scaled.height` rows of `stride` bytes each.
#[derive(Debug)]
pub struct FramebufferBackingStore {
    dimensions: Dimensions,
    format: PixelFormat,
    stride: usize,
    generation: u64,
    pixels: Vec<u8>,
    dirty: Option<Rect>,
}

impl FramebufferBackingStore {
    /// Allocate a zeroed store.
    ///
    /// Fails for non-positive dimensions or when the buffer would exceed
    /// `max_bytes`.
    pub fn create(
        dimensions: Dimensions,
        format: PixelFormat,
        generation: u64,
        max_bytes: u64,
    ) -> Result<Self, FramebufferError> {
        let dimensions = dimensions.validate()?;
        let bpp = format.bytes_per_pixel() as u64;
        let size = dimensions.scaled.area().saturating_mul(bpp);
        if size > max_bytes || usize::try_from(size).is_err() {
            return Err(FramebufferError::BackingStoreTooLarge {
                size,
                max: max_bytes,
            });
        }

        Ok(Self {
            dimensions,
            format,
            stride: dimensions.scaled.width as usize * bpp as usize,
            generation,
            pixels: vec![0; size as usize],
            dirty: None,
        })
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Allocation counter value this store was created with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Row pitch in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Full-frame rectangle in store pixels.
    pub fn bounds(&self) -> Rect {
        self.dimensions.bounds()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Returns a row slice.
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds.
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.pixels[start..start + self.stride]
    }

    /// Record `rect` as changed, clipped to the store.
    ///
    /// Returns the clipped rectangle, or `None` when it lies entirely
    /// outside the store.
    pub fn mark_dirty(&mut self, rect: Rect) -> Option<Rect> {
        let clipped = self.bounds().intersection(&rect)?;
        self.dirty = Some(match self.dirty {
            Some(existing) => existing.union(&clipped),
            None => clipped,
        });
        Some(clipped)
    }

    /// Region changed since the last call, if any.
    pub fn take_dirty(&mut self) -> Option<Rect> {
        self.dirty.take()
    }

    pub fn dirty(&self) -> Option<Rect> {
        self.dirty
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    const MAX: u64 = 64 * 1024 * 1024;

    fn dims(w: i32, h: i32) -> Dimensions {
        Dimensions::new(Size::new(w / 2, h / 2), Size::new(w, h))
    }

    #[test]
    fn allocates_at_scaled_size() {
        let store = FramebufferBackingStore::create(dims(100, 50), PixelFormat::Bgra8, 1, MAX).unwrap();
        assert_eq!(store.byte_len(), 100 * 50 * 4);
        assert_eq!(store.stride(), 400);
        assert_eq!(store.row(49).len(), 400);
        assert_eq!(store.bounds(), Rect::new(0, 0, 100, 50));
        assert!(store.pixels().iter().all(|&b| b == 0));
    }

    #[test]
    fn refuses_oversized_store() {
        let err = FramebufferBackingStore::create(dims(4096, 4096), PixelFormat::Rgba8, 1, 1024)
            .unwrap_err();
        assert!(matches!(err, FramebufferError::BackingStoreTooLarge { .. }));
    }

    #[test]
    fn refuses_non_positive_dimensions() {
        let bad = Dimensions::new(Size::new(10, 10), Size::new(0, 10));
        assert!(FramebufferBackingStore::create(bad, PixelFormat::Bgra8, 1, MAX).is_err());
    }

    #[test]
    fn dirty_regions_accumulate_until_taken() {
        let mut store = FramebufferBackingStore::create(dims(100, 100), PixelFormat::Bgra8, 1, MAX).unwrap();
        assert_eq!(store.mark_dirty(Rect::new(90, 90, 20, 20)), Some(Rect::new(90, 90, 10, 10)));
        store.mark_dirty(Rect::new(0, 0, 10, 10));
        assert_eq!(store.take_dirty(), Some(Rect::new(0, 0, 100, 100)));
        assert_eq!(store.take_dirty(), None);
    }

    #[test]
    fn dirty_outside_bounds_is_ignored() {
        let mut store = FramebufferBackingStore::create(dims(10, 10), PixelFormat::Bgra8, 1, MAX).unwrap();
        assert_eq!(store.mark_dirty(Rect::new(20, 20, 5, 5)), None);
        assert_eq!(store.dirty(), None);
    }
}
