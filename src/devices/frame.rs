//! Image frames and image-space transforms.

use serde::{Deserialize, Serialize};

/// A single 16-bit monochrome image as delivered by a camera.
///
/// Pixels are stored row-major, `width * height` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data, row-major
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Create a frame from pixel data.
    ///
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Option<Self> {
        if pixels.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// An all-zero frame, published in place of a dropped frame.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width as usize) * (height as usize)],
        }
    }

    /// Frame shape as (width, height).
    pub fn shape(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get((y as usize) * (self.width as usize) + x as usize)
            .copied()
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&v| v as u64).sum();
        sum as f64 / self.pixels.len() as f64
    }

    /// Split the frame into its left and right halves.
    ///
    /// An odd trailing column is dropped so both halves have equal width.
    pub fn split_halves(&self) -> (Frame, Frame) {
        let half = self.width / 2;
        let mut left = Vec::with_capacity((half * self.height) as usize);
        let mut right = Vec::with_capacity((half * self.height) as usize);
        for row in self.pixels.chunks(self.width.max(1) as usize) {
            left.extend_from_slice(&row[..half as usize]);
            right.extend_from_slice(&row[half as usize..(2 * half) as usize]);
        }
        (
            Frame {
                width: half,
                height: self.height,
                pixels: left,
            },
            Frame {
                width: half,
                height: self.height,
                pixels: right,
            },
        )
    }

    /// Apply an image transform: rotate 90° counter-clockwise first, then flips.
    pub fn transformed(&self, transform: Transform) -> Frame {
        let mut out = if transform.rot90 {
            let (w, h) = (self.width as usize, self.height as usize);
            let mut pixels = vec![0u16; w * h];
            // New image is h wide and w tall.
            for ny in 0..w {
                for nx in 0..h {
                    pixels[ny * h + nx] = self.pixels[nx * w + (w - 1 - ny)];
                }
            }
            Frame {
                width: self.height,
                height: self.width,
                pixels,
            }
        } else {
            self.clone()
        };

        let w = out.width as usize;
        if transform.flip_lr && w > 0 {
            for row in out.pixels.chunks_mut(w) {
                row.reverse();
            }
        }
        if transform.flip_ud && w > 0 {
            let rows: Vec<Vec<u16>> = out.pixels.chunks(w).rev().map(|r| r.to_vec()).collect();
            out.pixels = rows.concat();
        }
        out
    }
}

/// Image-space transform of a light path: (flip left-right, flip up-down, rotate 90°).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Mirror horizontally
    #[serde(default)]
    pub flip_lr: bool,
    /// Mirror vertically
    #[serde(default)]
    pub flip_ud: bool,
    /// Rotate by 90 degrees
    #[serde(default)]
    pub rot90: bool,
}

impl Transform {
    /// Construct a transform from its three components.
    pub fn new(flip_lr: bool, flip_ud: bool, rot90: bool) -> Self {
        Self {
            flip_lr,
            flip_ud,
            rot90,
        }
    }

    /// Combine two transforms component-wise (each flag toggles the other).
    pub fn combine(self, other: Transform) -> Transform {
        Transform {
            flip_lr: self.flip_lr ^ other.flip_lr,
            flip_ud: self.flip_ud ^ other.flip_ud,
            rot90: self.rot90 ^ other.rot90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        // 3 x 2:
        // 1 2 3
        // 4 5 6
        Frame::new(3, 2, vec![1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(2, 2, vec![0; 3]).is_none());
    }

    #[test]
    fn flip_lr_reverses_rows() {
        let f = sample().transformed(Transform::new(true, false, false));
        assert_eq!(f.pixels, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn flip_ud_reverses_row_order() {
        let f = sample().transformed(Transform::new(false, true, false));
        assert_eq!(f.pixels, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn rot90_is_counter_clockwise() {
        let f = sample().transformed(Transform::new(false, false, true));
        assert_eq!(f.shape(), (2, 3));
        // 3 6
        // 2 5
        // 1 4
        assert_eq!(f.pixels, vec![3, 6, 2, 5, 1, 4]);
    }

    #[test]
    fn combine_toggles_flags() {
        let base = Transform::new(true, false, true);
        let objective = Transform::new(true, true, false);
        assert_eq!(base.combine(objective), Transform::new(false, true, true));
        assert_eq!(base.combine(Transform::default()), base);
    }

    #[test]
    fn split_halves_drops_odd_column() {
        let (left, right) = sample().split_halves();
        assert_eq!(left.pixels, vec![1, 4]);
        assert_eq!(right.pixels, vec![2, 5]);
    }

    #[test]
    fn mean_of_zeros() {
        assert_eq!(Frame::zeros(4, 4).mean(), 0.0);
        assert!((sample().mean() - 3.5).abs() < 1e-12);
    }
}
