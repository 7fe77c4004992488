//! Frames copied out of camera buffers.

use crate::devices::pco::Roi;
use crate::error::{AppResult, DeviceError};
use serde::{Deserialize, Serialize};

/// Row-major 16-bit image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u16>,
}

impl Frame {
    /// Wrap `data`, which must hold `width * height` pixels.
    pub fn new(width: usize, height: usize, data: Vec<u16>) -> AppResult<Self> {
        if data.len() != width * height {
            return Err(DeviceError::Validation(format!(
                "{} pixels do not fill a {}x{} frame",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixels, row by row.
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    /// Take the pixels.
    pub fn into_data(self) -> Vec<u16> {
        self.data
    }

    /// Pixel at column `x`, row `y`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y * self.width + x).copied()
    }

    /// Rows `offsetY..offsetY+height`, columns `offsetX..offsetX+width`,
    /// clipped to the frame.
    pub fn crop(&self, roi: &Roi) -> Frame {
        let span = |offset: i64, len: i64, max: usize| {
            let start = usize::try_from(offset).unwrap_or(0).min(max);
            let end = usize::try_from(offset.saturating_add(len))
                .unwrap_or(0)
                .clamp(start, max);
            (start, end - start)
        };
        let (x0, w) = span(roi.offset_x, roi.width, self.width);
        let (y0, h) = span(roi.offset_y, roi.height, self.height);
        let mut data = Vec::with_capacity(w * h);
        for row in self.data.chunks_exact(self.width.max(1)).skip(y0).take(h) {
            data.extend_from_slice(&row[x0..x0 + w]);
        }
        Frame {
            width: w,
            height: h,
            data,
        }
    }

    /// Mirror left-to-right.
    pub fn flip_lr(&mut self) {
        if self.width == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(self.width) {
            row.reverse();
        }
    }

    /// Mirror top-to-bottom.
    pub fn flip_ud(&mut self) {
        let (width, height) = (self.width, self.height);
        for y in 0..height / 2 {
            let (top, bottom) = self.data.split_at_mut((height - 1 - y) * width);
            top[y * width..(y + 1) * width].swap_with_slice(&mut bottom[..width]);
        }
    }

    /// Crop to `roi`, then mirror as requested.
    pub fn post_process(&self, roi: &Roi, fliplr: bool, flipud: bool) -> Frame {
        let mut frame = self.crop(roi);
        if fliplr {
            frame.flip_lr();
        }
        if flipud {
            frame.flip_ud();
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0 1 2 3
    // 4 5 6 7
    // 8 9 10 11
    fn ramp() -> Frame {
        Frame::new(4, 3, (0..12).collect()).unwrap()
    }

    fn roi(offset_x: i64, offset_y: i64, width: i64, height: i64) -> Roi {
        Roi {
            offset_x,
            offset_y,
            width,
            height,
        }
    }

    #[test]
    fn test_new_checks_size() {
        assert!(Frame::new(2, 2, vec![0; 3]).is_err());
    }

    #[test]
    fn test_crop() {
        let cropped = ramp().crop(&roi(1, 1, 2, 2));
        assert_eq!(cropped.data(), &[5, 6, 9, 10]);
        assert_eq!((cropped.width(), cropped.height()), (2, 2));
        assert_eq!(ramp().crop(&roi(0, 0, 4, 3)), ramp());
    }

    #[test]
    fn test_crop_clips_to_frame() {
        let clipped = ramp().crop(&roi(1, 2, 4, 3));
        assert_eq!((clipped.width(), clipped.height()), (3, 1));
        assert_eq!(clipped.data(), &[9, 10, 11]);

        let empty = ramp().crop(&roi(5, 0, 2, 2));
        assert_eq!((empty.width(), empty.height()), (0, 2));
        assert!(empty.data().is_empty());
    }

    #[test]
    fn test_flips_are_involutions() {
        let mut frame = ramp();
        frame.flip_lr();
        assert_eq!(frame.data(), &[3, 2, 1, 0, 7, 6, 5, 4, 11, 10, 9, 8]);
        frame.flip_lr();
        assert_eq!(frame, ramp());

        frame.flip_ud();
        assert_eq!(frame.data(), &[8, 9, 10, 11, 4, 5, 6, 7, 0, 1, 2, 3]);
        frame.flip_ud();
        assert_eq!(frame, ramp());
    }

    #[test]
    fn test_crop_happens_before_flip() {
        let frame = ramp().post_process(&roi(0, 0, 2, 2), true, true);
        assert_eq!(frame.data(), &[5, 4, 1, 0]);
        assert_eq!(frame.pixel(0, 0), Some(5));
        assert_eq!(frame.pixel(2, 0), None);
    }
}
