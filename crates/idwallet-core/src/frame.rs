//! Raw camera frames and their upright decoded form.

use image::{imageops, RgbImage};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} RGB8")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported rotation: {0} degrees")]
    Rotation(u32),
    #[error("empty frame")]
    Empty,
}

/// One analysed camera frame as delivered by the frame source.
///
/// `data` is packed RGB8, row-major, in sensor orientation. `rotation_degrees`
/// is the clockwise rotation needed to make the image upright.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation_degrees: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, rotation_degrees: u32) -> Self {
        Self {
            data,
            width,
            height,
            rotation_degrees,
        }
    }

    /// Decode into an upright image. Consumes the buffer.
    pub fn into_image(self) -> Result<RgbImage, FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty);
        }
        let rotation = self.rotation_degrees % 360;
        if rotation % 90 != 0 {
            return Err(FrameError::Rotation(self.rotation_degrees));
        }

        let expected = self.width as usize * self.height as usize * 3;
        let actual = self.data.len();
        let img = RgbImage::from_raw(self.width, self.height, self.data).ok_or(
            FrameError::BufferSize {
                width: self.width,
                height: self.height,
                expected,
                actual,
            },
        )?;
        if actual != expected {
            return Err(FrameError::BufferSize {
                width: self.width,
                height: self.height,
                expected,
                actual,
            });
        }

        Ok(match rotation {
            90 => imageops::rotate90(&img),
            180 => imageops::rotate180(&img),
            270 => imageops::rotate270(&img),
            _ => img,
        })
    }
}

/// Mean Rec.601 luma in 0–255. Returns 0 for an empty image.
pub fn mean_luminance(img: &RgbImage) -> f32 {
    let count = img.width() as u64 * img.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let total: f64 = img
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum();
    (total / count as f64) as f32
}
