//! Frames and the sources that produce them.
//!
//! A source yields the most recent full-resolution frame on demand. There is
//! no queueing: every `capture` call returns a fresh frame or fails the tick.

use crate::error::AcquisitionError;
use rand::Rng;
use serde::Deserialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Byte order of the three channels of each pixel as delivered by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb,
    Bgr,
}

/// Packed 8-bit, three-channel image, row-major, no padding.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, AcquisitionError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(AcquisitionError::BadGeometry {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Frame {
            data,
            width,
            height,
            format,
        })
    }

    /// Solid frame, mostly for tests.
    pub fn filled(width: u32, height: u32, format: PixelFormat, px: [u8; 3]) -> Self {
        let data = px.iter().copied().cycle().take(width as usize * height as usize * 3).collect();
        Frame { data, width, height, format }
    }

    /// Raw channel triple at (x, y) in the frame's native order.
    pub(crate) fn native_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    pub fn set_native_pixel(&mut self, x: u32, y: u32, px: [u8; 3]) {
        if x < self.width && y < self.height {
            let i = (y as usize * self.width as usize + x as usize) * 3;
            self.data[i..i + 3].copy_from_slice(&px);
        }
    }

    /// Pixel buffer in R,G,B order, borrowed when no swap is needed.
    pub fn to_rgb(&self) -> Cow<'_, [u8]> {
        match self.format {
            PixelFormat::Rgb => Cow::Borrowed(&self.data),
            PixelFormat::Bgr => {
                let mut out = self.data.clone();
                for px in out.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                Cow::Owned(out)
            }
        }
    }

    /// Display size after capping the width at `max_width`, keeping aspect ratio.
    pub fn preview_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
        if width <= max_width || max_width == 0 {
            return (width, height);
        }
        let scale = max_width as f64 / width as f64;
        (max_width, ((height as f64) * scale) as u32)
    }
}

pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, AcquisitionError>;

    fn describe(&self) -> String;
}

/// Moving color gradient with a little sensor noise. Stands in for a camera
/// on machines without one.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    phase: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        SyntheticSource { width, height, format, phase: 0 }
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Result<Frame, AcquisitionError> {
        let mut rng = rand::thread_rng();
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let r = ((x * 255 / w.max(1)) as u32).wrapping_add(self.phase) as u8;
                let g = (y * 255 / h.max(1)) as u8;
                let b = 128u8.wrapping_add(rng.gen_range(0..4));
                match self.format {
                    PixelFormat::Rgb => data.extend_from_slice(&[r, g, b]),
                    PixelFormat::Bgr => data.extend_from_slice(&[b, g, r]),
                }
            }
        }
        self.phase = self.phase.wrapping_add(1);
        Frame::new(data, self.width, self.height, self.format)
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{} ({:?})", self.width, self.height, self.format)
    }
}

/// Serves the same decoded still image on every capture.
pub struct StillImageSource {
    path: PathBuf,
    frame: Frame,
}

impl StillImageSource {
    pub fn open(path: &Path) -> Result<Self, AcquisitionError> {
        let img = image::open(path).map_err(|e| AcquisitionError::Decode {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        let rgb = img.into_rgb8();
        let (width, height) = rgb.dimensions();
        let frame = Frame::new(rgb.into_raw(), width, height, PixelFormat::Rgb)?;
        Ok(StillImageSource { path: path.to_path_buf(), frame })
    }
}

impl FrameSource for StillImageSource {
    fn capture(&mut self) -> Result<Frame, AcquisitionError> {
        Ok(self.frame.clone())
    }

    fn describe(&self) -> String {
        format!("still image {} ({}x{})", self.path.display(), self.frame.width, self.frame.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_buffer_size() {
        let err = Frame::new(vec![0; 10], 2, 2, PixelFormat::Rgb).unwrap_err();
        assert!(matches!(err, AcquisitionError::BadGeometry { expected: 12, actual: 10, .. }));
    }

    #[test]
    fn test_to_rgb_swaps_bgr() {
        let f = Frame::filled(2, 1, PixelFormat::Bgr, [10, 50, 200]);
        assert_eq!(&*f.to_rgb(), &[200, 50, 10, 200, 50, 10]);
        let f = Frame::filled(1, 1, PixelFormat::Rgb, [1, 2, 3]);
        assert!(matches!(f.to_rgb(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_preview_dimensions() {
        assert_eq!(Frame::preview_dimensions(1280, 720, 960), (960, 540));
        assert_eq!(Frame::preview_dimensions(640, 480, 960), (640, 480));
    }

    #[test]
    fn test_synthetic_source_geometry() {
        let mut src = SyntheticSource::new(32, 16, PixelFormat::Bgr);
        let f = src.capture().unwrap();
        assert_eq!((f.width, f.height, f.format), (32, 16, PixelFormat::Bgr));
        assert!(f.native_pixel(31, 15).is_some());
        assert!(f.native_pixel(32, 0).is_none());
    }

    #[test]
    fn test_still_image_source_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("still.png");
        let mut img = image::RgbImage::new(4, 3);
        img.put_pixel(1, 2, image::Rgb([200, 50, 10]));
        img.save(&path).unwrap();

        let mut src = StillImageSource::open(&path).unwrap();
        let f = src.capture().unwrap();
        assert_eq!((f.width, f.height), (4, 3));
        assert_eq!(f.native_pixel(1, 2), Some([200, 50, 10]));
    }

    #[test]
    fn test_still_image_source_missing_file() {
        let err = StillImageSource::open(Path::new("/nonexistent/still.png")).err().unwrap();
        assert!(matches!(err, AcquisitionError::Decode { .. }));
    }
}
