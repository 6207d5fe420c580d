use crate::frame::{Frame, PixelFormat};
use serde::{Deserialize, Serialize};

/// A fixed sampling coordinate in full-resolution frame pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(id: impl Into<String>, x: i64, y: i64) -> Self {
        Point { id: id.into(), x, y }
    }
}

/// Channel values in canonical red, green, blue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointReading {
    pub point: Point,
    /// `None` when the point lies outside the frame.
    pub rgb: Option<Rgb>,
}

/// Reads one pixel, normalizing the frame's native channel order to RGB.
pub fn sample_point(frame: &Frame, x: i64, y: i64) -> Option<Rgb> {
    if x < 0 || y < 0 || x >= frame.width as i64 || y >= frame.height as i64 {
        return None;
    }
    let [c0, c1, c2] = frame.native_pixel(x as u32, y as u32)?;
    Some(match frame.format {
        PixelFormat::Rgb => Rgb { r: c0, g: c1, b: c2 },
        PixelFormat::Bgr => Rgb { r: c2, g: c1, b: c0 },
    })
}

/// One reading per point, in the order the points are given.
pub fn sample(frame: &Frame, points: &[Point]) -> Vec<PointReading> {
    points
        .iter()
        .map(|p| PointReading { point: p.clone(), rgb: sample_point(frame, p.x, p.y) })
        .collect()
}
