//! Rendered spectrogram images and the pixel operations on them.

use crate::error::Result;
use crate::types::TimeRange;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use std::path::Path;

/// A rendered spectrogram with the time and frequency extent it depicts.
///
/// Column 0 is `time.start_ms`; row 0 is `high_hz` (frequency grows upward).
#[derive(Clone, Debug)]
pub struct Raster {
    pub image: RgbImage,
    pub time: TimeRange,
    pub low_hz: f64,
    pub high_hz: f64,
}

/// Sub-rectangle of a raster, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Raster {
    pub fn new(image: RgbImage, time: TimeRange, low_hz: f64, high_hz: f64) -> Self {
        Self { image, time, low_hz, high_hz }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn crop(&self, region: PixelRegion) -> RgbImage {
        imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height).to_image()
    }

    /// Place `next` to the right of this raster. The result spans from this
    /// raster's start to `next`'s end; the height is the taller of the two.
    pub fn append_right(&self, next: &Raster) -> Raster {
        let width = self.width() + next.width();
        let height = self.height().max(next.height());
        let mut merged = RgbImage::new(width, height);
        imageops::replace(&mut merged, &self.image, 0, 0);
        imageops::replace(&mut merged, &next.image, self.width() as i64, 0);
        Raster {
            image: merged,
            time: TimeRange::new(self.time.start_ms, next.time.end_ms),
            low_hz: self.low_hz.min(next.low_hz),
            high_hz: self.high_hz.max(next.high_hz),
        }
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        export_raster(&self.image, path)
    }

    /// Load a PNG previously written by `save_png`, tagging it with its extent.
    pub fn load_png(path: &Path, time: TimeRange, low_hz: f64, high_hz: f64) -> Result<Raster> {
        let image = image::open(path)?.to_rgb8();
        Ok(Raster { image, time, low_hz, high_hz })
    }
}

/// Resize to the display size with bilinear filtering.
pub fn scale_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    if image.width() == width && image.height() == height {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Write any raster as PNG. Failures are returned, not retried.
pub fn export_raster(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, v: u8, time: TimeRange) -> Raster {
        Raster::new(RgbImage::from_pixel(width, height, Rgb([v, v, v])), time, 0.0, 4000.0)
    }

    #[test]
    fn test_append_right_concatenates() {
        let a = solid(3, 4, 10, TimeRange::new(0, 60_000));
        let b = solid(2, 4, 200, TimeRange::new(60_000, 90_000));
        let merged = a.append_right(&b);
        assert_eq!(merged.width(), 5);
        assert_eq!(merged.time, TimeRange::new(0, 90_000));
        assert_eq!(merged.image.get_pixel(2, 0).0, [10, 10, 10]);
        assert_eq!(merged.image.get_pixel(3, 3).0, [200, 200, 200]);
    }

    #[test]
    fn test_png_round_trip_keeps_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tile.png");
        let mut raster = solid(4, 2, 0, TimeRange::new(0, 1000));
        raster.image.put_pixel(1, 1, Rgb([1, 2, 3]));
        raster.save_png(&path).unwrap();

        let loaded = Raster::load_png(&path, raster.time, raster.low_hz, raster.high_hz).unwrap();
        assert_eq!(loaded.image, raster.image);
    }

    #[test]
    fn test_scale_to_display_size() {
        let raster = solid(10, 10, 50, TimeRange::new(0, 1000));
        let scaled = scale_to(&raster.image, 33, 7);
        assert_eq!(scaled.dimensions(), (33, 7));
        assert_eq!(scaled.get_pixel(16, 3).0, [50, 50, 50]);
    }
}
