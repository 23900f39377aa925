//! Viewport: the visible time/frequency window and its mapping onto rasters.
//!
//! Zooming only moves bounds. Whether the new window can be cut out of an
//! existing raster or needs a fresh render is decided by the controller.

use crate::canvas::raster::{scale_to, PixelRegion, Raster};
use crate::error::{Result, SpectrogramError};
use crate::types::{FrequencyBand, TimeRange};
use image::RgbImage;

#[derive(Clone, Debug, PartialEq)]
pub struct Viewport {
    pub initial_time: u32,
    pub final_time: u32,
    pub initial_frequency: u32,
    pub final_frequency: u32,
    pub maximum_time: u32,
    pub maximum_frequency: u32,
    pub panel_width: u32,
    pub panel_height: u32,
    zoom_rate: u32,
}

impl Viewport {
    /// Full extent of a recording.
    pub fn new(maximum_time: u32, maximum_frequency: u32, panel_width: u32, panel_height: u32, zoom_rate: u32) -> Self {
        Self {
            initial_time: 0,
            final_time: maximum_time.max(1),
            initial_frequency: 0,
            final_frequency: maximum_frequency.max(1),
            maximum_time: maximum_time.max(1),
            maximum_frequency: maximum_frequency.max(1),
            panel_width: panel_width.max(1),
            panel_height: panel_height.max(1),
            zoom_rate: zoom_rate.clamp(1, 99),
        }
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.initial_time, self.final_time)
    }

    pub fn frequency_band(&self) -> FrequencyBand {
        FrequencyBand::new(self.initial_frequency, self.final_frequency)
    }

    pub fn is_full_time(&self) -> bool {
        self.initial_time == 0 && self.final_time == self.maximum_time
    }

    pub fn is_full_frequency(&self) -> bool {
        self.initial_frequency == 0 && self.final_frequency == self.maximum_frequency
    }

    pub fn set_panel_size(&mut self, width: u32, height: u32) {
        self.panel_width = width.max(1);
        self.panel_height = height.max(1);
    }

    pub fn zoom_in_time(&mut self) -> bool {
        let (lo, hi) = zoom_in(self.initial_time, self.final_time, self.zoom_rate);
        self.set_time(lo, hi)
    }

    pub fn zoom_out_time(&mut self) -> bool {
        let (lo, hi) = zoom_out(self.initial_time, self.final_time, self.maximum_time, self.zoom_rate);
        self.set_time(lo, hi)
    }

    pub fn zoom_in_frequency(&mut self) -> bool {
        let (lo, hi) = zoom_in(self.initial_frequency, self.final_frequency, self.zoom_rate);
        self.set_frequency(lo, hi)
    }

    pub fn zoom_out_frequency(&mut self) -> bool {
        let (lo, hi) = zoom_out(self.initial_frequency, self.final_frequency, self.maximum_frequency, self.zoom_rate);
        self.set_frequency(lo, hi)
    }

    /// Back to the whole recording. Returns false if already there.
    pub fn reset_time(&mut self) -> bool {
        self.set_time(0, self.maximum_time)
    }

    pub fn reset_frequency(&mut self) -> bool {
        self.set_frequency(0, self.maximum_frequency)
    }

    pub fn select_time_range(&mut self, start_ms: u32, end_ms: u32) -> Result<()> {
        let end_ms = end_ms.min(self.maximum_time);
        if start_ms >= end_ms {
            return Err(SpectrogramError::InvalidSelection(format!(
                "time range {start_ms}..{end_ms} ms is empty or outside 0..{} ms",
                self.maximum_time
            )));
        }
        self.set_time(start_ms, end_ms);
        Ok(())
    }

    pub fn select_frequency_range(&mut self, low_hz: u32, high_hz: u32) -> Result<()> {
        let high_hz = high_hz.min(self.maximum_frequency);
        if low_hz >= high_hz {
            return Err(SpectrogramError::InvalidSelection(format!(
                "frequency range {low_hz}..{high_hz} Hz is empty or outside 0..{} Hz",
                self.maximum_frequency
            )));
        }
        self.set_frequency(low_hz, high_hz);
        Ok(())
    }

    /// Select the rectangle between two display-pixel corners.
    pub fn select_zoom_region(&mut self, (x0, y0): (u32, u32), (x1, y1): (u32, u32)) -> Result<()> {
        let (left, right) = (x0.min(x1), x0.max(x1).min(self.panel_width));
        let (top, bottom) = (y0.min(y1), y0.max(y1).min(self.panel_height));
        if left >= right || top >= bottom {
            return Err(SpectrogramError::InvalidSelection(format!(
                "region ({x0},{y0})-({x1},{y1}) has no area"
            )));
        }

        let time_span = (self.final_time - self.initial_time) as u64;
        let freq_span = (self.final_frequency - self.initial_frequency) as u64;
        let width = self.panel_width as u64;
        let height = self.panel_height as u64;
        let start = self.initial_time + (left as u64 * time_span / width) as u32;
        let end = self.initial_time + (right as u64 * time_span).div_ceil(width) as u32;
        // Row 0 is the top of the band
        let high = self.final_frequency - (top as u64 * freq_span / height) as u32;
        let low = self.final_frequency - (bottom as u64 * freq_span).div_ceil(height) as u32;

        let before = self.clone();
        let result = self
            .select_time_range(start, end.max(start + 1))
            .and_then(|()| self.select_frequency_range(low, high.max(low + 1)));
        if result.is_err() {
            *self = before;
        }
        result
    }

    /// Crop `raster` to this viewport and scale to the panel.
    pub fn display(&self, raster: &Raster) -> RgbImage {
        let region = crop_region(raster, self.time_range(), self.frequency_band());
        scale_to(&raster.crop(region), self.panel_width, self.panel_height)
    }

    fn set_time(&mut self, lo: u32, hi: u32) -> bool {
        let hi = hi.min(self.maximum_time);
        let lo = lo.min(hi.saturating_sub(1));
        let changed = (lo, hi) != (self.initial_time, self.final_time);
        self.initial_time = lo;
        self.final_time = hi;
        changed
    }

    fn set_frequency(&mut self, lo: u32, hi: u32) -> bool {
        let hi = hi.min(self.maximum_frequency);
        let lo = lo.min(hi.saturating_sub(1));
        let changed = (lo, hi) != (self.initial_frequency, self.final_frequency);
        self.initial_frequency = lo;
        self.final_frequency = hi;
        changed
    }
}

/// Pull `hi` in by `rate`% of the span, keeping `lo` fixed and at least one unit.
fn zoom_in(lo: u32, hi: u32, rate: u32) -> (u32, u32) {
    let span = hi - lo;
    if span <= 1 {
        return (lo, hi);
    }
    let delta = ((span as u64 * rate as u64 / 100) as u32).clamp(1, span - 1);
    (lo, hi - delta)
}

/// Grow `[lo, hi]` so that zooming back in by `rate` returns the same span.
/// The step is the inverse of `zoom_in`, so it is `rate / (100 - rate)` of
/// the span rather than `rate`%.
///
/// Growth is split around the centre unless `lo` is already 0; whatever
/// cannot be applied on one side spills onto the other.
fn zoom_out(lo: u32, hi: u32, max: u32, rate: u32) -> (u32, u32) {
    let span = (hi - lo) as f64;
    let growth = ((span * rate as f64 / (100 - rate) as f64).round() as u32).max(1);

    let (mut left, mut right) = if lo == 0 { (0, growth) } else { (growth / 2, growth - growth / 2) };
    if left > lo {
        right += left - lo;
        left = lo;
    }
    let room_right = max.saturating_sub(hi);
    if right > room_right {
        left = (left + right - room_right).min(lo);
        right = room_right;
    }
    (lo - left, hi + right)
}

/// Pixel rectangle of `raster` showing `time` x `band`, clamped to the
/// raster and never narrower than one pixel in either direction.
pub fn crop_region(raster: &Raster, time: TimeRange, band: FrequencyBand) -> PixelRegion {
    let (x, width) = axis_span(
        raster.width(),
        raster.time.start_ms as f64,
        raster.time.end_ms as f64,
        time.start_ms as f64,
        time.end_ms as f64,
    );
    // Rows run from high to low frequency, so measure from the top.
    let (y, height) = axis_span(
        raster.height(),
        -raster.high_hz,
        -raster.low_hz,
        -(band.high_hz as f64),
        -(band.low_hz as f64),
    );
    PixelRegion { x, y, width, height }
}

fn axis_span(pixels: u32, image_start: f64, image_end: f64, start: f64, end: f64) -> (u32, u32) {
    if pixels == 0 {
        return (0, 0);
    }
    let size = pixels as f64;
    let per_pixel = (image_end - image_start) / size;
    if !(per_pixel > 0.0) {
        return (0, pixels);
    }
    let first = ((start - image_start) / per_pixel).clamp(0.0, size).floor() as u32;
    let last = (size - (image_end - end) / per_pixel).clamp(0.0, size).round() as u32;
    let span = last.saturating_sub(first).max(1);
    (first.min(pixels - span), span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn viewport() -> Viewport {
        Viewport::new(90_000, 4_000, 800, 300, 25)
    }

    #[test]
    fn test_repeated_zoom_in_keeps_order() {
        let mut v = viewport();
        for _ in 0..200 {
            v.zoom_in_time();
            v.zoom_in_frequency();
            assert!(v.initial_time < v.final_time);
            assert!(v.final_time - v.initial_time >= 1);
            assert!(v.initial_frequency < v.final_frequency);
        }
        assert_eq!(v.final_time - v.initial_time, 1);
        assert!(!v.zoom_in_time());
    }

    #[test]
    fn test_zoom_in_keeps_left_bound() {
        let mut v = viewport();
        v.select_time_range(20_000, 60_000).unwrap();
        assert!(v.zoom_in_time());
        assert_eq!((v.initial_time, v.final_time), (20_000, 50_000));

        v.select_frequency_range(1_000, 3_000).unwrap();
        assert!(v.zoom_in_frequency());
        assert_eq!((v.initial_frequency, v.final_frequency), (1_000, 2_500));
    }

    #[test]
    fn test_zoom_in_then_out_restores_span() {
        let mut v = viewport();
        v.select_time_range(20_000, 60_000).unwrap();
        for _ in 0..3 {
            v.zoom_in_time();
        }
        for _ in 0..3 {
            v.zoom_out_time();
        }
        let span = v.final_time - v.initial_time;
        assert!(span.abs_diff(40_000) <= 3, "span {span}");

        v.select_frequency_range(1_000, 3_000).unwrap();
        v.zoom_in_frequency();
        v.zoom_out_frequency();
        assert!((v.final_frequency - v.initial_frequency).abs_diff(2_000) <= 1);
    }

    #[test]
    fn test_zoom_out_at_left_edge_grows_right() {
        let mut v = viewport();
        v.select_time_range(0, 30_000).unwrap();
        v.zoom_out_time();
        assert_eq!(v.initial_time, 0);
        assert_eq!(v.final_time, 40_000);
    }

    #[test]
    fn test_zoom_out_clamps_to_extent() {
        let mut v = viewport();
        v.select_time_range(80_000, 89_000).unwrap();
        v.zoom_out_time();
        v.zoom_out_time();
        assert_eq!(v.final_time, 90_000);
        assert!(v.initial_time < 80_000);
        for _ in 0..20 {
            v.zoom_out_time();
        }
        assert!(v.is_full_time());
        assert!(!v.zoom_out_time());
    }

    #[test]
    fn test_zoom_out_tiny_span_moves_at_least_one() {
        let mut v = viewport();
        v.select_time_range(500, 501).unwrap();
        assert!(v.zoom_out_time());
        assert!(v.final_time - v.initial_time >= 2);
    }

    #[test]
    fn test_reset_is_noop_when_full() {
        let mut v = viewport();
        assert!(!v.reset_time());
        assert!(!v.reset_frequency());
        v.zoom_in_time();
        assert!(v.reset_time());
        assert!(v.is_full_time());
    }

    #[test]
    fn test_invalid_selection_rejected() {
        let mut v = viewport();
        assert!(v.select_time_range(5_000, 5_000).is_err());
        assert!(v.select_time_range(95_000, 99_000).is_err());
        assert!(v.select_frequency_range(3_000, 2_000).is_err());
        assert!(v.select_zoom_region((10, 10), (10, 50)).is_err());
        assert!(v.is_full_time());
    }

    #[test]
    fn test_zoom_region_maps_pixels() {
        let mut v = viewport();
        v.select_zoom_region((600, 225), (200, 75)).unwrap();
        assert_eq!(v.time_range(), TimeRange::new(22_500, 67_500));
        assert_eq!(v.frequency_band(), FrequencyBand::new(1_000, 3_000));
    }

    #[test]
    fn test_crop_region_maps_time_and_frequency() {
        let raster = Raster::new(RgbImage::new(900, 128), TimeRange::new(0, 90_000), 0.0, 4000.0);
        let region = crop_region(&raster, TimeRange::new(30_000, 60_000), FrequencyBand::new(1000, 3000));
        assert_eq!(region, PixelRegion { x: 300, y: 32, width: 300, height: 64 });

        // Outside the raster collapses to a single clamped column
        let edge = crop_region(&raster, TimeRange::new(95_000, 99_000), FrequencyBand::new(0, 4000));
        assert_eq!((edge.x, edge.width), (899, 1));
        assert_eq!((edge.y, edge.height), (0, 128));
    }

    #[test]
    fn test_display_is_panel_sized() {
        let mut image = RgbImage::from_pixel(100, 64, Rgb([255, 255, 255]));
        for y in 0..64 {
            image.put_pixel(10, y, Rgb([0, 0, 0]));
        }
        let raster = Raster::new(image, TimeRange::new(0, 10_000), 0.0, 4000.0);
        let mut v = Viewport::new(10_000, 4000, 320, 200, 25);
        v.select_time_range(0, 5_000).unwrap();
        let shown = v.display(&raster);
        assert_eq!(shown.dimensions(), (320, 200));
    }
}
