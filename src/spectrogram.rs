//! The spectrogram controller.
//!
//! Owns the audio handle, the current [`RenderSession`], the viewport and
//! the tile cache. Zoom and selection calls only move the viewport and try
//! to cut the new window out of a raster already in memory; when none
//! covers it, [`Reload::RenderRequired`] tells the caller to call
//! [`Spectrogram::render`].

use crate::audio::AudioSource;
use crate::canvas::raster::{export_raster, Raster};
use crate::canvas::spectrogram_renderer::{peak_spectrum, RenderRequest, Renderer};
use crate::canvas::tile_cache::TileCacheManager;
use crate::canvas::viewport::Viewport;
use crate::config::EngineConfig;
use crate::dsp::features::{CepstralExtractor, CepstralFeatures};
use crate::error::{Result, SpectrogramError};
use crate::session::{CachePolicy, RenderSession};
use crate::types::{FrequencyBand, PowerSpectrumValue, RenderKind, RenderParameters, TimeRange};
use image::RgbImage;
use std::path::Path;

/// Outcome of moving the viewport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reload {
    /// The display was rebuilt from a raster already in memory.
    Cropped,
    /// Nothing in memory covers the viewport; call `render`.
    RenderRequired,
}

pub struct Spectrogram {
    audio: Box<dyn AudioSource>,
    session: RenderSession,
    viewport: Viewport,
    tiles: TileCacheManager,
    original: Option<Raster>,
    display: Option<RgbImage>,
    needs_render: bool,
}

impl Spectrogram {
    pub fn new(audio: Box<dyn AudioSource>, config: &EngineConfig, panel_width: u32, panel_height: u32) -> Result<Self> {
        config.validate()?;
        let total_ms = audio.total_time_ms();
        if total_ms == 0 || audio.num_samples() == 0 {
            return Err(SpectrogramError::NoAudioData { start_ms: 0, end_ms: 0 });
        }
        let session = RenderSession::new(config, total_ms, panel_width, panel_height);
        let viewport = Viewport::new(
            total_ms,
            audio.maximum_frequency(),
            panel_width,
            panel_height,
            config.zoom_rate_percent,
        );
        let tiles = TileCacheManager::new(&*audio, &config.cache_dir, config.tile_segment_ms, session.policy);
        log::debug!(
            "Opened {} ({} ms, {} Hz): {:?} tile policy",
            audio.name(),
            total_ms,
            audio.sample_rate(),
            session.policy
        );

        Ok(Self {
            audio,
            session,
            viewport,
            tiles,
            original: None,
            display: None,
            needs_render: true,
        })
    }

    pub fn session(&self) -> &RenderSession {
        &self.session
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn parameters(&self) -> RenderParameters {
        self.session.params
    }

    pub fn policy(&self) -> CachePolicy {
        self.session.policy
    }

    pub fn needs_render(&self) -> bool {
        self.needs_render
    }

    /// Last interactive render, tagged with its extent.
    pub fn original(&self) -> Option<&Raster> {
        self.original.as_ref()
    }

    /// The viewport at panel size.
    pub fn display(&self) -> Option<&RgbImage> {
        self.display.as_ref()
    }

    /// Covered range and completeness of the in-memory tile.
    pub fn tile_coverage(&self) -> Option<(TimeRange, bool)> {
        self.tiles.coverage()
    }

    pub fn set_panel_size(&mut self, width: u32, height: u32) -> Reload {
        self.session.panel_width = width.max(1);
        self.session.panel_height = height.max(1);
        self.viewport.set_panel_size(width, height);
        self.reload()
    }

    /// Switch FFT parameters. Any change drops every in-memory raster and
    /// stops background tile work; the next `render` starts over.
    pub fn set_parameters(&mut self, params: RenderParameters) -> Result<()> {
        params.validate()?;
        if params == self.session.params {
            return Ok(());
        }
        log::info!(
            "Render parameters changed: fft {} overlap {}% {}",
            params.fft_sample_size,
            params.overlap_percent,
            params.window_function
        );
        self.tiles.invalidate();
        self.session.params = params;
        self.original = None;
        self.display = None;
        self.needs_render = true;
        Ok(())
    }

    /// Produce the display for the current viewport, rendering if needed.
    pub fn render(&mut self) -> Result<&RgbImage> {
        match self.session.policy {
            CachePolicy::Short => self.render_short()?,
            CachePolicy::Long => self.render_long()?,
        }
        if self.reload() == Reload::RenderRequired {
            return Err(SpectrogramError::NotRendered);
        }
        self.display.as_ref().ok_or(SpectrogramError::NotRendered)
    }

    /// The whole recording as one eagerly rendered tile.
    fn render_short(&mut self) -> Result<()> {
        let params = self.session.params;
        if self.tiles.restore(&params).is_some() {
            if let Some(tile) = self.tiles.borrow_tile(&params, Raster::clone) {
                self.original = Some(tile);
                return Ok(());
            }
        }

        let full = TimeRange::new(0, self.viewport.maximum_time);
        let raster = Renderer::new(&self.session)
            .render(self.audio.as_mut(), &RenderRequest::new(full, RenderKind::Standard))?;
        if let Err(e) = self.tiles.store_complete(&params, raster.clone()) {
            log::warn!("Could not cache tile for {}: {e}", self.audio.name());
        }
        self.original = Some(raster);
        Ok(())
    }

    /// Serve from the tile when it covers the viewport, otherwise render
    /// the viewport directly. Either way keep the tile growing.
    fn render_long(&mut self) -> Result<()> {
        let params = self.session.params;
        let time = self.viewport.time_range();
        let covered = self
            .tiles
            .restore(&params)
            .is_some_and(|(range, _)| range.contains(&time));

        if !covered {
            let mut request = RenderRequest::new(time, RenderKind::Standard);
            if !self.viewport.is_full_frequency() {
                request = request.with_band(self.viewport.frequency_band());
            }
            let raster = Renderer::new(&self.session).render(self.audio.as_mut(), &request)?;
            log::debug!("Rendered {}x{} for {}..{} ms", raster.width(), raster.height(), time.start_ms, time.end_ms);
            self.original = Some(raster);
        }

        if !self.tiles.is_complete() {
            match self.audio.try_clone() {
                Ok(audio) => {
                    if let Err(e) = self.tiles.spawn_extension(audio, self.session.clone()) {
                        log::warn!("Could not start tile extension: {e}");
                    }
                }
                Err(e) => log::warn!("No independent audio handle for tile extension: {e}"),
            }
        }
        Ok(())
    }

    /// Rebuild the display from the tile or the original render if either
    /// covers the viewport.
    pub fn reload(&mut self) -> Reload {
        let params = self.session.params;
        let time = self.viewport.time_range();
        let band = self.viewport.frequency_band();

        let tile_usable = match (self.session.policy, self.tiles.coverage()) {
            (CachePolicy::Short, Some(_)) => true,
            (CachePolicy::Long, Some((range, _))) => range.contains(&time),
            (_, None) => false,
        };
        if tile_usable {
            let viewport = &self.viewport;
            if let Some(image) = self.tiles.borrow_tile(&params, |tile| viewport.display(tile)) {
                self.display = Some(image);
                self.needs_render = false;
                return Reload::Cropped;
            }
        }

        if let Some(original) = &self.original {
            let covers_band = original.low_hz <= band.low_hz as f64 && original.high_hz >= band.high_hz as f64;
            if original.time.contains(&time) && covers_band {
                self.display = Some(self.viewport.display(original));
                self.needs_render = false;
                return Reload::Cropped;
            }
        }

        self.needs_render = true;
        Reload::RenderRequired
    }

    fn after_move(&mut self, changed: bool) -> Reload {
        if changed || self.display.is_none() {
            self.reload()
        } else {
            Reload::Cropped
        }
    }

    pub fn zoom_in_time(&mut self) -> Reload {
        let changed = self.viewport.zoom_in_time();
        self.after_move(changed)
    }

    pub fn zoom_out_time(&mut self) -> Reload {
        let changed = self.viewport.zoom_out_time();
        self.after_move(changed)
    }

    pub fn zoom_reset_time(&mut self) -> Reload {
        let changed = self.viewport.reset_time();
        self.after_move(changed)
    }

    pub fn zoom_in_frequency(&mut self) -> Reload {
        let changed = self.viewport.zoom_in_frequency();
        self.after_move(changed)
    }

    pub fn zoom_out_frequency(&mut self) -> Reload {
        let changed = self.viewport.zoom_out_frequency();
        self.after_move(changed)
    }

    pub fn zoom_reset_frequency(&mut self) -> Reload {
        let changed = self.viewport.reset_frequency();
        self.after_move(changed)
    }

    pub fn select_time_range(&mut self, start_ms: u32, end_ms: u32) -> Result<Reload> {
        self.viewport.select_time_range(start_ms, end_ms)?;
        Ok(self.reload())
    }

    pub fn select_frequency_range(&mut self, low_hz: u32, high_hz: u32) -> Result<Reload> {
        self.viewport.select_frequency_range(low_hz, high_hz)?;
        Ok(self.reload())
    }

    /// Zoom to the rectangle between two display-pixel corners.
    pub fn select_zoom_region(&mut self, from: (u32, u32), to: (u32, u32)) -> Result<Reload> {
        self.viewport.select_zoom_region(from, to)?;
        Ok(self.reload())
    }

    pub fn export_display(&self, path: &Path) -> Result<()> {
        let display = self.display.as_ref().ok_or(SpectrogramError::NotRendered)?;
        export_raster(display, path)
    }

    /// Write the last full-resolution render.
    pub fn export_raster(&self, path: &Path) -> Result<()> {
        let original = self.original.as_ref().ok_or(SpectrogramError::NotRendered)?;
        export_raster(&original.image, path)
    }

    /// Loudest level of each frequency bin over `range`, at the reference
    /// extraction FFT size. With a band, only bins within one bin width of
    /// it are returned.
    pub fn extract_power_spectrum(
        &mut self,
        range: TimeRange,
        band: Option<FrequencyBand>,
    ) -> Result<Vec<PowerSpectrumValue>> {
        let request = RenderRequest::new(range, RenderKind::Extraction);
        let frames = Renderer::new(&self.session).compute_frames(self.audio.as_mut(), &request)?;
        Ok(peak_spectrum(&frames, self.audio.maximum_frequency() as f64, band))
    }

    /// Hand the amplitudes of `range` to an external cepstral extractor.
    pub fn extract_cepstral_features(
        &mut self,
        extractor: &impl CepstralExtractor,
        range: TimeRange,
    ) -> Result<CepstralFeatures> {
        let start = self.audio.sample_index_at_time(range.start_ms);
        let end = self.audio.sample_index_at_time(range.end_ms);
        let amplitudes = self.audio.amplitudes_in_range(self.session.channel, start, end)?;
        if amplitudes.is_empty() {
            return Err(SpectrogramError::NoAudioData {
                start_ms: range.start_ms,
                end_ms: range.end_ms,
            });
        }
        Ok(extractor.extract(&amplitudes, self.audio.sample_rate()))
    }

    /// Block until background tile extension has finished.
    pub fn wait_for_tiles(&mut self) {
        self.tiles.wait();
        // Pick up the grown tile
        if self.display.is_some() {
            self.reload();
        }
    }

    /// Stop background work. Already persisted segments are kept.
    pub fn close(&mut self) {
        self.tiles.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySource;
    use crate::types::WindowFunction;
    use std::f64::consts::PI;

    fn chirp(sample_rate: u32, ms: u32) -> MemorySource {
        let n = (sample_rate as u64 * ms as u64 / 1000) as usize;
        let samples = (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                12_000.0 * (2.0 * PI * (200.0 + 20.0 * t) * t).sin()
            })
            .collect();
        MemorySource::mono("chirp", sample_rate, 16, samples).unwrap()
    }

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            cache_dir: dir.to_path_buf(),
            parameters: RenderParameters::new(256, 50, WindowFunction::Hann).unwrap(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_short_recording_renders_one_complete_tile() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 10_000)), &config(dir.path()), 400, 100).unwrap();
        assert_eq!(s.policy(), CachePolicy::Short);

        let display = s.render().unwrap();
        assert_eq!(display.dimensions(), (400, 100));
        assert_eq!(s.tile_coverage(), Some((TimeRange::new(0, 10_000), true)));
        assert_eq!(s.original().unwrap().width(), 625);
        assert!(!s.needs_render());
    }

    #[test]
    fn test_short_zoom_is_served_from_tile() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 10_000)), &config(dir.path()), 400, 100).unwrap();
        s.render().unwrap();
        assert_eq!(s.zoom_in_time(), Reload::Cropped);
        assert_eq!(s.select_frequency_range(500, 1500).unwrap(), Reload::Cropped);
        assert_eq!(s.zoom_out_frequency(), Reload::Cropped);
        assert_eq!(s.display().unwrap().dimensions(), (400, 100));
    }

    #[test]
    fn test_crop_matches_direct_render_width() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 10_000)), &config(dir.path()), 400, 100).unwrap();
        s.render().unwrap();
        let full = s.original().unwrap().clone();

        let sub = TimeRange::new(2_000, 6_000);
        let region = crate::canvas::viewport::crop_region(&full, sub, FrequencyBand::new(0, 4000));
        let mut audio = chirp(8000, 10_000);
        let direct = Renderer::new(s.session())
            .render(&mut audio, &RenderRequest::new(sub, RenderKind::Standard))
            .unwrap();
        assert!(region.width.abs_diff(direct.width()) <= 1, "{} vs {}", region.width, direct.width());
    }

    #[test]
    fn test_parameter_change_forces_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 10_000)), &config(dir.path()), 400, 100).unwrap();
        s.render().unwrap();

        let changed = RenderParameters::new(256, 50, WindowFunction::Hamming).unwrap();
        s.set_parameters(changed).unwrap();
        assert!(s.needs_render());
        assert!(s.display().is_none());
        assert_eq!(s.zoom_in_time(), Reload::RenderRequired);

        s.render().unwrap();
        let record = s.tiles.record(&changed).unwrap();
        assert!(record.path.ends_with("chirp-256-50-Hamming.png"));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 1_000)), &config(dir.path()), 400, 100).unwrap();
        let bad = RenderParameters { fft_sample_size: 300, ..s.parameters() };
        assert!(s.set_parameters(bad).is_err());
        assert_eq!(s.parameters().fft_sample_size, 256);
    }

    #[test]
    fn test_export_requires_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 1_000)), &config(dir.path()), 200, 80).unwrap();
        let out = dir.path().join("out").join("display.png");
        assert!(matches!(s.export_display(&out), Err(SpectrogramError::NotRendered)));

        s.render().unwrap();
        s.export_display(&out).unwrap();
        s.export_raster(&dir.path().join("raster.png")).unwrap();
        assert_eq!(image::open(&out).unwrap().width(), 200);
    }

    #[test]
    fn test_power_spectrum_peaks_at_tone() {
        let dir = tempfile::tempdir().unwrap();
        let n = 8000;
        let samples = (0..n).map(|i| 16_000.0 * (2.0 * PI * 1000.0 * i as f64 / 8000.0).sin()).collect();
        let audio = MemorySource::mono("tone", 8000, 16, samples).unwrap();
        let mut s = Spectrogram::new(Box::new(audio), &config(dir.path()), 200, 80).unwrap();

        let values = s
            .extract_power_spectrum(TimeRange::new(0, 1000), Some(FrequencyBand::new(500, 1500)))
            .unwrap();
        assert!(values.windows(2).all(|w| w[0].frequency_hz < w[1].frequency_hz));
        assert!(values.first().unwrap().frequency_hz >= 500.0 - 7.8125);
        assert!(values.last().unwrap().frequency_hz <= 1500.0 + 7.8125);

        let loudest = values.iter().max_by(|a, b| a.max_db.total_cmp(&b.max_db)).unwrap();
        assert!((loudest.frequency_hz - 1000.0).abs() <= 15.625, "peak at {}", loudest.frequency_hz);
    }

    #[test]
    fn test_cepstral_extractor_receives_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Spectrogram::new(Box::new(chirp(8000, 2_000)), &config(dir.path()), 200, 80).unwrap();
        let extractor = |amplitudes: &[f64], sample_rate: u32| CepstralFeatures {
            coefficients: vec![vec![amplitudes.len() as f64, sample_rate as f64]],
            ..CepstralFeatures::default()
        };
        let features = s.extract_cepstral_features(&extractor, TimeRange::new(500, 1500)).unwrap();
        assert_eq!(features.coefficients[0], vec![8000.0, 8000.0]);
        assert!(s.extract_cepstral_features(&extractor, TimeRange::new(3000, 4000)).is_err());
    }
}
