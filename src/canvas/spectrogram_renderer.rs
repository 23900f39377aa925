//! Renderer: turns a time range of audio into a colour-mapped raster.
//!
//! The range is cut into frames, each frame is handed to a bounded worker
//! pool, and once every worker is done the sorted intensities are painted
//! column by column. Frequency runs upward: row 0 is the highest bin.

use crate::audio::AudioSource;
use crate::canvas::collector::IntensityCollector;
use crate::canvas::colors::decibel_to_rgb;
use crate::canvas::raster::Raster;
use crate::dsp::frame::FrameComputer;
use crate::error::{Result, SpectrogramError};
use crate::session::{CachePolicy, RenderSession};
use crate::types::{FrameIntensities, FrequencyBand, PowerSpectrumValue, RenderKind, RenderParameters, TimeRange};
use image::{Rgb, RgbImage};

/// How consecutive frames relate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stepping {
    /// Next frame starts where the previous one ended.
    Contiguous,
    /// Next frame repeats `frame_size - frame_shift` samples of the previous one.
    Overlapping,
}

/// Frame geometry for one render.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FramePlan {
    pub ms_per_pixel: f64,
    pub frame_size: usize,
    pub frame_shift: usize,
    pub stepping: Stepping,
    total_samples: usize,
    total_ms: u32,
    overlap_percent: u32,
}

/// Nominal milliseconds covered by one column at the given FFT size.
pub fn ms_per_pixel(fft_sample_size: usize, sample_rate: u32) -> f64 {
    fft_sample_size as f64 * 1000.0 / sample_rate.max(1) as f64
}

impl FramePlan {
    pub fn new(
        ms_per_pixel: f64,
        total_samples: usize,
        total_ms: u32,
        overlap_percent: u32,
        stepping: Stepping,
    ) -> Self {
        let frame_size = if total_ms == 0 {
            1
        } else {
            ((total_samples as f64 / (total_ms as f64 / ms_per_pixel)) as usize).max(1)
        };
        let frame_shift = (frame_size as f64 * (1.0 - overlap_percent as f64 / 100.0)).floor() as usize;
        Self {
            ms_per_pixel,
            frame_size,
            frame_shift,
            stepping,
            total_samples,
            total_ms,
            overlap_percent,
        }
    }

    /// Same plan with a different time resolution.
    pub fn with_ms_per_pixel(&self, ms_per_pixel: f64) -> Self {
        Self::new(ms_per_pixel, self.total_samples, self.total_ms, self.overlap_percent, self.stepping)
    }

    /// Samples repeated from the previous frame in overlapping mode.
    pub fn overlap_back(&self) -> usize {
        self.frame_size - self.frame_shift.min(self.frame_size)
    }

    /// Distance between consecutive frame starts (never 0).
    pub fn step(&self) -> usize {
        match self.stepping {
            Stepping::Contiguous => self.frame_size,
            Stepping::Overlapping => self.frame_size - self.overlap_back(),
        }
        .max(1)
    }

    /// Time resolution at which `samples` samples step through `columns`
    /// frames. Frame sizes round down, so the result can still leave a
    /// column or two too many.
    pub fn ms_per_pixel_for_columns(&self, samples: usize, columns: usize) -> f64 {
        let kept = match self.stepping {
            Stepping::Contiguous => 1.0,
            Stepping::Overlapping => 1.0 - self.overlap_percent as f64 / 100.0,
        };
        let frame_size = samples as f64 / columns.max(1) as f64 / kept;
        frame_size * self.total_ms as f64 / self.total_samples.max(1) as f64
    }

    /// Frames emitted for samples `start..end`: every start below `end`
    /// (at least one) that is still inside the audio.
    pub fn column_count(&self, start: usize, end: usize) -> usize {
        if start >= self.total_samples {
            return 0;
        }
        let end = end.min(self.total_samples);
        if end <= start {
            return 1;
        }
        (end - start - 1) / self.step() + 1
    }

    /// `(first_sample, last_sample)` of every frame, last inclusive.
    pub fn windows(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let count = self.column_count(start, end);
        let mut windows = Vec::with_capacity(count);
        let mut first = start;
        let mut last = first + self.frame_size - 1;
        while windows.len() < count {
            windows.push((first, last));
            match self.stepping {
                Stepping::Contiguous => {
                    first += self.frame_size;
                    last += self.frame_size;
                }
                Stepping::Overlapping => {
                    first = (last + 1 - self.overlap_back()).max(first + 1);
                    last = first + self.frame_size - 1;
                }
            }
        }
        windows
    }
}

/// What to render.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderRequest {
    pub range: TimeRange,
    pub kind: RenderKind,
    /// Sub-band to keep. Honoured by `Standard` renders only.
    pub band: Option<FrequencyBand>,
}

impl RenderRequest {
    pub fn new(range: TimeRange, kind: RenderKind) -> Self {
        Self { range, kind, band: None }
    }

    pub fn with_band(mut self, band: FrequencyBand) -> Self {
        self.band = Some(band);
        self
    }
}

pub struct Renderer<'a> {
    session: &'a RenderSession,
}

impl<'a> Renderer<'a> {
    pub fn new(session: &'a RenderSession) -> Self {
        Self { session }
    }

    /// Parameters actually used for `kind`: extraction swaps in the reference FFT size.
    pub fn effective_params(&self, kind: RenderKind) -> RenderParameters {
        match kind {
            RenderKind::Extraction => self.session.params.with_fft_size(self.session.extraction_fft_size),
            RenderKind::Standard | RenderKind::Tile => self.session.params,
        }
    }

    /// Worker threads for a render of `kind`; one fewer off the interactive path.
    pub fn worker_count(kind: RenderKind) -> usize {
        let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        if kind != RenderKind::Standard && available > 1 {
            available - 1
        } else {
            available
        }
    }

    /// Frame plan for a range, including the panel-fit adjustment.
    pub fn plan(&self, audio: &dyn AudioSource, request: &RenderRequest) -> FramePlan {
        let params = self.effective_params(request.kind);
        let stepping = match request.kind {
            RenderKind::Extraction => Stepping::Overlapping,
            _ if params.overlap_percent == 0 => Stepping::Contiguous,
            _ => Stepping::Overlapping,
        };
        let plan = FramePlan::new(
            ms_per_pixel(params.fft_sample_size, audio.sample_rate()),
            audio.num_samples(),
            audio.total_time_ms(),
            params.overlap_percent,
            stepping,
        );

        if request.kind == RenderKind::Standard && self.session.policy == CachePolicy::Long {
            let start = audio.sample_index_at_time(request.range.start_ms);
            let end = audio.sample_index_at_time(request.range.end_ms);
            self.fit_to_panel(plan, start, end)
        } else {
            plan
        }
    }

    /// Widen frames until the column count fits the panel width, so a long
    /// range is never downscaled after the fact. Jumps straight to the
    /// closed-form resolution, then steps up past frame size rounding.
    fn fit_to_panel(&self, mut plan: FramePlan, start: usize, end: usize) -> FramePlan {
        let panel_width = self.session.panel_width.max(1) as usize;
        let initial_frame = plan.frame_size;
        if plan.column_count(start, end) > panel_width {
            let lower = plan.ms_per_pixel_for_columns(end.saturating_sub(start), panel_width);
            if lower > plan.ms_per_pixel {
                plan = plan.with_ms_per_pixel(lower);
            }
        }
        let mut iterations = 0u32;
        while plan.column_count(start, end) > panel_width {
            if iterations >= self.session.max_frame_adjustments {
                log::warn!(
                    "Frame size adjustment stopped after {iterations} steps at {} columns (panel {panel_width})",
                    plan.column_count(start, end)
                );
                break;
            }
            plan = plan.with_ms_per_pixel(plan.ms_per_pixel + self.session.ms_per_pixel_step);
            iterations += 1;
        }
        if plan.frame_size != initial_frame {
            log::debug!(
                "Frame size {} -> {} ({:.2} ms/px) to fit {panel_width} px",
                initial_frame,
                plan.frame_size,
                plan.ms_per_pixel
            );
        }
        plan
    }

    /// Compute every frame of the request in parallel and return them in
    /// column order. Blocks until all workers are done; any failed frame
    /// fails the whole render.
    pub fn compute_frames(&self, audio: &mut dyn AudioSource, request: &RenderRequest) -> Result<Vec<FrameIntensities>> {
        let params = self.effective_params(request.kind);
        let plan = self.plan(audio, request);
        let start = audio.sample_index_at_time(request.range.start_ms);
        let end = audio.sample_index_at_time(request.range.end_ms);
        let windows = plan.windows(start, end);
        if windows.is_empty() {
            return Err(SpectrogramError::NoAudioData {
                start_ms: request.range.start_ms,
                end_ms: request.range.end_ms,
            });
        }

        let workers = Self::worker_count(request.kind);
        log::debug!(
            "Rendering {:?} {}..{} ms: frame {} shift {}, {} columns, {} workers",
            request.kind,
            request.range.start_ms,
            request.range.end_ms,
            plan.frame_size,
            plan.frame_shift,
            windows.len(),
            workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sonotile-frame-{i}"))
            .build()
            .map_err(|e| SpectrogramError::WorkerPool(e.to_string()))?;

        let computer = FrameComputer::new(params, audio.full_scale());
        let read_len = plan.frame_size.max(params.fft_sample_size);
        let channel = self.session.channel;
        let collector = IntensityCollector::with_capacity(windows.len());

        audio.ensure_chunk_loaded(start)?;

        pool.scope(|scope| {
            let collector = &collector;
            for &(chunk_start, _) in &windows {
                if collector.has_failed() {
                    break;
                }
                // Samples are read here, on one thread, so workers never touch the source.
                let mut samples = match audio.amplitudes_in_range(channel, chunk_start, chunk_start + read_len) {
                    Ok(samples) if !samples.is_empty() => samples,
                    Ok(_) => {
                        collector.fail(SpectrogramError::FrameFailed {
                            chunk_start,
                            reason: "no samples available".into(),
                        });
                        break;
                    }
                    Err(e) => {
                        collector.fail(e);
                        break;
                    }
                };
                // Boundary frame: pad past the end of audio.
                samples.resize(read_len, 0.0);

                scope.spawn(move |_| match computer.compute(&samples) {
                    Ok(bins) => collector.push(FrameIntensities { chunk_start, bins }),
                    Err(e) => collector.fail(SpectrogramError::FrameFailed {
                        chunk_start,
                        reason: e.to_string(),
                    }),
                });
            }
        });

        collector.into_sorted()
    }

    /// Render a request into a raster.
    pub fn render(&self, audio: &mut dyn AudioSource, request: &RenderRequest) -> Result<Raster> {
        let frames = self.compute_frames(audio, request)?;
        let params = self.effective_params(request.kind);
        let max_freq = audio.maximum_frequency() as f64;
        let total_bins = params.bin_count();
        let band = match request.kind {
            RenderKind::Standard => request.band,
            RenderKind::Tile | RenderKind::Extraction => None,
        };
        let (initial_frame, final_frame) = frequency_frames(total_bins, max_freq, band);
        let bin_width = max_freq / total_bins as f64;

        Ok(Raster::new(
            pre_render(&frames, initial_frame, final_frame),
            request.range,
            initial_frame as f64 * bin_width,
            final_frame as f64 * bin_width,
        ))
    }
}

/// Bin rows `[initial, final)` kept for an optional sub-band.
pub fn frequency_frames(total_bins: usize, maximum_frequency: f64, band: Option<FrequencyBand>) -> (usize, usize) {
    let Some(band) = band else {
        return (0, total_bins);
    };
    if total_bins == 0 {
        return (0, 0);
    }
    let bin_width = maximum_frequency / total_bins as f64;
    let initial = ((band.low_hz as f64 / bin_width).floor() as usize).min(total_bins - 1);
    let fin = (1..=total_bins)
        .find(|&k| k as f64 * bin_width >= band.high_hz as f64)
        .unwrap_or(total_bins);
    (initial, fin.max(initial + 1))
}

/// Paint sorted frames into an RGB image: one column per frame, bins
/// `initial..final` flipped so the highest kept bin lands on row 0.
pub fn pre_render(frames: &[FrameIntensities], initial_frame: usize, final_frame: usize) -> RgbImage {
    let width = frames.len() as u32;
    let height = final_frame.saturating_sub(initial_frame) as u32;
    let mut image = RgbImage::new(width, height);
    for (x, frame) in frames.iter().enumerate() {
        for bin in initial_frame..final_frame {
            let db = frame.bins.get(bin).copied().unwrap_or(f64::NEG_INFINITY);
            let y = (final_frame - bin - 1) as u32;
            image.put_pixel(x as u32, y, Rgb(decibel_to_rgb(db)));
        }
    }
    image
}

/// Loudest value of each bin across `frames`, ascending by frequency, kept
/// only within one bin width of `band`.
pub fn peak_spectrum(
    frames: &[FrameIntensities],
    maximum_frequency: f64,
    band: Option<FrequencyBand>,
) -> Vec<PowerSpectrumValue> {
    let Some(bins) = frames.first().map(|f| f.bins.len()) else {
        return Vec::new();
    };
    if bins == 0 {
        return Vec::new();
    }
    let bin_width = maximum_frequency / bins as f64;

    (0..bins)
        .map(|i| PowerSpectrumValue {
            frequency_hz: (i + 1) as f64 * bin_width,
            max_db: frames
                .iter()
                .filter_map(|f| f.bins.get(i).copied())
                .fold(f64::NEG_INFINITY, f64::max),
        })
        .filter(|v| match band {
            Some(band) => {
                v.frequency_hz >= band.low_hz as f64 - bin_width && v.frequency_hz <= band.high_hz as f64 + bin_width
            }
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySource;
    use crate::config::EngineConfig;
    use crate::types::WindowFunction;
    use std::f64::consts::PI;

    fn tone(sample_rate: u32, ms: u32, freq: f64) -> MemorySource {
        let n = (sample_rate as u64 * ms as u64 / 1000) as usize;
        let samples = (0..n)
            .map(|i| 16000.0 * (2.0 * PI * freq * i as f64 / sample_rate as f64).sin())
            .collect();
        MemorySource::mono("tone", sample_rate, 16, samples).unwrap()
    }

    fn session(params: RenderParameters, total_ms: u32, panel_width: u32) -> RenderSession {
        let config = EngineConfig { parameters: params, ..EngineConfig::default() };
        RenderSession::new(&config, total_ms, panel_width, 200)
    }

    /// Silence of any length without the memory; reads from `fail_from` on error.
    #[derive(Clone)]
    struct StubSource {
        sample_rate: u32,
        num_samples: usize,
        fail_from: usize,
    }

    impl AudioSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        fn total_time_ms(&self) -> u32 {
            (self.num_samples as u64 * 1000 / self.sample_rate as u64) as u32
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn bits_per_sample(&self) -> u16 {
            16
        }

        fn num_samples(&self) -> usize {
            self.num_samples
        }

        fn amplitudes_in_range(&mut self, _channel: usize, start: usize, end: usize) -> Result<Vec<f64>> {
            if start >= self.fail_from {
                return Err(SpectrogramError::Audio(format!("read error at sample {start}")));
            }
            Ok(vec![0.0; end.min(self.num_samples).saturating_sub(start)])
        }

        fn try_clone(&self) -> Result<Box<dyn AudioSource>> {
            Ok(Box::new(self.clone()))
        }
    }

    #[test]
    fn test_nominal_frame_equals_fft_size() {
        let plan = FramePlan::new(ms_per_pixel(256, 8000), 80_000, 10_000, 50, Stepping::Overlapping);
        assert_eq!(plan.frame_size, 256);
        assert_eq!(plan.frame_shift, 128);
        assert_eq!(plan.step(), 128);
        assert_eq!(plan.column_count(0, 80_000), 625);
    }

    #[test]
    fn test_windows_agree_with_column_count() {
        for (overlap, stepping) in [(0, Stepping::Contiguous), (50, Stepping::Overlapping), (75, Stepping::Overlapping)] {
            let plan = FramePlan::new(ms_per_pixel(512, 8000), 80_000, 10_000, overlap, stepping);
            let windows = plan.windows(1000, 40_000);
            assert_eq!(windows.len(), plan.column_count(1000, 40_000));
            assert_eq!(windows[0], (1000, 1000 + plan.frame_size - 1));
            for pair in windows.windows(2) {
                // Overlapping frames repeat exactly `overlap_back` samples
                assert_eq!(pair[0].1 + 1 - pair[1].0, if overlap == 0 { 0 } else { plan.overlap_back() });
            }
        }
    }

    #[test]
    fn test_frames_never_start_past_the_audio() {
        let plan = FramePlan::new(ms_per_pixel(256, 8000), 1000, 125, 0, Stepping::Contiguous);
        assert_eq!(plan.column_count(1000, 1200), 0);
        assert_eq!(plan.column_count(900, 5000), 1);
        assert_eq!(plan.column_count(500, 500), 1);
    }

    #[test]
    fn test_standard_long_render_fits_panel() {
        let params = RenderParameters::new(256, 50, WindowFunction::Hann).unwrap();
        let mut audio = tone(8000, 70_000, 1000.0);
        let s = session(params, audio.total_time_ms(), 300);
        assert_eq!(s.policy, CachePolicy::Long);
        let renderer = Renderer::new(&s);

        let request = RenderRequest::new(TimeRange::new(0, 70_000), RenderKind::Standard);
        let raster = renderer.render(&mut audio, &request).unwrap();
        assert!(raster.width() <= 300, "width {}", raster.width());
        assert!(raster.width() > 250, "width {}", raster.width());
        assert_eq!(raster.height(), 128);

        // Tile renders keep nominal resolution
        let tile = renderer
            .render(&mut audio, &RenderRequest::new(TimeRange::new(0, 10_000), RenderKind::Tile))
            .unwrap();
        assert_eq!(tile.width(), 625);
    }

    #[test]
    fn test_fit_does_not_depend_on_adjustment_budget() {
        let params = RenderParameters::new(256, 50, WindowFunction::Hann).unwrap();
        let audio = StubSource { sample_rate: 8000, num_samples: 560_000, fail_from: usize::MAX };
        let mut s = session(params, audio.total_time_ms(), 300);
        s.max_frame_adjustments = 10;
        let request = RenderRequest::new(TimeRange::new(0, 70_000), RenderKind::Standard);

        let plan = Renderer::new(&s).plan(&audio, &request);
        assert_eq!(plan.column_count(0, 560_000), 300);
    }

    #[test]
    fn test_hours_long_view_fits_panel() {
        // 3 h at 44.1 kHz
        let audio = StubSource { sample_rate: 44_100, num_samples: 44_100 * 10_800, fail_from: usize::MAX };
        let s = session(RenderParameters::default(), audio.total_time_ms(), 1200);
        assert_eq!(s.policy, CachePolicy::Long);
        let request = RenderRequest::new(TimeRange::new(0, audio.total_time_ms()), RenderKind::Standard);

        let plan = Renderer::new(&s).plan(&audio, &request);
        let columns = plan.column_count(0, audio.num_samples);
        assert!(columns <= 1200, "columns {columns}");
        assert!(columns >= 1190, "columns {columns}");
    }

    #[test]
    fn test_source_error_midway_fails_whole_render() {
        let params = RenderParameters::new(256, 50, WindowFunction::Hann).unwrap();
        let mut audio = StubSource { sample_rate: 8000, num_samples: 80_000, fail_from: 40_000 };
        let s = session(params, audio.total_time_ms(), 1000);
        let renderer = Renderer::new(&s);

        let request = RenderRequest::new(TimeRange::new(0, 10_000), RenderKind::Tile);
        assert!(matches!(renderer.compute_frames(&mut audio, &request), Err(SpectrogramError::Audio(_))));
        assert!(matches!(renderer.render(&mut audio, &request), Err(SpectrogramError::Audio(_))));

        // The part before the failure renders on its own
        let before = RenderRequest::new(TimeRange::new(0, 4000), RenderKind::Tile);
        assert_eq!(renderer.render(&mut audio, &before).unwrap().width(), 250);
    }

    #[test]
    fn test_tone_lands_on_expected_row() {
        let params = RenderParameters::new(256, 0, WindowFunction::Hann).unwrap();
        let mut audio = tone(8000, 2000, 1000.0);
        let s = session(params, audio.total_time_ms(), 1000);
        let raster = Renderer::new(&s)
            .render(&mut audio, &RenderRequest::new(TimeRange::new(0, 2000), RenderKind::Standard))
            .unwrap();

        // 1000 Hz at 31.25 Hz per bin is bin 32; row = 128 - 32 - 1
        let column = 3;
        let darkest = (0..raster.height())
            .min_by_key(|&y| raster.image.get_pixel(column, y).0[0])
            .unwrap();
        assert_eq!(darkest, 95);
    }

    #[test]
    fn test_sub_band_limits_rows() {
        let params = RenderParameters::new(256, 50, WindowFunction::Hann).unwrap();
        let mut audio = tone(8000, 2000, 1000.0);
        let s = session(params, audio.total_time_ms(), 1000);
        let request = RenderRequest::new(TimeRange::new(0, 2000), RenderKind::Standard)
            .with_band(FrequencyBand::new(500, 2000));
        let raster = Renderer::new(&s).render(&mut audio, &request).unwrap();

        assert_eq!(raster.height(), 64 - 16);
        assert_eq!(raster.low_hz, 500.0);
        assert_eq!(raster.high_hz, 2000.0);

        // Tile renders ignore the band
        let tile_request = RenderRequest { kind: RenderKind::Tile, ..request };
        assert_eq!(Renderer::new(&s).render(&mut audio, &tile_request).unwrap().height(), 128);
    }

    #[test]
    fn test_render_past_end_reports_no_data() {
        let params = RenderParameters::new(256, 50, WindowFunction::Hann).unwrap();
        let mut audio = tone(8000, 1000, 500.0);
        let s = session(params, audio.total_time_ms(), 1000);
        let request = RenderRequest::new(TimeRange::new(5000, 6000), RenderKind::Tile);
        assert!(matches!(
            Renderer::new(&s).render(&mut audio, &request),
            Err(SpectrogramError::NoAudioData { .. })
        ));
    }

    #[test]
    fn test_peak_spectrum_filters_band() {
        let frames = vec![
            FrameIntensities { chunk_start: 0, bins: vec![-90.0, -10.0, -60.0, -80.0] },
            FrameIntensities { chunk_start: 64, bins: vec![-70.0, -20.0, -30.0, -95.0] },
        ];
        let all = peak_spectrum(&frames, 4000.0, None);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].frequency_hz, 1000.0);
        assert_eq!(all[0].max_db, -70.0);
        assert_eq!(all[2].max_db, -30.0);

        let band = peak_spectrum(&frames, 4000.0, Some(FrequencyBand::new(3000, 3000)));
        let freqs: Vec<f64> = band.iter().map(|v| v.frequency_hz).collect();
        assert_eq!(freqs, vec![2000.0, 3000.0, 4000.0]);
    }
}
