use crate::error::{Result, SpectrogramError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tapering window applied to each FFT block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowFunction {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
    Bartlett,
}

impl WindowFunction {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rectangular" | "rect" | "none" => Some(Self::Rectangular),
            "hann" | "hanning" => Some(Self::Hann),
            "hamming" => Some(Self::Hamming),
            "blackman" => Some(Self::Blackman),
            "bartlett" | "triangular" => Some(Self::Bartlett),
            _ => None,
        }
    }
}

impl fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rectangular => "Rectangular",
            Self::Hann => "Hann",
            Self::Hamming => "Hamming",
            Self::Blackman => "Blackman",
            Self::Bartlett => "Bartlett",
        };
        f.write_str(name)
    }
}

/// FFT configuration for one render. Any change invalidates cached rasters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderParameters {
    pub fft_sample_size: usize,
    pub overlap_percent: u32,
    pub window_function: WindowFunction,
}

impl RenderParameters {
    pub fn new(fft_sample_size: usize, overlap_percent: u32, window_function: WindowFunction) -> Result<Self> {
        let params = Self { fft_sample_size, overlap_percent, window_function };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fft_sample_size < 16 || !self.fft_sample_size.is_power_of_two() {
            return Err(SpectrogramError::InvalidParameters(format!(
                "fft sample size {} is not a power of two >= 16",
                self.fft_sample_size
            )));
        }
        if self.overlap_percent >= 100 {
            return Err(SpectrogramError::InvalidParameters(format!(
                "overlap {}% must be in [0, 100)",
                self.overlap_percent
            )));
        }
        Ok(())
    }

    /// Number of frequency bins produced per frame.
    pub fn bin_count(&self) -> usize {
        self.fft_sample_size / 2
    }

    /// Same parameters with a different FFT size (used by extraction renders).
    pub fn with_fft_size(&self, fft_sample_size: usize) -> Self {
        Self { fft_sample_size, ..*self }
    }
}

impl Default for RenderParameters {
    fn default() -> Self {
        Self {
            fft_sample_size: 1024,
            overlap_percent: 50,
            window_function: WindowFunction::Hann,
        }
    }
}

/// What a render is for. Governs overlap handling, adaptive frame sizing,
/// frequency filtering and worker headroom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderKind {
    /// Interactive render of the visible window; frames may be widened to fit the panel.
    Standard,
    /// Background tile segment at nominal resolution, all bins.
    Tile,
    /// Data extraction at the reference FFT size, always overlapping.
    Extraction,
}

/// Millisecond range `[start_ms, end_ms]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: u32,
    pub end_ms: u32,
}

impl TimeRange {
    pub fn new(start_ms: u32, end_ms: u32) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, other: &TimeRange) -> bool {
        other.start_ms >= self.start_ms && other.end_ms <= self.end_ms
    }
}

/// Frequency range in Hz.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub low_hz: u32,
    pub high_hz: u32,
}

impl FrequencyBand {
    pub fn new(low_hz: u32, high_hz: u32) -> Self {
        Self { low_hz, high_hz }
    }
}

/// One worker's output: the dB intensities of the frame starting at `chunk_start`.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameIntensities {
    pub chunk_start: usize,
    pub bins: Vec<f64>,
}

/// Peak intensity of one frequency bin over an extraction range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerSpectrumValue {
    pub frequency_hz: f64,
    pub max_db: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(RenderParameters::new(1000, 50, WindowFunction::Hann).is_err());
        assert!(RenderParameters::new(1024, 100, WindowFunction::Hann).is_err());
        assert!(RenderParameters::new(1024, 0, WindowFunction::Hann).is_ok());
    }

    #[test]
    fn test_window_names_round_trip_through_display() {
        for w in [
            WindowFunction::Rectangular,
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::Blackman,
            WindowFunction::Bartlett,
        ] {
            assert_eq!(WindowFunction::parse(&w.to_string()), Some(w));
        }
    }

    #[test]
    fn test_range_containment() {
        let tile = TimeRange::new(0, 60_000);
        assert!(tile.contains(&TimeRange::new(1_000, 60_000)));
        assert!(!tile.contains(&TimeRange::new(59_000, 60_001)));
    }
}
