//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the keys it changes.

use crate::error::{Result, SpectrogramError};
use crate::types::RenderParameters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the tile cache directory.
pub const CACHE_DIR_ENV: &str = "SONOTILE_CACHE_DIR";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding tile PNGs and `registry.json`.
    pub cache_dir: PathBuf,
    /// Recordings at most this long are cached as a single eagerly rendered tile.
    pub short_tile_threshold_ms: u32,
    /// Length of each background tile segment.
    pub tile_segment_ms: u32,
    pub zoom_rate_percent: u32,
    /// FFT size used by extraction renders regardless of the active parameters.
    pub extraction_fft_size: usize,
    /// Increment applied to ms-per-pixel while shrinking a render to the panel width.
    pub ms_per_pixel_step: f64,
    /// Upper bound on adaptive frame-size iterations.
    pub max_frame_adjustments: u32,
    pub channel: usize,
    pub parameters: RenderParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("sonotile-cache"),
            short_tile_threshold_ms: 60_000,
            tile_segment_ms: 60_000,
            zoom_rate_percent: 25,
            extraction_fft_size: 1024,
            ms_per_pixel_step: 0.05,
            max_frame_adjustments: 100_000,
            channel: 0,
            parameters: RenderParameters::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, with the cache directory taken from `SONOTILE_CACHE_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        self.parameters.validate()?;
        if self.tile_segment_ms == 0 {
            return Err(SpectrogramError::InvalidConfig("tile_segment_ms must be > 0".into()));
        }
        if self.zoom_rate_percent == 0 || self.zoom_rate_percent >= 100 {
            return Err(SpectrogramError::InvalidConfig(format!(
                "zoom_rate_percent {} must be in 1..100",
                self.zoom_rate_percent
            )));
        }
        if !(self.ms_per_pixel_step > 0.0) {
            return Err(SpectrogramError::InvalidConfig("ms_per_pixel_step must be positive".into()));
        }
        if self.extraction_fft_size < 16 || !self.extraction_fft_size.is_power_of_two() {
            return Err(SpectrogramError::InvalidConfig(format!(
                "extraction_fft_size {} is not a power of two >= 16",
                self.extraction_fft_size
            )));
        }
        Ok(())
    }
}
