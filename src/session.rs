use crate::config::EngineConfig;
use crate::types::RenderParameters;

/// Tile caching strategy, decided once from the recording's duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// The whole recording is rendered eagerly as one tile.
    Short,
    /// Tiles are generated incrementally in the background.
    Long,
}

impl CachePolicy {
    pub fn for_duration(total_time_ms: u32, short_threshold_ms: u32) -> Self {
        if total_time_ms <= short_threshold_ms {
            CachePolicy::Short
        } else {
            CachePolicy::Long
        }
    }
}

/// Everything a render depends on besides the audio itself.
///
/// Passed by reference into the renderer and the tile cache instead of
/// living as loose fields on the controller. A copy travels with each
/// background job, so later edits never leak into work already in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSession {
    pub params: RenderParameters,
    pub channel: usize,
    pub panel_width: u32,
    pub panel_height: u32,
    pub policy: CachePolicy,
    pub extraction_fft_size: usize,
    pub ms_per_pixel_step: f64,
    pub max_frame_adjustments: u32,
}

impl RenderSession {
    pub fn new(config: &EngineConfig, total_time_ms: u32, panel_width: u32, panel_height: u32) -> Self {
        Self {
            params: config.parameters,
            channel: config.channel,
            panel_width,
            panel_height,
            policy: CachePolicy::for_duration(total_time_ms, config.short_tile_threshold_ms),
            extraction_fft_size: config.extraction_fft_size,
            ms_per_pixel_step: config.ms_per_pixel_step,
            max_frame_adjustments: config.max_frame_adjustments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_threshold_is_inclusive() {
        assert_eq!(CachePolicy::for_duration(60_000, 60_000), CachePolicy::Short);
        assert_eq!(CachePolicy::for_duration(60_001, 60_000), CachePolicy::Long);
        assert_eq!(CachePolicy::for_duration(90_000, 60_000), CachePolicy::Long);
    }
}
