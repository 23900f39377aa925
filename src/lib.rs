//! Spectrogram rendering with a progressive on-disk tile cache.
//!
//! [`Spectrogram`] is the entry point: it renders the visible window of an
//! [`AudioSource`] through a bounded worker pool, keeps a PNG tile of the
//! whole recording growing in the background, and serves zoom and
//! selection changes by cropping whichever raster already covers them.

pub mod audio;
pub mod canvas;
pub mod config;
pub mod dsp;
pub mod error;
pub mod session;
pub mod spectrogram;
pub mod types;

pub use audio::{AudioSource, MemorySource, WavSource};
pub use canvas::raster::{export_raster, PixelRegion, Raster};
pub use canvas::spectrogram_renderer::{RenderRequest, Renderer};
pub use canvas::tile_cache::{CancellationToken, TileCacheManager, TileRecord, TileRegistry};
pub use canvas::viewport::Viewport;
pub use config::EngineConfig;
pub use dsp::features::{CepstralExtractor, CepstralFeatures};
pub use error::{Result, SpectrogramError};
pub use session::{CachePolicy, RenderSession};
pub use spectrogram::{Reload, Spectrogram};
pub use types::{
    FrameIntensities, FrequencyBand, PowerSpectrumValue, RenderKind, RenderParameters, TimeRange, WindowFunction,
};
