//! Error type shared by every rendering and caching operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpectrogramError {
    /// The audio source could not deliver samples.
    #[error("audio source error: {0}")]
    Audio(String),

    #[error("wav decode error: {0}")]
    Wav(#[from] hound::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Registry or config file could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid render parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// Nothing could be read for the requested range. The interactive path
    /// reports this instead of producing a blank raster.
    #[error("no audio data in range {start_ms}..{end_ms} ms")]
    NoAudioData { start_ms: u32, end_ms: u32 },

    /// A single frame task failed; the whole render is aborted.
    #[error("frame at sample {chunk_start} failed: {reason}")]
    FrameFailed { chunk_start: usize, reason: String },

    #[error("worker pool unavailable: {0}")]
    WorkerPool(String),

    #[error("nothing has been rendered yet")]
    NotRendered,
}

pub type Result<T> = std::result::Result<T, SpectrogramError>;
