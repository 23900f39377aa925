//! Read-only access to decoded audio.
//!
//! The engine only borrows a source. Anything that reads concurrently with
//! the interactive path (background tile extension) works on its own
//! `try_clone()` so no two readers share a decode cursor.

pub mod memory;
pub mod wav;

pub use memory::MemorySource;
pub use wav::WavSource;

use crate::error::Result;

pub trait AudioSource: Send {
    /// Short display name, used in log messages and thread names.
    fn name(&self) -> &str;

    /// Identifies this recording in tile file names and registry keys.
    /// Two different recordings must not share a key, even when their
    /// names match.
    fn cache_key(&self) -> String {
        self.name().to_string()
    }

    fn total_time_ms(&self) -> u32;

    fn sample_rate(&self) -> u32;

    fn bits_per_sample(&self) -> u16;

    /// Samples per channel.
    fn num_samples(&self) -> usize;

    fn sample_index_at_time(&self, ms: u32) -> usize {
        let idx = ms as u64 * self.sample_rate() as u64 / 1000;
        (idx as usize).min(self.num_samples())
    }

    /// Amplitudes of `channel` for samples `start..end` (end exclusive), in the
    /// integer scale given by `bits_per_sample`. Truncated at the end of audio.
    fn amplitudes_in_range(&mut self, channel: usize, start: usize, end: usize) -> Result<Vec<f64>>;

    /// Hint that reads around `start` are imminent.
    fn ensure_chunk_loaded(&mut self, _start: usize) -> Result<()> {
        Ok(())
    }

    /// Independent accessor over the same audio.
    fn try_clone(&self) -> Result<Box<dyn AudioSource>>;

    /// Largest representable amplitude, used to normalise samples.
    fn full_scale(&self) -> f64 {
        (1u64 << (self.bits_per_sample().clamp(1, 63) - 1)) as f64
    }

    fn maximum_frequency(&self) -> u32 {
        self.sample_rate() / 2
    }
}
