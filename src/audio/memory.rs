use super::AudioSource;
use crate::error::{Result, SpectrogramError};
use std::sync::Arc;

/// Audio already decoded into memory. Clones share the sample buffers.
#[derive(Clone, Debug)]
pub struct MemorySource {
    name: String,
    sample_rate: u32,
    bits_per_sample: u16,
    channels: Arc<Vec<Vec<f64>>>,
}

impl MemorySource {
    /// `channels[c][i]` is sample `i` of channel `c`, in the integer scale of `bits_per_sample`.
    pub fn new(name: &str, sample_rate: u32, bits_per_sample: u16, channels: Vec<Vec<f64>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SpectrogramError::Audio("sample rate must be positive".into()));
        }
        if channels.is_empty() {
            return Err(SpectrogramError::Audio("at least one channel is required".into()));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(SpectrogramError::Audio("channels differ in length".into()));
        }
        Ok(Self {
            name: name.to_string(),
            sample_rate,
            bits_per_sample,
            channels: Arc::new(channels),
        })
    }

    pub fn mono(name: &str, sample_rate: u32, bits_per_sample: u16, samples: Vec<f64>) -> Result<Self> {
        Self::new(name, sample_rate, bits_per_sample, vec![samples])
    }
}

impl AudioSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn total_time_ms(&self) -> u32 {
        (self.num_samples() as u64 * 1000 / self.sample_rate as u64) as u32
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    fn num_samples(&self) -> usize {
        self.channels[0].len()
    }

    fn amplitudes_in_range(&mut self, channel: usize, start: usize, end: usize) -> Result<Vec<f64>> {
        let data = self
            .channels
            .get(channel)
            .ok_or_else(|| SpectrogramError::Audio(format!("no channel {channel}")))?;
        let end = end.min(data.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(data[start..end].to_vec())
    }

    fn try_clone(&self) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(self.clone()))
    }
}
