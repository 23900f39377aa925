//! Spectral Frame Computer: one frame of raw samples in, one column of dB
//! intensities out.

use crate::dsp::fft::compute_spectrum;
use crate::error::Result;
use crate::types::RenderParameters;

/// Floor applied to zero power so silence maps to a finite value.
pub const DB_FLOOR: f64 = -200.0;

/// Stateless per-frame spectrum computation. Cheap to copy into worker tasks.
#[derive(Clone, Copy, Debug)]
pub struct FrameComputer {
    params: RenderParameters,
    full_scale: f64,
}

impl FrameComputer {
    /// `full_scale` is the amplitude that maps to 1.0 (e.g. 32768 for 16-bit audio).
    pub fn new(params: RenderParameters, full_scale: f64) -> Self {
        Self {
            params,
            full_scale: if full_scale > 0.0 { full_scale } else { 1.0 },
        }
    }

    pub fn bin_count(&self) -> usize {
        self.params.bin_count()
    }

    /// Intensities in dB for one frame.
    ///
    /// The caller supplies at least `fft_sample_size` samples. A longer frame is
    /// split into consecutive FFT blocks whose power spectra are averaged.
    pub fn compute(&self, samples: &[f64]) -> Result<Vec<f64>> {
        let fft_size = self.params.fft_sample_size;
        debug_assert!(samples.len() >= fft_size);

        let mut block = vec![0.0f64; fft_size];
        let mut power = vec![0.0f64; self.bin_count()];
        let mut blocks = 0usize;

        for chunk in samples.chunks_exact(fft_size) {
            for (dst, &s) in block.iter_mut().zip(chunk) {
                *dst = s / self.full_scale;
            }
            let spectrum = compute_spectrum(&block, self.params.window_function)?;
            for (acc, p) in power.iter_mut().zip(spectrum) {
                *acc += p;
            }
            blocks += 1;
        }

        let blocks = blocks.max(1) as f64;
        Ok(power.into_iter().map(|p| power_to_db(p / blocks)).collect())
    }
}

pub fn power_to_db(power: f64) -> f64 {
    if power > 0.0 {
        (10.0 * power.log10()).max(DB_FLOOR)
    } else {
        DB_FLOOR
    }
}
