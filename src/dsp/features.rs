//! Hand-off point for cepstral (MFCC/PLP-style) feature extractors.
//!
//! Extractors live outside this crate; the engine only supplies the
//! amplitudes of a time range and passes the result through.

/// Per-frame coefficients with their per-coefficient statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CepstralFeatures {
    pub coefficients: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
    pub stddev: Vec<f64>,
}

pub trait CepstralExtractor {
    fn extract(&self, amplitudes: &[f64], sample_rate: u32) -> CepstralFeatures;
}

impl<F> CepstralExtractor for F
where
    F: Fn(&[f64], u32) -> CepstralFeatures,
{
    fn extract(&self, amplitudes: &[f64], sample_rate: u32) -> CepstralFeatures {
        self(amplitudes, sample_rate)
    }
}
