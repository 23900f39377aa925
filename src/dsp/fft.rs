use crate::error::{Result, SpectrogramError};
use crate::types::WindowFunction;
use realfft::RealFftPlanner;
use std::cell::RefCell;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

thread_local! {
    static FFT_PLANNER: RefCell<RealFftPlanner<f64>> = RefCell::new(RealFftPlanner::new());
    static WINDOW_CACHE: RefCell<HashMap<(usize, WindowFunction), Arc<Vec<f64>>>> = RefCell::new(HashMap::new());
}

/// Window coefficients of length `size`, cached per worker thread.
pub fn window(size: usize, function: WindowFunction) -> Arc<Vec<f64>> {
    WINDOW_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .entry((size, function))
            .or_insert_with(|| Arc::new(build_window(size, function)))
            .clone()
    })
}

fn build_window(size: usize, function: WindowFunction) -> Vec<f64> {
    if size < 2 {
        return vec![1.0; size];
    }
    let n1 = (size - 1) as f64;
    (0..size)
        .map(|i| {
            let x = i as f64;
            match function {
                WindowFunction::Rectangular => 1.0,
                WindowFunction::Hann => 0.5 * (1.0 - (2.0 * PI * x / n1).cos()),
                WindowFunction::Hamming => 0.54 - 0.46 * (2.0 * PI * x / n1).cos(),
                WindowFunction::Blackman => {
                    0.42 - 0.5 * (2.0 * PI * x / n1).cos() + 0.08 * (4.0 * PI * x / n1).cos()
                }
                WindowFunction::Bartlett => 1.0 - ((x - n1 / 2.0) / (n1 / 2.0)).abs(),
            }
        })
        .collect()
}

/// Power spectrum of one block of normalised samples (full scale = 1.0).
///
/// Returns `samples.len() / 2` bins of `(2|X_k| / Σw)²`, so a full-scale sine
/// centred on a bin reads ≈ 1.0 there. `samples.len()` is the FFT size.
pub fn compute_spectrum(samples: &[f64], function: WindowFunction) -> Result<Vec<f64>> {
    let fft_size = samples.len();
    if fft_size < 2 {
        return Err(SpectrogramError::InvalidParameters(format!("cannot transform {fft_size} samples")));
    }

    let fft = FFT_PLANNER.with(|p| p.borrow_mut().plan_fft_forward(fft_size));
    let win = window(fft_size, function);
    let win_sum: f64 = win.iter().sum();

    let mut input = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();
    for (inp, (&s, &w)) in input.iter_mut().zip(samples.iter().zip(win.iter())) {
        *inp = s * w;
    }
    fft.process(&mut input, &mut spectrum)
        .map_err(|e| SpectrogramError::InvalidParameters(format!("FFT failed: {e}")))?;

    let scale = if win_sum > 0.0 { 2.0 / win_sum } else { 0.0 };
    Ok(spectrum
        .iter()
        .take(fft_size / 2)
        .map(|c| {
            let amp = c.norm() * scale;
            amp * amp
        })
        .collect())
}
