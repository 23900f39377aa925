pub mod features;
pub mod fft;
pub mod frame;
