pub mod collector;
pub mod colors;
pub mod raster;
pub mod spectrogram_renderer;
pub mod tile_cache;
pub mod viewport;
