use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sonotile::{
    AudioSource, EngineConfig, FrequencyBand, RenderParameters, Spectrogram, TimeRange, WavSource, WindowFunction,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "spectro", about = "Spectrogram rendering with a persistent tile cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a WAV file (or part of it) to a PNG at display size
    Render(RenderArgs),
    /// Print the loudest level per frequency bin as JSON
    Peaks(PeaksArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Input WAV file
    input: PathBuf,

    /// Engine config (JSON). Defaults apply for missing keys.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tile cache directory (overrides config and SONOTILE_CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    start_ms: Option<u32>,

    #[arg(long)]
    end_ms: Option<u32>,

    #[arg(long)]
    min_freq: Option<u32>,

    #[arg(long)]
    max_freq: Option<u32>,
}

#[derive(Args)]
struct RenderArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output PNG
    #[arg(short, long)]
    output: PathBuf,

    /// FFT size (power of two)
    #[arg(long)]
    fft: Option<usize>,

    /// Frame overlap in percent
    #[arg(long)]
    overlap: Option<u32>,

    /// Window function: rectangular, hann, hamming, blackman, bartlett
    #[arg(long, value_parser = parse_window)]
    window: Option<WindowFunction>,

    #[arg(long, default_value_t = 1200)]
    width: u32,

    #[arg(long, default_value_t = 400)]
    height: u32,

    /// Also write the unscaled render here
    #[arg(long)]
    raster: Option<PathBuf>,

    /// Wait for background tile generation before exiting
    #[arg(long)]
    wait_tiles: bool,
}

#[derive(Args)]
struct PeaksArgs {
    #[command(flatten)]
    common: CommonArgs,
}

fn parse_window(name: &str) -> std::result::Result<WindowFunction, String> {
    WindowFunction::parse(name).ok_or_else(|| format!("unknown window function '{name}'"))
}

fn load_config(common: &CommonArgs) -> Result<EngineConfig> {
    let mut config = match &common.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    if let Some(dir) = &common.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

fn time_range(common: &CommonArgs, total_ms: u32) -> TimeRange {
    TimeRange::new(common.start_ms.unwrap_or(0), common.end_ms.unwrap_or(total_ms).min(total_ms))
}

fn band(common: &CommonArgs, maximum_frequency: u32) -> Option<FrequencyBand> {
    if common.min_freq.is_none() && common.max_freq.is_none() {
        return None;
    }
    Some(FrequencyBand::new(
        common.min_freq.unwrap_or(0),
        common.max_freq.unwrap_or(maximum_frequency).min(maximum_frequency),
    ))
}

fn render(args: RenderArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    let current = config.parameters;
    config.parameters = RenderParameters::new(
        args.fft.unwrap_or(current.fft_sample_size),
        args.overlap.unwrap_or(current.overlap_percent),
        args.window.unwrap_or(current.window_function),
    )?;

    let audio = WavSource::open(&args.common.input)
        .with_context(|| format!("opening {}", args.common.input.display()))?;
    let total_ms = audio.total_time_ms();
    let maximum_frequency = audio.maximum_frequency();
    let mut spectrogram = Spectrogram::new(Box::new(audio), &config, args.width, args.height)?;

    let range = time_range(&args.common, total_ms);
    if range != TimeRange::new(0, total_ms) {
        spectrogram.select_time_range(range.start_ms, range.end_ms)?;
    }
    if let Some(band) = band(&args.common, maximum_frequency) {
        spectrogram.select_frequency_range(band.low_hz, band.high_hz)?;
    }

    spectrogram.render()?;
    spectrogram.export_display(&args.output)?;
    tracing::info!("Wrote {}", args.output.display());
    if let Some(path) = &args.raster {
        spectrogram.export_raster(path)?;
        tracing::info!("Wrote {}", path.display());
    }

    if args.wait_tiles {
        spectrogram.wait_for_tiles();
        match spectrogram.tile_coverage() {
            Some((covered, complete)) => tracing::info!(
                "Tile covers {}..{} ms{}",
                covered.start_ms,
                covered.end_ms,
                if complete { " (complete)" } else { "" }
            ),
            None => tracing::warn!("No tile available"),
        }
    }
    spectrogram.close();
    Ok(())
}

fn peaks(args: PeaksArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let audio = WavSource::open(&args.common.input)
        .with_context(|| format!("opening {}", args.common.input.display()))?;
    let total_ms = audio.total_time_ms();
    let maximum_frequency = audio.maximum_frequency();
    let range = time_range(&args.common, total_ms);
    if range.start_ms >= range.end_ms {
        bail!("empty time range {}..{} ms", range.start_ms, range.end_ms);
    }

    let mut spectrogram = Spectrogram::new(Box::new(audio), &config, 1, 1)?;
    let values = spectrogram.extract_power_spectrum(range, band(&args.common, maximum_frequency))?;
    println!("{}", serde_json::to_string_pretty(&values)?);
    spectrogram.close();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sonotile=info,spectro=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Render(args) => render(args),
        Command::Peaks(args) => peaks(args),
    }
}
