use super::AudioSource;
use crate::error::{Result, SpectrogramError};
use hound::{SampleFormat, WavReader, WavSpec};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Frames kept in the read-ahead buffer.
const CHUNK_FRAMES: usize = 1 << 16;

/// WAV file reader with a single read-ahead chunk.
///
/// The reader keeps a seek position, so it must not be shared between
/// threads; `try_clone` reopens the file.
pub struct WavSource {
    path: PathBuf,
    name: String,
    cache_key: String,
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    total_frames: usize,
    chunk_start: usize,
    /// Interleaved frames starting at `chunk_start`.
    chunk: Vec<f64>,
}

impl WavSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(SpectrogramError::Audio(format!("{} has an empty format header", path.display())));
        }
        let total_frames = reader.duration() as usize;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let cache_key = format!("{name}-{}", file_fingerprint(path)?);
        log::debug!(
            "Opened {}: {} Hz, {} bit, {} ch, {} frames",
            path.display(),
            spec.sample_rate,
            spec.bits_per_sample,
            spec.channels,
            total_frames
        );
        Ok(Self {
            path: path.to_path_buf(),
            name,
            cache_key,
            reader,
            spec,
            total_frames,
            chunk_start: 0,
            chunk: Vec::new(),
        })
    }

    pub fn channels(&self) -> usize {
        self.spec.channels as usize
    }

    fn chunk_frames(&self) -> usize {
        self.chunk.len() / self.channels()
    }

    fn chunk_covers(&self, start: usize, end: usize) -> bool {
        !self.chunk.is_empty() && start >= self.chunk_start && end <= self.chunk_start + self.chunk_frames()
    }

    /// Read `count` interleaved frames starting at frame `start`.
    fn read_frames(&mut self, start: usize, count: usize) -> Result<Vec<f64>> {
        let count = count.min(self.total_frames.saturating_sub(start));
        if count == 0 {
            return Ok(Vec::new());
        }
        self.reader.seek(start as u32)?;
        let n = count * self.channels();
        let mut out = Vec::with_capacity(n);
        match self.spec.sample_format {
            SampleFormat::Int => {
                for s in self.reader.samples::<i32>().take(n) {
                    out.push(s? as f64);
                }
            }
            SampleFormat::Float => {
                let scale = self.full_scale();
                for s in self.reader.samples::<f32>().take(n) {
                    out.push(s? as f64 * scale);
                }
            }
        }
        Ok(out)
    }

    fn pick_channel(interleaved: &[f64], channels: usize, channel: usize) -> Vec<f64> {
        interleaved.iter().skip(channel).step_by(channels).copied().collect()
    }
}

/// First 16 hex digits of a SHA-256 over the canonical path, length and
/// modification time. Changes when the file is replaced or edited.
fn file_fingerprint(path: &Path) -> Result<String> {
    let canonical = std::fs::canonicalize(path)?;
    let meta = std::fs::metadata(&canonical)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(modified.to_le_bytes());
    let mut hex = String::with_capacity(16);
    for byte in hasher.finalize().iter().take(8) {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

impl AudioSource for WavSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_key(&self) -> String {
        self.cache_key.clone()
    }

    fn total_time_ms(&self) -> u32 {
        (self.total_frames as u64 * 1000 / self.spec.sample_rate as u64) as u32
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn bits_per_sample(&self) -> u16 {
        self.spec.bits_per_sample
    }

    fn num_samples(&self) -> usize {
        self.total_frames
    }

    fn amplitudes_in_range(&mut self, channel: usize, start: usize, end: usize) -> Result<Vec<f64>> {
        let channels = self.channels();
        if channel >= channels {
            return Err(SpectrogramError::Audio(format!("no channel {channel} in {}", self.name)));
        }
        let end = end.min(self.total_frames);
        if start >= end {
            return Ok(Vec::new());
        }

        if !self.chunk_covers(start, end) && end - start <= CHUNK_FRAMES {
            self.ensure_chunk_loaded(start)?;
        }
        if self.chunk_covers(start, end) {
            let lo = (start - self.chunk_start) * channels;
            let hi = (end - self.chunk_start) * channels;
            return Ok(Self::pick_channel(&self.chunk[lo..hi], channels, channel));
        }

        // Larger than a chunk: read straight through.
        let frames = self.read_frames(start, end - start)?;
        Ok(Self::pick_channel(&frames, channels, channel))
    }

    fn ensure_chunk_loaded(&mut self, start: usize) -> Result<()> {
        if self.chunk_covers(start, (start + 1).min(self.total_frames)) {
            return Ok(());
        }
        self.chunk = self.read_frames(start, CHUNK_FRAMES)?;
        self.chunk_start = start;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(WavSource::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_ramp(path: &Path, frames: usize, channels: u16) {
        let spec = WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for c in 0..channels {
                writer.write_sample((i as i16).wrapping_mul(1 + c as i16)).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_reads_channel_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 16_000, 2);

        let mut src = WavSource::open(&path).unwrap();
        assert_eq!(src.name(), "ramp");
        assert_eq!(src.total_time_ms(), 2000);
        assert_eq!(src.num_samples(), 16_000);

        let left = src.amplitudes_in_range(0, 100, 104).unwrap();
        assert_eq!(left, vec![100.0, 101.0, 102.0, 103.0]);
        let right = src.amplitudes_in_range(1, 100, 102).unwrap();
        assert_eq!(right, vec![200.0, 202.0]);
        assert!(src.amplitudes_in_range(2, 0, 1).is_err());
    }

    #[test]
    fn test_clone_has_independent_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        write_ramp(&path, 4000, 1);

        let mut a = WavSource::open(&path).unwrap();
        let mut b = a.try_clone().unwrap();
        let from_a = a.amplitudes_in_range(0, 3000, 3002).unwrap();
        let from_b = b.amplitudes_in_range(0, 10, 12).unwrap();
        assert_eq!(from_a, vec![3000.0, 3001.0]);
        assert_eq!(from_b, vec![10.0, 11.0]);
        // Truncated at the end of the file
        assert_eq!(a.amplitudes_in_range(0, 3998, 5000).unwrap().len(), 2);
    }

    #[test]
    fn test_cache_key_separates_files_with_the_same_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let a = dir.path().join("a").join("ramp.wav");
        let b = dir.path().join("b").join("ramp.wav");
        write_ramp(&a, 4000, 1);
        write_ramp(&b, 4000, 1);

        let first = WavSource::open(&a).unwrap();
        let other = WavSource::open(&b).unwrap();
        assert_eq!(first.name(), other.name());
        assert_ne!(first.cache_key(), other.cache_key());
        assert!(first.cache_key().starts_with("ramp-"));

        // Stable for the same file, including reopened clones
        assert_eq!(WavSource::open(&a).unwrap().cache_key(), first.cache_key());
        assert_eq!(first.try_clone().unwrap().cache_key(), first.cache_key());
    }
}
