//! Progressive on-disk tile cache.
//!
//! One tile per `(audio, RenderParameters)`, where the audio is identified by
//! its `AudioSource::cache_key`. A tile always starts at 0 ms and
//! grows to the right one segment at a time until it covers the whole
//! recording. Each grown tile is written as PNG, hashed, and recorded in
//! `registry.json`; a record is only trusted while the file still hashes to
//! the recorded value and its duration and sample rate match the audio.
//!
//! Short recordings get their single complete tile from the interactive
//! render. Long ones are extended by one background thread per manager,
//! which stops between segments when its cancellation token is set.

use crate::audio::AudioSource;
use crate::canvas::raster::Raster;
use crate::canvas::spectrogram_renderer::{RenderRequest, Renderer};
use crate::error::Result;
use crate::session::{CachePolicy, RenderSession};
use crate::types::{RenderKind, RenderParameters, TimeRange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const REGISTRY_FILE: &str = "registry.json";

// ── Registry ─────────────────────────────────────────────────────────────────

/// What is known about one persisted tile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub audio_key: String,
    pub path: PathBuf,
    pub hash: String,
    pub params: RenderParameters,
    /// Duration and sample rate of the audio the tile was rendered from.
    #[serde(default)]
    pub total_time_ms: u32,
    #[serde(default)]
    pub sample_rate: u32,
    pub initial_time: u32,
    pub final_time: u32,
    pub complete: bool,
}

impl TileRecord {
    pub fn covered(&self) -> TimeRange {
        TimeRange::new(self.initial_time, self.final_time)
    }
}

/// Tile records mirrored to `{cache_dir}/registry.json`.
#[derive(Debug)]
pub struct TileRegistry {
    path: PathBuf,
    records: Vec<TileRecord>,
}

impl TileRegistry {
    /// Load the registry in `cache_dir`. A missing or unreadable file is an empty registry.
    pub fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join(REGISTRY_FILE);
        let records = Self::read(&path);
        Self { path, records }
    }

    fn read(path: &Path) -> Vec<TileRecord> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Tile registry {} unreadable, starting empty: {e}", path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str(&text) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Tile registry {} is corrupt, starting empty: {e}", path.display());
                Vec::new()
            }
        }
    }

    pub fn records(&self) -> &[TileRecord] {
        &self.records
    }

    pub fn find(&self, audio_key: &str, params: &RenderParameters) -> Option<&TileRecord> {
        self.records
            .iter()
            .find(|r| r.audio_key == audio_key && r.params == *params)
    }

    /// Insert or replace the record for the same audio and parameters, then save.
    pub fn upsert(&mut self, record: TileRecord) -> Result<()> {
        // Other managers may share the directory; start from what is on disk.
        self.records = Self::read(&self.path);
        self.records
            .retain(|r| !(r.audio_key == record.audio_key && r.params == record.params));
        self.records.push(record);
        self.save()
    }

    /// Drop the record for `audio_key` and `params`. Returns whether one existed.
    pub fn remove(&mut self, audio_key: &str, params: &RenderParameters) -> Result<bool> {
        self.records = Self::read(&self.path);
        let before = self.records.len();
        self.records.retain(|r| !(r.audio_key == audio_key && r.params == *params));
        if self.records.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Lowercase hex SHA-256 of a file's contents, read in blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// Writes tiles for one audio source. Cloned into background workers.
#[derive(Clone)]
struct TileStore {
    audio_key: String,
    total_time_ms: u32,
    sample_rate: u32,
    cache_dir: PathBuf,
    registry: Arc<Mutex<TileRegistry>>,
}

impl TileStore {
    fn tile_path(&self, params: &RenderParameters) -> PathBuf {
        self.cache_dir.join(format!(
            "{}-{}-{}-{}.png",
            self.audio_key, params.fft_sample_size, params.overlap_percent, params.window_function
        ))
    }

    fn lookup(&self, params: &RenderParameters) -> Option<TileRecord> {
        self.registry.lock().find(&self.audio_key, params).cloned()
    }

    /// Write `tile`, hash it and record it. The registry lock is held
    /// throughout so a record never names a half-written file.
    fn persist(&self, params: &RenderParameters, tile: &Raster, complete: bool) -> Result<TileRecord> {
        let mut registry = self.registry.lock();
        let path = self.tile_path(params);
        tile.save_png(&path)?;
        let record = TileRecord {
            audio_key: self.audio_key.clone(),
            hash: sha256_file(&path)?,
            path,
            params: *params,
            total_time_ms: self.total_time_ms,
            sample_rate: self.sample_rate,
            initial_time: tile.time.start_ms,
            final_time: tile.time.end_ms,
            complete,
        };
        registry.upsert(record.clone())?;
        log::info!(
            "Persisted tile {} covering {}..{} ms (complete: {})",
            record.path.display(),
            record.initial_time,
            record.final_time,
            record.complete
        );
        Ok(record)
    }

    /// Read back the recorded tile for `params` if it was rendered from audio
    /// of the same duration and sample rate and its file still hashes to the
    /// recorded value. A tile that fails a check or cannot be decoded is
    /// dropped from the registry and deleted.
    fn load(&self, params: &RenderParameters, maximum_frequency: f64) -> Option<(TileRecord, Raster)> {
        let mut registry = self.registry.lock();
        let record = registry.find(&self.audio_key, params)?.clone();
        let loaded = if record.total_time_ms != self.total_time_ms || record.sample_rate != self.sample_rate {
            Err(format!(
                "rendered from {} ms at {} Hz, audio is {} ms at {} Hz",
                record.total_time_ms, record.sample_rate, self.total_time_ms, self.sample_rate
            ))
        } else if record.final_time > self.total_time_ms {
            Err(format!("covers {} ms, past the end of the audio", record.final_time))
        } else {
            match sha256_file(&record.path) {
                Ok(hash) if hash == record.hash => {
                    Raster::load_png(&record.path, record.covered(), 0.0, maximum_frequency).map_err(|e| e.to_string())
                }
                Ok(_) => Err("file changed on disk".to_string()),
                Err(e) => Err(e.to_string()),
            }
        };
        match loaded {
            Ok(raster) => Some((record, raster)),
            Err(reason) => {
                log::warn!("Discarding tile {}: {reason}", record.path.display());
                if let Err(e) = registry.remove(&self.audio_key, params) {
                    log::warn!("Could not update tile registry: {e}");
                }
                if record.path.exists() {
                    if let Err(e) = std::fs::remove_file(&record.path) {
                        log::warn!("Could not remove stale tile {}: {e}", record.path.display());
                    }
                }
                None
            }
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative stop flag shared with a background extension.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── In-memory tile ───────────────────────────────────────────────────────────

/// The tile currently held in memory. `generation` moves on every
/// invalidation; workers from an older generation may not publish.
#[derive(Debug, Default)]
struct TileState {
    generation: u64,
    params: Option<RenderParameters>,
    raster: Option<Raster>,
    complete: bool,
}

impl TileState {
    fn holds(&self, params: &RenderParameters) -> bool {
        self.params.as_ref() == Some(params) && self.raster.is_some()
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.params = None;
        self.raster = None;
        self.complete = false;
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct TileCacheManager {
    store: TileStore,
    policy: CachePolicy,
    segment_ms: u32,
    maximum_frequency: f64,
    state: Arc<Mutex<TileState>>,
    worker: Option<Worker>,
    retired: Vec<JoinHandle<()>>,
}

impl TileCacheManager {
    /// A manager for the tiles of `audio` in `cache_dir`.
    pub fn new(audio: &dyn AudioSource, cache_dir: &Path, segment_ms: u32, policy: CachePolicy) -> Self {
        Self {
            store: TileStore {
                audio_key: audio.cache_key(),
                total_time_ms: audio.total_time_ms(),
                sample_rate: audio.sample_rate(),
                cache_dir: cache_dir.to_path_buf(),
                registry: Arc::new(Mutex::new(TileRegistry::open(cache_dir))),
            },
            policy,
            segment_ms: segment_ms.max(1),
            maximum_frequency: audio.maximum_frequency() as f64,
            state: Arc::new(Mutex::new(TileState::default())),
            worker: None,
            retired: Vec::new(),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn tile_path(&self, params: &RenderParameters) -> PathBuf {
        self.store.tile_path(params)
    }

    pub fn record(&self, params: &RenderParameters) -> Option<TileRecord> {
        self.store.lookup(params)
    }

    /// Make the tile for `params` available in memory, loading it from disk
    /// if needed. Returns its covered range and completeness.
    ///
    /// A tile whose file no longer matches its recorded hash, or cannot be
    /// read, is dropped from the registry and `None` is returned so the
    /// next render starts from 0 ms.
    pub fn restore(&self, params: &RenderParameters) -> Option<(TimeRange, bool)> {
        {
            let state = self.state.lock();
            if state.holds(params) {
                return state.raster.as_ref().map(|r| (r.time, state.complete));
            }
        }

        let (record, raster) = self.store.load(params, self.maximum_frequency)?;
        let mut state = self.state.lock();
        state.params = Some(*params);
        state.raster = Some(raster);
        state.complete = record.complete;
        log::debug!(
            "Restored tile {} covering {}..{} ms",
            record.path.display(),
            record.initial_time,
            record.final_time
        );
        Some((record.covered(), record.complete))
    }

    /// Drop the in-memory tile and stop any background extension. Tiles
    /// already written stay on disk under their own parameters.
    pub fn invalidate(&mut self) {
        self.cancel_worker();
        self.state.lock().reset();
    }

    /// Covered range and completeness of the in-memory tile.
    pub fn coverage(&self) -> Option<(TimeRange, bool)> {
        let state = self.state.lock();
        state.raster.as_ref().map(|r| (r.time, state.complete))
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Run `f` against the in-memory tile, if it was built with `params`.
    pub fn borrow_tile<R>(&self, params: &RenderParameters, f: impl FnOnce(&Raster) -> R) -> Option<R> {
        let state = self.state.lock();
        if state.params.as_ref() != Some(params) {
            return None;
        }
        state.raster.as_ref().map(f)
    }

    /// Adopt a render of the whole recording as the finished tile (short policy).
    pub fn store_complete(&self, params: &RenderParameters, raster: Raster) -> Result<TileRecord> {
        let record = self.store.persist(params, &raster, true)?;
        let mut state = self.state.lock();
        state.params = Some(*params);
        state.raster = Some(raster);
        state.complete = true;
        Ok(record)
    }

    /// A synchronous extender continuing from the current in-memory tile.
    pub fn extender(&self, audio: Box<dyn AudioSource>, session: RenderSession) -> TileExtender {
        let mut state = self.state.lock();
        if !state.holds(&session.params) {
            state.params = Some(session.params);
            state.raster = None;
            state.complete = false;
        }
        TileExtender {
            maximum_time: audio.total_time_ms(),
            audio,
            session,
            token: CancellationToken::new(),
            generation: state.generation,
            tile: state.raster.clone(),
            state: Arc::clone(&self.state),
            store: self.store.clone(),
            segment_ms: self.segment_ms,
        }
    }

    /// Start extending the tile in the background unless it is complete or
    /// an extension is already running.
    pub fn spawn_extension(&mut self, audio: Box<dyn AudioSource>, session: RenderSession) -> Result<()> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                return Ok(());
            }
        }
        self.reap();
        {
            let state = self.state.lock();
            if state.holds(&session.params) && state.complete {
                return Ok(());
            }
        }

        let extender = self.extender(audio, session);
        let token = extender.token.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sonotile-tiles-{}", self.store.audio_key))
            .spawn(move || extender.run())?;
        self.worker = Some(Worker { token, handle });
        Ok(())
    }

    pub fn is_extending(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    /// Block until the running extension finishes.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            join(worker.handle);
        }
    }

    /// Cancel background work and wait for every worker, current and retired.
    pub fn close(&mut self) {
        self.cancel_worker();
        for handle in self.retired.drain(..) {
            join(handle);
        }
    }

    fn cancel_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.token.cancel();
            self.retired.push(worker.handle);
        }
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            join(worker.handle);
        }
        let (done, running): (Vec<_>, Vec<_>) = self.retired.drain(..).partition(|h| h.is_finished());
        self.retired = running;
        done.into_iter().for_each(join);
    }
}

impl Drop for TileCacheManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("Tile extension thread panicked");
    }
}

// ── Extension ────────────────────────────────────────────────────────────────

/// Grows one tile segment by segment. Owns its own audio handle and a copy
/// of the render session, so nothing it reads can change underneath it.
pub struct TileExtender {
    audio: Box<dyn AudioSource>,
    session: RenderSession,
    token: CancellationToken,
    generation: u64,
    tile: Option<Raster>,
    state: Arc<Mutex<TileState>>,
    store: TileStore,
    segment_ms: u32,
    maximum_time: u32,
}

impl TileExtender {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// End of the range covered so far.
    pub fn covered_until(&self) -> u32 {
        self.tile.as_ref().map_or(0, |t| t.time.end_ms)
    }

    /// Render and persist the next segment. `Ok(None)` once the tile
    /// already covers the whole recording.
    pub fn step(&mut self) -> Result<Option<TileRecord>> {
        let start = self.covered_until();
        if start >= self.maximum_time {
            return Ok(None);
        }
        let end = start.saturating_add(self.segment_ms).min(self.maximum_time);

        let request = RenderRequest::new(TimeRange::new(start, end), RenderKind::Tile);
        let segment = Renderer::new(&self.session).render(self.audio.as_mut(), &request)?;
        let tile = match self.tile.take() {
            Some(tile) => tile.append_right(&segment),
            None => segment,
        };
        let complete = end == self.maximum_time;
        let record = self.store.persist(&self.session.params, &tile, complete)?;

        {
            let mut state = self.state.lock();
            if state.generation == self.generation {
                state.params = Some(self.session.params);
                state.raster = Some(tile.clone());
                state.complete = complete;
            }
        }
        self.tile = Some(tile);
        Ok(Some(record))
    }

    /// Extend until complete, cancelled, or failed. Every finished segment
    /// is already on disk, so stopping early loses nothing.
    pub fn run(mut self) {
        loop {
            if self.token.is_cancelled() {
                log::info!(
                    "Tile extension for {} cancelled at {} ms",
                    self.store.audio_key,
                    self.covered_until()
                );
                return;
            }
            match self.step() {
                Ok(Some(record)) if !record.complete => continue,
                Ok(_) => return,
                Err(e) => {
                    log::warn!(
                        "Tile extension for {} stopped at {} ms: {e}",
                        self.store.audio_key,
                        self.covered_until()
                    );
                    return;
                }
            }
        }
    }
}
