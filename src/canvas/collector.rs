//! Intensity Collector: where frame workers drop their results.
//!
//! Appends arrive in any order from any thread; `into_sorted` restores
//! column order once every worker has finished.

use crate::error::{Result, SpectrogramError};
use crate::types::FrameIntensities;
use parking_lot::Mutex;

#[derive(Default)]
pub struct IntensityCollector {
    frames: Mutex<Vec<FrameIntensities>>,
    failure: Mutex<Option<SpectrogramError>>,
}

impl IntensityCollector {
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            frames: Mutex::new(Vec::with_capacity(frames)),
            failure: Mutex::new(None),
        }
    }

    pub fn push(&self, frame: FrameIntensities) {
        self.frames.lock().push(frame);
    }

    /// Record a failed frame. The first failure wins.
    pub fn fail(&self, error: SpectrogramError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Frames ordered by `chunk_start`; column index equals sort rank.
    /// Any recorded failure discards the partial result.
    pub fn into_sorted(self) -> Result<Vec<FrameIntensities>> {
        if let Some(err) = self.failure.into_inner() {
            return Err(err);
        }
        let mut frames = self.frames.into_inner();
        frames.sort_by_key(|f| f.chunk_start);
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_pushes_come_out_sorted() {
        let collector = IntensityCollector::with_capacity(400);
        thread::scope(|s| {
            for t in 0..4usize {
                let collector = &collector;
                s.spawn(move || {
                    for i in (0..100usize).rev() {
                        let start = (i * 4 + t) * 512;
                        collector.push(FrameIntensities { chunk_start: start, bins: vec![start as f64] });
                    }
                });
            }
        });

        let frames = collector.into_sorted().unwrap();
        assert_eq!(frames.len(), 400);
        assert!(frames.windows(2).all(|w| w[0].chunk_start < w[1].chunk_start));
        assert_eq!(frames[1].bins[0], 512.0);
    }

    #[test]
    fn test_failure_discards_frames() {
        let collector = IntensityCollector::default();
        collector.push(FrameIntensities { chunk_start: 0, bins: vec![] });
        collector.fail(SpectrogramError::FrameFailed { chunk_start: 1024, reason: "boom".into() });
        collector.fail(SpectrogramError::FrameFailed { chunk_start: 2048, reason: "later".into() });
        match collector.into_sorted() {
            Err(SpectrogramError::FrameFailed { chunk_start, .. }) => assert_eq!(chunk_start, 1024),
            other => panic!("expected first failure, got {other:?}"),
        }
    }
}
