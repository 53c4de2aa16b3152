use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Threshold applied when the caller supplies none, or something unparsable.
pub const DEFAULT_CONFIDENCE: f32 = 0.3;
/// Progress is reported every this many video frames.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;
/// Container extensions accepted for video input (lower-case, no dot).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "m4v"];

/// Minimum score for a detection to be kept. Always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ConfidenceThreshold(f32);

impl ConfidenceThreshold {
    pub fn new(value: f32) -> Result<Self> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidThreshold(value))
        }
    }

    /// Parse the threshold as it arrives from a request: a missing or
    /// non-numeric value falls back to [`DEFAULT_CONFIDENCE`], a number outside
    /// `[0, 1]` is rejected.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim).and_then(|s| s.parse::<f32>().ok()) {
            Some(value) => Self::new(value),
            None => Ok(Self::default()),
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for ConfidenceThreshold {
    fn default() -> Self {
        Self(DEFAULT_CONFIDENCE)
    }
}

/// Knobs shared by image and video runs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub progress_interval: u64,
    pub jpeg_quality: u8,
    /// Upper bound on wall time for one run, checked between frames.
    pub max_run_time: Option<Duration>,
    pub video_extensions: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_run_time: None,
            video_extensions: VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl PipelineOptions {
    /// Reject a video path whose extension is not accepted, before any decode
    /// attempt.
    pub fn check_video_extension(&self, path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if self.video_extensions.iter().any(|accepted| *accepted == ext) {
            Ok(())
        } else {
            Err(PipelineError::UnsupportedFormat(ext))
        }
    }
}
