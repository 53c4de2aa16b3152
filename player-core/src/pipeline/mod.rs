//! pipeline — pull frames, detect, annotate, push, count
//!
//! One run is a single-threaded pull loop: frame N is written to the sink
//! before frame N+1 is pulled, and only that one frame is alive at a time.
//! The model is the only thing shared between runs.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::annotate::annotate;
use crate::config::{ConfidenceThreshold, PipelineOptions};
use crate::detection::{adapt, DetectionBatch, SharedModel};
use crate::error::{PipelineError, Result};
use crate::video::{
    FrameSink, FrameSource, ImageSink, RgbFrame, StillImageSource, VideoSink, VideoStreamSource,
};

/// Called with a completion percentage in `[0, 100]`.
pub type ProgressFn = Box<dyn FnMut(u8) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Aggregate outcome of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineResult<O> {
    pub total_frames: u64,
    pub total_detections: u64,
    /// Encoded bytes for stills, the written file for video.
    pub output: O,
    /// Per-frame detail, kept only when the driver was asked to retain it.
    pub detections: Option<Vec<DetectionBatch>>,
}

/// Percentage reported while running: never 100 until the run completes, and
/// 0 when the source gave no usable frame estimate.
pub fn progress_percent(frames_done: u64, estimated_total: u64) -> u8 {
    if estimated_total == 0 {
        return 0;
    }
    (frames_done.saturating_mul(100) / estimated_total).min(99) as u8
}

#[derive(Default)]
struct RunTimings {
    detect: Duration,
    annotate: Duration,
    write: Duration,
}

/// Drives one source through detection and annotation into one sink.
pub struct PipelineDriver<S, K> {
    model: SharedModel,
    source: S,
    sink: Option<K>,
    threshold: ConfidenceThreshold,
    options: PipelineOptions,
    progress: Option<ProgressFn>,
    retain_batches: bool,
    state: PipelineState,
}

impl<S: FrameSource, K: FrameSink> PipelineDriver<S, K> {
    pub fn new(model: SharedModel, source: S, sink: K, threshold: ConfidenceThreshold) -> Self {
        Self {
            model,
            source,
            sink: Some(sink),
            threshold,
            options: PipelineOptions::default(),
            progress: None,
            retain_batches: false,
            state: PipelineState::Initialized,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Report progress every `options.progress_interval` frames and once more
    /// (100) on completion.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Keep every frame's detections in the result. Memory grows with frame
    /// count, so this is meant for stills.
    pub fn retain_batches(mut self, retain: bool) -> Self {
        self.retain_batches = retain;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run to completion. The sink is finalised only on success; after a
    /// failure whatever it holds is incomplete.
    pub fn run(&mut self) -> Result<PipelineResult<K::Output>> {
        if self.state != PipelineState::Initialized {
            return Err(PipelineError::InvalidState(self.state));
        }
        self.state = PipelineState::Running;
        match self.run_frames() {
            Ok(result) => {
                self.state = PipelineState::Completed;
                Ok(result)
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                warn!(model = self.model.name(), "pipeline run failed: {e}");
                Err(e)
            }
        }
    }

    fn run_frames(&mut self) -> Result<PipelineResult<K::Output>> {
        let info = self.source.info();
        let interval = self.options.progress_interval.max(1);
        let started = Instant::now();
        let mut timings = RunTimings::default();
        let mut total_frames = 0u64;
        let mut total_detections = 0u64;
        let mut batches = self.retain_batches.then(Vec::new);

        info!(
            width = info.width,
            height = info.height,
            fps = ?info.fps,
            estimated_frames = info.frame_count,
            threshold = self.threshold.value(),
            "pipeline run started"
        );

        while let Some(mut frame) = self.source.next_frame() {
            if let Some(limit) = self.options.max_run_time {
                if started.elapsed() > limit {
                    return Err(PipelineError::TimedOut {
                        frames: total_frames,
                    });
                }
            }

            let batch = self.process_frame(&mut frame, total_frames, &mut timings)?;

            total_frames += 1;
            total_detections += batch.len() as u64;
            if let Some(batches) = batches.as_mut() {
                batches.push(batch);
            }

            if total_frames % interval == 0 {
                if let Some(progress) = self.progress.as_mut() {
                    progress(progress_percent(total_frames, info.frame_count));
                }
            }
            if total_frames % 100 == 0 {
                debug!(total_frames, total_detections, "processed frames");
            }
        }

        // Nothing decodable at all: the sink stays unfinished.
        if total_frames == 0 {
            return Err(PipelineError::MediaUnreadable(
                "no frames could be decoded from the input".into(),
            ));
        }

        let sink = self.sink.take().ok_or(PipelineError::InvalidState(self.state))?;
        let write_start = Instant::now();
        let output = sink.finish()?;
        timings.write += write_start.elapsed();

        if let Some(progress) = self.progress.as_mut() {
            progress(100);
        }

        let per_frame = |d: Duration| {
            format!(
                "{:.2}",
                d.as_secs_f64() * 1000.0 / total_frames.max(1) as f64
            )
        };
        info!(
            total_frames,
            total_detections,
            elapsed_ms = started.elapsed().as_millis() as u64,
            detect_ms_per_frame = per_frame(timings.detect),
            annotate_ms_per_frame = per_frame(timings.annotate),
            write_ms_per_frame = per_frame(timings.write),
            "pipeline run completed"
        );

        Ok(PipelineResult {
            total_frames,
            total_detections,
            output,
            detections: batches,
        })
    }

    /// Detect, annotate and write one frame. Counting happens in the caller
    /// and only after this returns `Ok`.
    fn process_frame(
        &mut self,
        frame: &mut RgbFrame,
        index: u64,
        timings: &mut RunTimings,
    ) -> Result<DetectionBatch> {
        let detect_start = Instant::now();
        let raw = self
            .model
            .infer(frame, self.threshold.value())
            .map_err(|e| PipelineError::Inference {
                frame: index,
                message: format!("{e:#}"),
            })?;
        let batch = adapt(&raw, self.threshold);
        timings.detect += detect_start.elapsed();

        let annotate_start = Instant::now();
        annotate(frame, &batch)?;
        timings.annotate += annotate_start.elapsed();

        let write_start = Instant::now();
        let sink = self
            .sink
            .as_mut()
            .ok_or(PipelineError::InvalidState(self.state))?;
        sink.write_frame(frame)?;
        timings.write += write_start.elapsed();

        Ok(batch)
    }
}

// ── Still images ────────────────────────────────────────────────────────────

/// Single-image runs: decode, annotate, re-encode as JPEG in memory. Per-frame
/// detections are returned; progress is never reported.
pub struct ImagePipeline {
    model: SharedModel,
    options: PipelineOptions,
}

impl ImagePipeline {
    pub fn new(model: SharedModel, options: PipelineOptions) -> Self {
        Self { model, options }
    }

    pub fn run_bytes(
        &self,
        bytes: &[u8],
        threshold: ConfidenceThreshold,
    ) -> Result<PipelineResult<Vec<u8>>> {
        let source = StillImageSource::from_bytes(bytes)?;
        self.run_source(source, threshold)
    }

    pub fn run_path<P: AsRef<Path>>(
        &self,
        path: P,
        threshold: ConfidenceThreshold,
    ) -> Result<PipelineResult<Vec<u8>>> {
        let source = StillImageSource::open(path)?;
        self.run_source(source, threshold)
    }

    /// Pasted image, as base64 or a `data:` URL.
    pub fn run_data_url(
        &self,
        text: &str,
        threshold: ConfidenceThreshold,
    ) -> Result<PipelineResult<Vec<u8>>> {
        let source = StillImageSource::from_data_url(text)?;
        self.run_source(source, threshold)
    }

    pub fn run_source(
        &self,
        source: StillImageSource,
        threshold: ConfidenceThreshold,
    ) -> Result<PipelineResult<Vec<u8>>> {
        let sink = ImageSink::new(self.options.jpeg_quality);
        PipelineDriver::new(self.model.clone(), source, sink, threshold)
            .with_options(self.options.clone())
            .retain_batches(true)
            .run()
    }
}

// ── Video ────────────────────────────────────────────────────────────────────

/// Video runs: stream-decode, annotate, encode H.264 at the source's frame
/// rate and resolution. Only aggregate counts are returned.
pub struct VideoPipeline {
    model: SharedModel,
    options: PipelineOptions,
}

impl VideoPipeline {
    pub fn new(model: SharedModel, options: PipelineOptions) -> Self {
        Self { model, options }
    }

    pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
        threshold: ConfidenceThreshold,
        progress: Option<ProgressFn>,
    ) -> Result<PipelineResult<PathBuf>> {
        let input = input.as_ref();
        let output = output.as_ref();
        self.options.check_video_extension(input)?;

        let source = VideoStreamSource::open(input)?;
        let sink = VideoSink::for_source(output, &source.info())?;

        let mut driver = PipelineDriver::new(self.model.clone(), source, sink, threshold)
            .with_options(self.options.clone());
        if let Some(progress) = progress {
            driver = driver.with_progress(progress);
        }
        let outcome = driver.run();
        // Closes the unfinished output before it is removed.
        drop(driver);

        if let Err(PipelineError::MediaUnreadable(_)) = &outcome {
            if let Err(e) = std::fs::remove_file(output) {
                debug!(path = %output.display(), "could not remove unusable output: {e}");
            }
        }
        outcome
    }
}
