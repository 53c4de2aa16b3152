use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use player_core::config::{ConfidenceThreshold, PipelineOptions};
use player_core::detection::{DetectionModel, RawDetection, SharedModel};
use player_core::pipeline::VideoPipeline;
use player_core::video::{probe, FrameSink, FrameSource, RgbFrame, VideoSink, VideoStreamSource};
use player_core::PipelineError;

const FPS: f64 = 10.0;

struct NoPlayers;

impl DetectionModel for NoPlayers {
    fn infer(&self, _frame: &RgbFrame, _threshold: f32) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// Moving diagonal gradient so every frame encodes to a distinct packet.
fn gradient(width: u32, height: u32, t: u32) -> RgbFrame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[
                ((x + t * 3) * 4) as u8,
                ((y + t * 2) * 5) as u8,
                ((x + y + t) * 2) as u8,
            ]);
        }
    }
    RgbFrame::new(data, width, height)
}

fn write_clip(path: &Path, frames: u32, width: u32, height: u32) -> PathBuf {
    let mut sink = VideoSink::create(path, FPS, width, height).unwrap();
    for t in 0..frames {
        sink.write_frame(&gradient(width, height, t)).unwrap();
    }
    sink.finish().unwrap()
}

fn read_all(path: &Path) -> Vec<RgbFrame> {
    let mut source = VideoStreamSource::open(path).unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = source.next_frame() {
        frames.push(frame);
    }
    frames
}

#[test]
fn written_video_reads_back_frame_for_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_clip(&dir.path().join("clip.mp4"), 30, 64, 48);

    let source = VideoStreamSource::open(&path).unwrap();
    let info = source.info();
    assert_eq!((info.width, info.height), (64, 48));
    assert!((info.fps.unwrap() - FPS).abs() < 0.01, "fps {:?}", info.fps);
    assert_eq!(info.frame_count, 30);
    assert_eq!(probe(&path).unwrap(), info);

    let frames = read_all(&path);
    assert_eq!(frames.len(), 30);
    assert!(frames.iter().all(|f| (f.width, f.height) == (64, 48)));
    assert!(frames.iter().all(|f| f.data.len() == 64 * 48 * 3));
    assert!(frames.windows(2).all(|w| w[0].pts < w[1].pts));
}

#[test]
fn video_sink_rejects_other_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    let mut sink = VideoSink::create(&path, FPS, 64, 48).unwrap();

    let err = sink.write_frame(&RgbFrame::filled(32, 32, [0; 3])).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DimensionMismatch {
            expected_width: 64,
            expected_height: 48,
            actual_width: 32,
            actual_height: 32,
        }
    ));

    // The rejected frame left the sink intact.
    sink.write_frame(&gradient(64, 48, 0)).unwrap();
    let path = sink.finish().unwrap();
    assert_eq!(read_all(&path).len(), 1);
}

#[test]
fn odd_sized_video_keeps_its_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_clip(&dir.path().join("odd.mp4"), 10, 65, 49);

    let frames = read_all(&path);
    assert_eq!(frames.len(), 10);
    assert_eq!((frames[0].width, frames[0].height), (65, 49));
}

#[test]
fn annotated_video_matches_source_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_clip(&dir.path().join("in.mp4"), 20, 64, 48);
    let output = dir.path().join("out.mp4");

    let model: SharedModel = Arc::new(NoPlayers);
    let result = VideoPipeline::new(model, PipelineOptions::default())
        .run(&input, &output, ConfidenceThreshold::default(), None)
        .unwrap();
    assert_eq!(result.total_frames, 20);
    assert_eq!(result.output, output);

    let info = probe(&output).unwrap();
    assert_eq!((info.width, info.height, info.frame_count), (64, 48, 20));
    assert!((info.fps.unwrap() - FPS).abs() < 0.01);
}

#[test]
fn truncated_video_keeps_frames_before_the_cut() {
    let dir = tempfile::tempdir().unwrap();
    // Matroska writes clusters as it goes, so a cut file still opens.
    let full = write_clip(&dir.path().join("full.mkv"), 30, 64, 48);
    let bytes = std::fs::read(&full).unwrap();
    let cut = dir.path().join("cut.mkv");
    std::fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();

    let model: SharedModel = Arc::new(NoPlayers);
    let result = VideoPipeline::new(model, PipelineOptions::default())
        .run(&cut, dir.path().join("out.mp4"), ConfidenceThreshold::default(), None)
        .unwrap();
    assert!(
        result.total_frames > 0 && result.total_frames < 30,
        "frames {}",
        result.total_frames
    );
    assert_eq!(read_all(&result.output).len() as u64, result.total_frames);
}

#[test]
fn unopenable_video_produces_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty.mp4");
    std::fs::write(&input, b"").unwrap();
    let output = dir.path().join("out.mp4");

    let model: SharedModel = Arc::new(NoPlayers);
    let err = VideoPipeline::new(model, PipelineOptions::default())
        .run(&input, &output, ConfidenceThreshold::default(), None)
        .unwrap_err();
    assert!(matches!(err, PipelineError::MediaUnreadable(_)));
    assert!(!output.exists());
}
