//! video — frame sources and sinks
//!
//! A source yields frames one at a time and is never rewound; a sink takes
//! them in order and is finalised by value, so it cannot be finished twice or
//! written after finishing. Only one frame is alive per pipeline iteration.

mod ffmpeg;

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PipelineError;

pub use self::ffmpeg::{probe, FfmpegDecoder, VideoSink};

/// A single frame in packed RGB24, row-major, along with its presentation
/// timestamp (source time-base units; frame index for stills).
#[derive(Clone, Debug)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            pts: 0,
        }
    }

    /// A frame filled with one colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(data, width, height)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Fails when the buffer length disagrees with the dimensions.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let expected = self.expected_len();
        if self.data.len() == expected {
            Ok(())
        } else {
            Err(PipelineError::MalformedFrame {
                width: self.width,
                height: self.height,
                len: self.data.len(),
                expected,
            })
        }
    }
}

/// What a source knows about its stream before any frame is pulled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// `None` for stills.
    pub fps: Option<f64>,
    /// Best effort for video: container metadata can be wrong.
    pub frame_count: u64,
}

pub trait FrameSource {
    fn info(&self) -> SourceInfo;

    /// Next frame in presentation order, or `None` once the stream has ended.
    fn next_frame(&mut self) -> Option<RgbFrame>;
}

pub trait FrameSink {
    /// What the caller gets back once the sink is finalised.
    type Output;

    /// Write one frame. On error nothing of this frame is considered written.
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<(), PipelineError>;

    /// Flush and close. Consumes the sink.
    fn finish(self) -> Result<Self::Output, PipelineError>;
}

/// Width and height a sink is locked to for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn check(&self, frame: &RgbFrame) -> Result<(), PipelineError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(PipelineError::DimensionMismatch {
                expected_width: self.width,
                expected_height: self.height,
                actual_width: frame.width,
                actual_height: frame.height,
            });
        }
        frame.validate()
    }
}

// ── Still images ────────────────────────────────────────────────────────────

/// Source over exactly one decoded image.
pub struct StillImageSource {
    info: SourceInfo,
    frame: Option<RgbFrame>,
}

impl StillImageSource {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::MediaUnreadable(format!("could not decode image: {e}")))?
            .into_rgb8();
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::MediaUnreadable("image has no pixels".into()));
        }
        debug!(width, height, "decoded still image");
        Ok(Self::from_frame(RgbFrame::new(img.into_raw(), width, height)))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::MediaUnreadable(format!("could not read {}: {e}", path.display()))
        })?;
        Self::from_bytes(&bytes)
    }

    /// Decode a pasted image: plain base64, or a `data:image/...;base64,` URL.
    pub fn from_data_url(text: &str) -> Result<Self, PipelineError> {
        let bytes = decode_data_url(text)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_frame(frame: RgbFrame) -> Self {
        Self {
            info: SourceInfo {
                width: frame.width,
                height: frame.height,
                fps: None,
                frame_count: 1,
            },
            frame: Some(frame),
        }
    }
}

impl FrameSource for StillImageSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Option<RgbFrame> {
        self.frame.take()
    }
}

/// Everything after the first `base64,` marker is the payload; without a
/// marker the whole text is.
pub fn decode_data_url(text: &str) -> Result<Vec<u8>, PipelineError> {
    let payload = text
        .split_once("base64,")
        .map_or(text, |(_, rest)| rest);
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| PipelineError::MediaUnreadable(format!("invalid base64 image data: {e}")))
}

/// In-memory JPEG encoder for a single annotated frame.
pub struct ImageSink {
    quality: u8,
    encoded: Option<Vec<u8>>,
}

impl ImageSink {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            encoded: None,
        }
    }
}

impl FrameSink for ImageSink {
    type Output = Vec<u8>;

    fn write_frame(&mut self, frame: &RgbFrame) -> Result<(), PipelineError> {
        if self.encoded.is_some() {
            return Err(PipelineError::SinkClosed);
        }
        frame.validate()?;
        let bytes = encode_jpeg(frame, self.quality)
            .map_err(|e| PipelineError::SinkWrite(format!("{e:#}")))?;
        self.encoded = Some(bytes);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, PipelineError> {
        self.encoded
            .ok_or_else(|| PipelineError::SinkWrite("no frame was written".into()))
    }
}

fn encode_jpeg(frame: &RgbFrame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("JPEG encode failed")?;
    Ok(buf.into_inner())
}

// ── Video streams ────────────────────────────────────────────────────────────

/// One decode step of a video stream: `Ok(None)` on a clean end of stream,
/// `Err` when the next frame cannot be decoded.
pub trait FrameDecoder {
    fn info(&self) -> SourceInfo;
    fn decode_next(&mut self) -> Result<Option<RgbFrame>>;
}

/// Single-pass video source. A frame that fails to decode ends the stream at
/// that point; everything before it is kept.
pub struct VideoStreamSource<D = FfmpegDecoder> {
    decoder: D,
    pulled: u64,
    ended: bool,
}

impl VideoStreamSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let decoder = FfmpegDecoder::open(path.as_ref())
            .map_err(|e| PipelineError::MediaUnreadable(format!("{e:#}")))?;
        Ok(Self::from_decoder(decoder))
    }
}

impl<D: FrameDecoder> VideoStreamSource<D> {
    pub fn from_decoder(decoder: D) -> Self {
        Self {
            decoder,
            pulled: 0,
            ended: false,
        }
    }

    #[cfg(test)]
    fn frames_pulled(&self) -> u64 {
        self.pulled
    }
}

impl<D: FrameDecoder> FrameSource for VideoStreamSource<D> {
    fn info(&self) -> SourceInfo {
        self.decoder.info()
    }

    fn next_frame(&mut self) -> Option<RgbFrame> {
        if self.ended {
            return None;
        }
        match self.decoder.decode_next() {
            Ok(Some(frame)) => {
                self.pulled += 1;
                Some(frame)
            }
            Ok(None) => {
                self.ended = true;
                None
            }
            Err(e) => {
                warn!(
                    frame = self.pulled,
                    "unreadable frame, ending stream early: {e:#}"
                );
                self.ended = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct ScriptedDecoder {
        declared: u64,
        readable: u64,
        next: u64,
    }

    impl FrameDecoder for ScriptedDecoder {
        fn info(&self) -> SourceInfo {
            SourceInfo {
                width: 8,
                height: 6,
                fps: Some(10.0),
                frame_count: self.declared,
            }
        }

        fn decode_next(&mut self) -> Result<Option<RgbFrame>> {
            if self.next >= self.declared {
                return Ok(None);
            }
            if self.next >= self.readable {
                bail!("corrupt packet at frame {}", self.next);
            }
            let mut frame = RgbFrame::filled(8, 6, [10, 20, 30]);
            frame.pts = self.next as i64;
            self.next += 1;
            Ok(Some(frame))
        }
    }

    #[test]
    fn decode_error_ends_stream_without_losing_earlier_frames() {
        let mut source = VideoStreamSource::from_decoder(ScriptedDecoder {
            declared: 30,
            readable: 15,
            next: 0,
        });
        let mut pts = Vec::new();
        while let Some(frame) = source.next_frame() {
            pts.push(frame.pts);
        }
        assert_eq!(pts, (0..15).collect::<Vec<_>>());
        assert_eq!(source.frames_pulled(), 15);
        assert!(source.next_frame().is_none());
        assert_eq!(source.info().frame_count, 30);
    }

    #[test]
    fn clean_stream_yields_declared_count() {
        let mut source = VideoStreamSource::from_decoder(ScriptedDecoder {
            declared: 12,
            readable: 12,
            next: 0,
        });
        let mut n = 0;
        while source.next_frame().is_some() {
            n += 1;
        }
        assert_eq!(n, 12);
    }

    #[test]
    fn still_source_yields_once() {
        let mut source = StillImageSource::from_frame(RgbFrame::filled(4, 4, [0, 0, 0]));
        assert_eq!(source.info().frame_count, 1);
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn undecodable_still_is_rejected() {
        assert!(matches!(
            StillImageSource::from_bytes(&[]),
            Err(PipelineError::MediaUnreadable(_))
        ));
        assert!(matches!(
            StillImageSource::from_bytes(b"definitely not an image"),
            Err(PipelineError::MediaUnreadable(_))
        ));
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = StillImageSource::open(dir.path().join("nope.jpg")).err().unwrap();
        assert!(matches!(err, PipelineError::MediaUnreadable(_)));
    }

    fn encoded(format: image::ImageFormat) -> Vec<u8> {
        let img = image::RgbImage::from_fn(6, 4, |x, y| image::Rgb([x as u8 * 40, y as u8 * 60, 200]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn lossless_upload_formats_decode() {
        for format in [image::ImageFormat::Bmp, image::ImageFormat::Tiff] {
            let mut source = StillImageSource::from_bytes(&encoded(format)).unwrap();
            let frame = source.next_frame().unwrap();
            assert_eq!((frame.width, frame.height), (6, 4), "{format:?}");
            // Pixel (2, 3) survives exactly.
            let idx = (3 * 6 + 2) * 3;
            assert_eq!(&frame.data[idx..idx + 3], &[80, 180, 200], "{format:?}");
        }
    }

    #[test]
    fn pasted_image_decodes_with_or_without_prefix() {
        let png = encoded(image::ImageFormat::Png);
        let b64 = general_purpose::STANDARD.encode(&png);

        for text in [
            format!("data:image/png;base64,{b64}"),
            b64.clone(),
            format!("  {}\n{}  ", &b64[..8], &b64[8..]),
        ] {
            let mut source = StillImageSource::from_data_url(&text).unwrap();
            assert_eq!(source.info().width, 6);
            assert!(source.next_frame().is_some());
        }
    }

    #[test]
    fn malformed_pasted_image_is_unreadable() {
        assert!(matches!(
            StillImageSource::from_data_url("data:image/png;base64,@@not-base64@@"),
            Err(PipelineError::MediaUnreadable(_))
        ));
        // Valid base64, not an image.
        let text = general_purpose::STANDARD.encode(b"hello");
        assert!(matches!(
            StillImageSource::from_data_url(&text),
            Err(PipelineError::MediaUnreadable(_))
        ));
    }

    #[test]
    fn image_sink_round_trips_plain_frame() {
        // Smooth gradient keeps JPEG error small.
        let (w, h) = (32u32, 24u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x * 4) as u8, (y * 5) as u8, 128]);
            }
        }
        let frame = RgbFrame::new(data, w, h);

        let mut sink = ImageSink::new(95);
        sink.write_frame(&frame).unwrap();
        let bytes = sink.finish().unwrap();

        let mut decoded = StillImageSource::from_bytes(&bytes).unwrap();
        let back = decoded.next_frame().unwrap();
        assert_eq!((back.width, back.height), (w, h));
        let max_diff = frame
            .data
            .iter()
            .zip(&back.data)
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap();
        assert!(max_diff <= 12, "max channel diff {max_diff}");
    }

    #[test]
    fn image_sink_takes_one_frame() {
        let frame = RgbFrame::filled(4, 4, [1, 2, 3]);
        let mut sink = ImageSink::new(90);
        sink.write_frame(&frame).unwrap();
        assert!(matches!(
            sink.write_frame(&frame),
            Err(PipelineError::SinkClosed)
        ));
    }

    #[test]
    fn empty_image_sink_cannot_finish() {
        assert!(ImageSink::new(90).finish().is_err());
    }

    #[test]
    fn geometry_rejects_mismatched_frames() {
        let geometry = FrameGeometry {
            width: 8,
            height: 6,
        };
        assert!(geometry.check(&RgbFrame::filled(8, 6, [0; 3])).is_ok());
        assert!(matches!(
            geometry.check(&RgbFrame::filled(6, 8, [0; 3])),
            Err(PipelineError::DimensionMismatch {
                actual_width: 6,
                actual_height: 8,
                ..
            })
        ));
        let short = RgbFrame::new(vec![0; 10], 8, 6);
        assert!(matches!(
            geometry.check(&short),
            Err(PipelineError::MalformedFrame { .. })
        ));
    }
}
