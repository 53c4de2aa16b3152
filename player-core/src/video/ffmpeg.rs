//! FFmpeg bridge: a pull decoder for [`VideoStreamSource`] and an H.264/MP4
//! [`VideoSink`].
//!
//! [`VideoStreamSource`]: super::VideoStreamSource

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
    Packet,
};
use tracing::{debug, info};

use super::{FrameDecoder, FrameGeometry, FrameSink, RgbFrame, SourceInfo};
use crate::error::PipelineError;

/// Bilinear is fast and good enough for the colourspace conversions here.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Used when the container reports no usable frame rate.
const FALLBACK_FPS: f64 = 25.0;

// ── Decode ───────────────────────────────────────────────────────────────────

/// Decodes the best video stream of a container into RGB24 frames, one pull
/// at a time. Packets are read on demand so only the current frame is held.
pub struct FfmpegDecoder {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    info: SourceInfo,
    decoded: frame::Video,
    rgb: frame::Video,
    draining: bool,
    produced: u64,
}

impl FfmpegDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&path)
            .with_context(|| format!("could not open {}", path.display()))?;

        let (stream_index, parameters, fps, frame_count) = {
            let stream = ictx
                .streams()
                .best(media::Type::Video)
                .context("no video stream found in input")?;
            (
                stream.index(),
                stream.parameters(),
                stream_fps(&stream),
                estimate_frame_count(&stream),
            )
        };

        let decoder = codec::context::Context::from_parameters(parameters)
            .context("failed to build decoder context")?
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(anyhow!("video stream reports no frame size"));
        }

        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            width,
            height,
            fps,
            frame_count,
            pixel_format = ?decoder.format(),
            "opened input video stream"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            info: SourceInfo {
                width,
                height,
                fps: Some(fps),
                frame_count,
            },
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            draining: false,
            produced: 0,
        })
    }

    fn convert_current(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.info.width as usize;
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width * self.info.height as usize * 3);
        for row in 0..self.info.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.produced as i64);
        self.produced += 1;
        Ok(RgbFrame {
            data,
            width: self.info.width,
            height: self.info.height,
            pts,
        })
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn decode_next(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => return self.convert_current().map(Some),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if self.draining {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to decode frame {}", self.produced))
                }
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .with_context(|| format!("corrupt packet near frame {}", self.produced))?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("failed to flush decoder")?;
                    self.draining = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

fn stream_fps(stream: &format::stream::Stream<'_>) -> f64 {
    let rate = stream.avg_frame_rate();
    if rate.numerator() > 0 && rate.denominator() > 0 {
        f64::from(rate)
    } else {
        FALLBACK_FPS
    }
}

/// `nb_frames` when the muxer set it, otherwise duration × fps, otherwise 0.
fn estimate_frame_count(stream: &format::stream::Stream<'_>) -> u64 {
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

/// Open a video just long enough to read its stream metadata.
pub fn probe<P: AsRef<Path>>(path: P) -> Result<SourceInfo, PipelineError> {
    FfmpegDecoder::open(path.as_ref())
        .map(|d| d.info)
        .map_err(|e| PipelineError::MediaUnreadable(format!("{e:#}")))
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// YUV420p for the widest player support. Chroma subsampling needs even
/// dimensions, so odd-sized sources are encoded 4:4:4 at their own size.
fn encode_format(width: u32, height: u32) -> format::Pixel {
    if width % 2 == 0 && height % 2 == 0 {
        format::Pixel::YUV420P
    } else {
        format::Pixel::YUV444P
    }
}

/// H.264 writer with frame rate and resolution fixed at creation. The file is
/// only complete once [`FrameSink::finish`] has written the trailer.
pub struct VideoSink {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    geometry: FrameGeometry,
    next_pts: i64,
    path: PathBuf,
}

impl VideoSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Self, PipelineError> {
        Self::create_inner(path.as_ref(), fps, width, height)
            .map_err(|e| PipelineError::SinkWrite(format!("{e:#}")))
    }

    /// Sink matching a source's frame rate and resolution.
    pub fn for_source<P: AsRef<Path>>(path: P, info: &SourceInfo) -> Result<Self, PipelineError> {
        Self::create(
            path,
            info.fps.unwrap_or(FALLBACK_FPS),
            info.width,
            info.height,
        )
    }

    fn create_inner(path: &Path, fps: f64, width: u32, height: u32) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            FALLBACK_FPS
        };
        let pixel_format = encode_format(width, height);
        let frame_rate = Rational::from(fps);
        let encoder_time_base = frame_rate.invert();

        let mut octx = format::output(&path)
            .with_context(|| format!("could not create {}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found, is FFmpeg built with libx264?")?;

        let mut builder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("failed to create video encoder")?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(pixel_format);
        builder.set_time_base(encoder_time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let encoder = builder
            .open_as_with(
                codec,
                ffmpeg::Dictionary::from_iter([("crf", "20"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;

        let stream_index = {
            let mut stream = octx.add_stream(codec).context("failed to add video stream")?;
            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);
            stream.index()
        };

        octx.write_header().context("failed to write output header")?;
        // The muxer may pick its own time base while writing the header.
        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .context("output stream vanished after header")?;

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            pixel_format,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(width, height, fps, pixel_format = ?pixel_format, path = %path.display(), "opened output video");

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            encoder_time_base,
            stream_time_base,
            geometry: FrameGeometry { width, height },
            next_pts: 0,
            path: path.to_path_buf(),
        })
    }

    fn encode(&mut self, frame: &RgbFrame) -> Result<()> {
        let row_len = self.geometry.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.geometry.height as usize {
            let dst = row * stride;
            let src = row * row_len;
            plane[dst..dst + row_len].copy_from_slice(&frame.data[src..src + row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.next_pts));

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_packets()?;
        self.next_pts += 1;
        Ok(())
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain_packets(&mut self) -> Result<()> {
        let mut encoded = Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.encoder_time_base, self.stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }

    fn finish_inner(mut self) -> Result<PathBuf> {
        self.encoder.send_eof().context("failed to flush encoder")?;
        self.drain_packets()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.next_pts, path = %self.path.display(), "output video finalised");
        Ok(self.path)
    }
}

impl FrameSink for VideoSink {
    type Output = PathBuf;

    fn write_frame(&mut self, frame: &RgbFrame) -> Result<(), PipelineError> {
        self.geometry.check(frame)?;
        self.encode(frame)
            .map_err(|e| PipelineError::SinkWrite(format!("{e:#}")))?;
        if self.next_pts % 100 == 0 {
            debug!(frames = self.next_pts, "encoded frames");
        }
        Ok(())
    }

    fn finish(self) -> Result<PathBuf, PipelineError> {
        self.finish_inner()
            .map_err(|e| PipelineError::SinkWrite(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_dimensions_keep_full_chroma() {
        assert_eq!(encode_format(64, 48), format::Pixel::YUV420P);
        assert_eq!(encode_format(641, 480), format::Pixel::YUV444P);
        assert_eq!(encode_format(640, 481), format::Pixel::YUV444P);
    }
}
