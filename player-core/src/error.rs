//! Boundary error taxonomy for a pipeline run.
//!
//! Codec and ONNX plumbing inside the crate works with `anyhow` and is folded
//! into one of these variants at the module edge, keeping the context chain in
//! the message.

use thiserror::Error;

use crate::pipeline::PipelineState;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input could not be decoded at all (corrupt, empty, unsupported codec).
    #[error("media could not be read: {0}")]
    MediaUnreadable(String),

    /// Video file extension is not in the accepted set.
    #[error("unsupported video format: {0:?}")]
    UnsupportedFormat(String),

    /// A frame handed to a sink does not match the sink's configured size.
    #[error("frame is {actual_width}x{actual_height}, sink expects {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("confidence threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),

    #[error("failed to load detection model: {0}")]
    ModelLoad(String),

    #[error("inference failed on frame {frame}: {message}")]
    Inference { frame: u64, message: String },

    #[error("failed to write output: {0}")]
    SinkWrite(String),

    /// The sink already holds everything it can accept.
    #[error("sink does not accept further frames")]
    SinkClosed,

    /// Raw buffer length disagrees with the frame's width and height.
    #[error("frame buffer holds {len} bytes, expected {expected} for {width}x{height} RGB")]
    MalformedFrame {
        width: u32,
        height: u32,
        len: usize,
        expected: usize,
    },

    #[error("run exceeded its time limit after {frames} frames")]
    TimedOut { frames: u64 },

    #[error("pipeline cannot run from state {0:?}")]
    InvalidState(PipelineState),
}

impl PipelineError {
    /// Whether the failure is something the caller can act on (bad input,
    /// bad parameters) rather than an internal contract violation.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::InvalidState(_)
                | Self::SinkClosed
                | Self::MalformedFrame { .. }
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
