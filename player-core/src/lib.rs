pub mod annotate;
pub mod config;
pub mod detection;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod runtime;
pub mod video;

// Re-export the boundary error so callers only need `player_core::PipelineError`
pub use error::{PipelineError, Result};
