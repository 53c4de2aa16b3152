//! report — the structured success/failure record returned to callers

use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;

use crate::detection::Detection;
use crate::error::PipelineError;
use crate::pipeline::PipelineResult;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub total_frames: u64,
    pub total_players: u64,
    /// Present for single-image runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
    /// Base64 of the annotated JPEG, for callers that display it inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl RunReport {
    /// Report for a completed run whose output ended up at `output_path`.
    pub fn completed<O>(result: &PipelineResult<O>, output_path: &Path) -> Self {
        Self {
            success: true,
            message: "Done".into(),
            output_path: Some(output_path.display().to_string()),
            total_frames: result.total_frames,
            total_players: result.total_detections,
            detections: result
                .detections
                .as_ref()
                .map(|batches| batches.iter().flatten().cloned().collect()),
            image: None,
        }
    }

    /// Attach the encoded output so the report carries the picture itself.
    pub fn with_inline_image(mut self, encoded: &[u8]) -> Self {
        self.image = Some(general_purpose::STANDARD.encode(encoded));
        self
    }

    pub fn failed(error: &PipelineError) -> Self {
        let message = if error.is_user_facing() {
            error.to_string()
        } else {
            format!("internal error: {error}")
        };
        Self {
            success: false,
            message,
            output_path: None,
            total_frames: 0,
            total_players: 0,
            detections: None,
            image: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::PixelBox;

    #[test]
    fn completed_image_report_flattens_detections() {
        let det = Detection {
            bbox: PixelBox {
                x1: 10,
                y1: 10,
                x2: 50,
                y2: 50,
            },
            confidence: 0.91,
            class_label: "person".into(),
        };
        let result = PipelineResult {
            total_frames: 1,
            total_detections: 1,
            output: Vec::<u8>::new(),
            detections: Some(vec![vec![det]]),
        };
        let report = RunReport::completed(&result, Path::new("out/annotated.jpg"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["total_players"], 1);
        assert_eq!(json["detections"][0]["bbox"], serde_json::json!([10, 10, 50, 50]));
        assert_eq!(json["output_path"], "out/annotated.jpg");
    }

    #[test]
    fn inline_image_is_base64_of_output() {
        let result = PipelineResult {
            total_frames: 1,
            total_detections: 0,
            output: vec![0xFF, 0xD8, 0xFF],
            detections: Some(vec![Vec::new()]),
        };
        let plain = serde_json::to_value(RunReport::completed(&result, Path::new("a.jpg"))).unwrap();
        assert!(plain.get("image").is_none());

        let report = RunReport::completed(&result, Path::new("a.jpg")).with_inline_image(&result.output);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["image"], "/9j/");
        assert_eq!(json["detections"], serde_json::json!([]));
    }

    #[test]
    fn video_report_omits_detections() {
        let result = PipelineResult {
            total_frames: 15,
            total_detections: 40,
            output: (),
            detections: None,
        };
        let json = serde_json::to_value(RunReport::completed(&result, Path::new("a.mp4"))).unwrap();
        assert!(json.get("detections").is_none());
        assert_eq!(json["total_frames"], 15);
    }

    #[test]
    fn failure_report_carries_message() {
        let report = RunReport::failed(&PipelineError::InvalidThreshold(2.0));
        assert!(!report.success);
        assert_eq!(report.message, "confidence threshold 2 is outside [0, 1]");

        let internal = RunReport::failed(&PipelineError::SinkClosed);
        assert!(internal.message.starts_with("internal error"));
    }
}
