//! detection — person detection through a shared, read-only model
//!
//! The model returns every class it knows; [`adapt`] keeps only people above
//! the run's threshold and converts boxes to integer pixel bounds.

mod yolo;

use std::sync::Arc;

use anyhow::Result;
use serde::{Serialize, Serializer};

use crate::config::ConfidenceThreshold;
use crate::video::RgbFrame;

pub use self::yolo::YoloDetector;

/// COCO class index for "person".
pub const PERSON_CLASS: usize = 0;

/// The 80 COCO class names, indexed by class id.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

pub fn class_name(class_id: usize) -> &'static str {
    COCO_CLASSES.get(class_id).copied().unwrap_or("unknown")
}

/// One candidate straight from the model, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl RawDetection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &RawDetection) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }
}

/// Integer pixel bounds, both corners inclusive. Serialises as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Serialize for PixelBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: PixelBox,
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_label: String,
}

/// Detections for one frame, in model output order.
pub type DetectionBatch = Vec<Detection>;

/// A loaded detector. Implementations must be callable from several pipeline
/// runs at once; one that is not internally thread-safe serialises calls
/// behind its own lock.
pub trait DetectionModel: Send + Sync {
    /// Candidates of every class found in `frame`. The model may use
    /// `confidence_threshold` as an inference gate.
    fn infer(&self, frame: &RgbFrame, confidence_threshold: f32) -> Result<Vec<RawDetection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// Process-wide model handle injected into every pipeline.
pub type SharedModel = Arc<dyn DetectionModel>;

/// Keep person candidates at or above `threshold`, truncating box coordinates
/// to whole pixels.
pub fn adapt(raw: &[RawDetection], threshold: ConfidenceThreshold) -> DetectionBatch {
    let threshold = threshold.value();
    raw.iter()
        .filter(|c| c.class_id == PERSON_CLASS && c.confidence >= threshold)
        .map(|c| Detection {
            bbox: PixelBox {
                x1: c.x1 as i32,
                y1: c.y1 as i32,
                x2: c.x2 as i32,
                y2: c.y2 as i32,
            },
            confidence: c.confidence,
            class_label: class_name(c.class_id).to_string(),
        })
        .collect()
}

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
pub(crate) fn nms(mut boxes: Vec<RawDetection>, iou_thresh: f32) -> Vec<RawDetection> {
    boxes.sort_unstable_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].class_id == boxes[j].class_id && boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}
