//! YOLOv8 ONNX detector.
//!
//! Input is a 640×640 NCHW float tensor; output is `[1, 84, 8400]`
//! (4 box coordinates + 80 class scores per proposal).

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{nms, DetectionModel, RawDetection, COCO_CLASSES};
use crate::error::PipelineError;
use crate::video::RgbFrame;

/// YOLOv8 input size (square).
const YOLO_SIZE: u32 = 640;
const NUM_PROPOSALS: usize = 8400;
const NUM_CLASSES: usize = COCO_CLASSES.len();
/// IoU threshold for NMS.
const IOU_THRESHOLD: f32 = 0.7;

struct YoloState {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

/// Wraps the YOLOv8 ONNX session. Inference needs exclusive access to the
/// session and scratch buffers, so concurrent callers take turns on a mutex.
pub struct YoloDetector {
    state: Mutex<YoloState>,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX export from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self, PipelineError> {
        let model_path = model_path.as_ref();
        let session = build_session(model_path)
            .map_err(|e| PipelineError::ModelLoad(format!("{e:#}")))?;
        info!(path = %model_path.display(), "loaded YOLOv8 model");
        Ok(Self {
            state: Mutex::new(YoloState {
                session,
                resizer: fr::Resizer::new(),
                resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
            }),
        })
    }
}

impl DetectionModel for YoloDetector {
    fn infer(&self, frame: &RgbFrame, confidence_threshold: f32) -> Result<Vec<RawDetection>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("YOLOv8 session lock poisoned"))?;
        state.detect(frame, confidence_threshold)
    }

    fn name(&self) -> &str {
        "yolov8"
    }
}

impl YoloState {
    fn detect(&mut self, frame: &RgbFrame, conf_threshold: f32) -> Result<Vec<RawDetection>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("YOLOv8 inference failed")?;

        let (_shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;

        if data.len() != (4 + NUM_CLASSES) * NUM_PROPOSALS {
            return Err(anyhow!(
                "unexpected YOLOv8 output size {} (expected [1, 84, 8400])",
                data.len()
            ));
        }

        let scale_x = frame.width as f32 / YOLO_SIZE as f32;
        let scale_y = frame.height as f32 / YOLO_SIZE as f32;
        let (frame_w, frame_h) = (frame.width as f32, frame.height as f32);

        let candidates: Vec<RawDetection> = (0..NUM_PROPOSALS)
            .into_par_iter()
            .filter_map(|i| {
                // Stored column-major across the 84 rows: [cx, cy, w, h, cls0, cls1, ...]
                let cx = data[i];
                let cy = data[NUM_PROPOSALS + i];
                let w = data[2 * NUM_PROPOSALS + i];
                let h = data[3 * NUM_PROPOSALS + i];

                let (class_id, score) = (0..NUM_CLASSES)
                    .map(|c| (c, data[(4 + c) * NUM_PROPOSALS + i]))
                    .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

                if score < conf_threshold {
                    return None;
                }

                Some(RawDetection {
                    x1: ((cx - w / 2.0) * scale_x).max(0.0),
                    y1: ((cy - h / 2.0) * scale_y).max(0.0),
                    x2: ((cx + w / 2.0) * scale_x).min(frame_w),
                    y2: ((cy + h / 2.0) * scale_y).min(frame_h),
                    confidence: score,
                    class_id,
                })
            })
            .collect();

        let kept = nms(candidates, IOU_THRESHOLD);
        debug!(candidates = kept.len(), "YOLOv8 detections after NMS");
        Ok(kept)
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        resize_to_input(&mut self.resizer, &mut self.resize_buf, frame)?;
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 640, 640].
        let size = (YOLO_SIZE * YOLO_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

/// Stretch `frame` to the square model input inside `buf`. The buffer is only
/// ever borrowed, so a failed resize leaves it usable for the next frame.
fn resize_to_input(resizer: &mut fr::Resizer, buf: &mut Vec<u8>, frame: &RgbFrame) -> Result<()> {
    let src =
        fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
            .context("failed to create fast_image_resize source")?;

    buf.resize((YOLO_SIZE * YOLO_SIZE * 3) as usize, 0);
    let mut dst = fr::images::Image::from_slice_u8(YOLO_SIZE, YOLO_SIZE, buf, fr::PixelType::U8x3)
        .context("failed to create fast_image_resize destination")?;

    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("fast_image_resize YOLO downscale failed")
}

fn build_session(model_path: &Path) -> Result<Session> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Session::builder()
        .context("failed to create ORT session builder")?
        .with_intra_threads(threads)
        .context("failed to set ORT intra threads")?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load YOLOv8 ONNX model {}", model_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_resize_leaves_scratch_buffer_usable() {
        let mut resizer = fr::Resizer::new();
        let mut buf = vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize];

        let truncated = RgbFrame::new(vec![0; 10], 32, 32);
        assert!(resize_to_input(&mut resizer, &mut buf, &truncated).is_err());
        assert_eq!(buf.len(), (YOLO_SIZE * YOLO_SIZE * 3) as usize);

        let frame = RgbFrame::filled(32, 24, [200, 100, 50]);
        resize_to_input(&mut resizer, &mut buf, &frame).unwrap();
        let close = |px: &[u8]| px.iter().zip([200u8, 100, 50]).all(|(a, b)| a.abs_diff(b) <= 1);
        assert!(close(&buf[..3]));
        assert!(close(&buf[buf.len() - 3..]));
    }
}
