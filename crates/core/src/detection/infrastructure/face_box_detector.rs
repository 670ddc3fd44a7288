//! BlazeFace short-range face box detector using ONNX Runtime via `ort`.
//!
//! First stage of the built-in face-mesh engine: produces scored face
//! boxes in frame pixels, no landmarks.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;

use crate::detection::infrastructure::execution_provider::{
    build_session, providers_for, ProviderError,
};
use crate::detection::infrastructure::math::{nms, sigmoid, RawDetection};
use crate::shared::frame::Frame;

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f32 = 0.3;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Values per anchor row in the regressor output: 4 box deltas followed
/// by 6 keypoint pairs.
const REGRESSOR_COLS: usize = 16;

pub struct FaceBoxDetector {
    session: Mutex<Session>,
    min_confidence: f32,
    anchors: Vec<[f32; 2]>,
}

impl FaceBoxDetector {
    pub fn new(
        model_path: &Path,
        min_confidence: f32,
        use_gpu: bool,
    ) -> Result<Self, ProviderError> {
        let session = build_session("face_box", model_path, providers_for(use_gpu))?;
        Ok(Self {
            session: Mutex::new(session),
            min_confidence,
            anchors: generate_anchors(),
        })
    }

    /// Scored face boxes in original frame pixels, best first.
    pub fn detect_boxes(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        let input_tensor = preprocess(frame, INPUT_SIZE);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("face box session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;

        // BlazeFace outputs two tensors:
        // - regressors: [1, 896, 16] (box deltas + keypoints)
        // - classificators: [1, 896, 1] (confidence scores)
        if outputs.len() < 2 {
            return Err(
                format!("BlazeFace model expected 2 outputs, got {}", outputs.len()).into(),
            );
        }

        let regressors = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let reg_data = regressors.as_slice().ok_or("Cannot get regressor slice")?;
        let score_data = scores.as_slice().ok_or("Cannot get score slice")?;

        let raw = decode_detections(
            reg_data,
            score_data,
            &self.anchors,
            self.min_confidence,
            frame.width(),
            frame.height(),
        );
        Ok(nms(raw, NMS_IOU_THRESH))
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode anchor-relative regressor rows into frame-pixel detections,
/// dropping rows below the confidence floor.
fn decode_detections(
    reg_data: &[f32],
    score_data: &[f32],
    anchors: &[[f32; 2]],
    min_confidence: f32,
    frame_width: u32,
    frame_height: u32,
) -> Vec<RawDetection> {
    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let num_anchors = anchors.len().min(NUM_ANCHORS);

    let mut detections = Vec::new();
    for (i, &raw_score) in score_data.iter().enumerate().take(num_anchors) {
        let score = sigmoid(raw_score);
        if score < min_confidence {
            continue;
        }

        let anchor = &anchors[i];
        let reg_offset = i * REGRESSOR_COLS;
        if reg_offset + 4 > reg_data.len() {
            break;
        }

        // Decode box center + size relative to anchor
        let cx = anchor[0] + reg_data[reg_offset] / INPUT_SIZE as f32;
        let cy = anchor[1] + reg_data[reg_offset + 1] / INPUT_SIZE as f32;
        let w = reg_data[reg_offset + 2] / INPUT_SIZE as f32;
        let h = reg_data[reg_offset + 3] / INPUT_SIZE as f32;

        let x1 = ((cx - w / 2.0) * fw).max(0.0);
        let y1 = ((cy - h / 2.0) * fh).max(0.0);
        let x2 = ((cx + w / 2.0) * fw).min(fw);
        let y2 = ((cy + h / 2.0) * fh).min(fh);

        detections.push(RawDetection::new(x1, y1, x2, y2, score));
    }
    detections
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Resize frame to `size × size` and normalize to [0,1] NCHW float32.
fn preprocess(frame: &Frame, size: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;
    let s = size as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));

    for y in 0..s {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / s as f64) as usize).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / s as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    tensor
}

// ---------------------------------------------------------------------------
// Anchor generation (BlazeFace short-range)
// ---------------------------------------------------------------------------

/// Generate BlazeFace anchors for the short-range model.
///
/// The short-range model uses two feature map sizes: 16×16 and 8×8,
/// with 2 and 6 anchors per cell respectively.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)]; // (stride, anchors_per_cell)
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
