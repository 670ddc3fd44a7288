//! YuNet face detector (2023mar export) using ONNX Runtime via `ort`.
//!
//! The model emits four heads per stride {8, 16, 32}: `cls_N` and `obj_N`
//! scores per grid cell, `bbox_N` offsets and `kps_N` five-point landmarks.
//! The final score is the geometric mean of the clamped cls/obj pair.
//! Input is BGR, unnormalized, padded to a multiple of the largest stride.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ort::session::{Session, SessionOutputs};

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::YuNetConfig;
use crate::detection::infrastructure::downscale::WorkingCopy;
use crate::detection::infrastructure::execution_provider::{
    build_session, ensure_accelerated, providers_for,
};
use crate::detection::infrastructure::face_mesh_engine::BoxStage;
use crate::detection::infrastructure::math::{nms, RawDetection};
use crate::detection::infrastructure::model_fetcher;
use crate::shared::bbox::BBox;
use crate::shared::constants::{YUNET_MODEL_NAME, YUNET_MODEL_URL};
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::{ColorSpace, Frame};

const SOURCE_TAG: &str = "yunet";

const STRIDES: [u32; 3] = [8, 16, 32];

/// Input dimensions are padded up to a multiple of the largest stride so
/// every head's grid divides the input exactly.
const GRID_ALIGNMENT: u32 = 32;

const NMS_IOU_THRESH: f32 = 0.3;

pub struct YuNetEngine {
    session: Mutex<Session>,
    max_detection_width: u32,
    min_confidence: f32,
    max_faces: usize,
}

impl YuNetEngine {
    pub fn from_config(config: &YuNetConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if config.use_gpu {
            ensure_accelerated(SOURCE_TAG)?;
        }
        let model_path = resolve_yunet_model(
            config.model_override.as_deref(),
            config.model_dir.as_deref(),
        )?;
        let session = build_session(SOURCE_TAG, &model_path, providers_for(config.use_gpu))?;
        Ok(Self {
            session: Mutex::new(session),
            max_detection_width: config.max_detection_width,
            min_confidence: config.min_confidence,
            max_faces: config.max_faces,
        })
    }

    /// Scored face boxes with five keypoints, in original frame pixels.
    ///
    /// Inference runs on a width-capped copy; coordinates are mapped back
    /// before returning.
    pub fn detect_raw(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        let work = WorkingCopy::new(frame, self.max_detection_width);
        let work_frame = work.frame();
        let pad_w = padded_extent(work_frame.width());
        let pad_h = padded_extent(work_frame.height());

        let input_tensor = preprocess(work_frame, pad_w, pad_h);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut raw = Vec::new();
        {
            let mut session = self
                .session
                .lock()
                .map_err(|e| format!("yunet session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![input_value])?;

            for &stride in &STRIDES {
                let cols = (pad_w / stride) as usize;
                let rows = (pad_h / stride) as usize;
                let cls = head_data(&outputs, "cls", stride)?;
                let obj = head_data(&outputs, "obj", stride)?;
                let boxes = head_data(&outputs, "bbox", stride)?;
                let kps = head_data(&outputs, "kps", stride)?;
                raw.extend(decode_stride(
                    stride,
                    cols,
                    rows,
                    &cls,
                    &obj,
                    &boxes,
                    &kps,
                    self.min_confidence,
                ));
            }
        }

        let mut kept = nms(raw, NMS_IOU_THRESH);
        kept.truncate(self.max_faces);

        let sx = work.scale_x() as f32;
        let sy = work.scale_y() as f32;
        Ok(kept
            .into_iter()
            .map(|mut det| {
                det.x1 *= sx;
                det.y1 *= sy;
                det.x2 *= sx;
                det.y2 *= sy;
                for kp in &mut det.keypoints {
                    kp[0] *= sx;
                    kp[1] *= sy;
                }
                det
            })
            .collect())
    }

    fn compute(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let raw = self.detect_raw(frame)?;
        Ok(raw
            .into_iter()
            .map(|det| {
                let bbox = BBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                    .clamped(frame.width(), frame.height());
                (bbox, det.score)
            })
            .filter(|(bbox, _)| !bbox.is_empty())
            .map(|(bbox, score)| DetectionRecord::new(bbox, SOURCE_TAG, "face", score.min(1.0)))
            .collect())
    }
}

impl Detector for YuNetEngine {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        self.compute(frame)
    }

    fn color_space(&self) -> ColorSpace {
        ColorSpace::Bgr
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

impl BoxStage for YuNetEngine {
    fn detect_boxes(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        self.detect_raw(frame)
    }
}

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

fn resolve_yunet_model(
    override_path: Option<&Path>,
    model_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    if let Some(dir) = model_dir {
        let candidate = dir.join(YUNET_MODEL_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(model_fetcher::resolve(
        YUNET_MODEL_NAME,
        YUNET_MODEL_URL,
        model_dir,
        None,
    )?)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn head_data(
    outputs: &SessionOutputs<'_>,
    head: &str,
    stride: u32,
) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let name = format!("{head}_{stride}");
    let value = outputs
        .get(name.as_str())
        .ok_or_else(|| format!("YuNet model output {name} missing"))?;
    let array = value.try_extract_array::<f32>()?;
    let data = array
        .as_slice()
        .ok_or_else(|| format!("Cannot get {name} slice"))?;
    Ok(data.to_vec())
}

/// Decode one stride's grid into working-space detections.
///
/// Cell scores are clamped to [0,1] before the geometric mean; box
/// offsets are cell-relative and sizes log-encoded, both in stride units.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    stride: u32,
    cols: usize,
    rows: usize,
    cls: &[f32],
    obj: &[f32],
    boxes: &[f32],
    kps: &[f32],
    min_confidence: f32,
) -> Vec<RawDetection> {
    let s = stride as f32;
    let cells = (rows * cols).min(cls.len()).min(obj.len());

    let mut detections = Vec::new();
    for idx in 0..cells {
        let score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
        if score < min_confidence {
            continue;
        }

        let box_off = idx * 4;
        if box_off + 4 > boxes.len() {
            break;
        }
        let c = (idx % cols) as f32;
        let r = (idx / cols) as f32;

        let cx = (c + boxes[box_off]) * s;
        let cy = (r + boxes[box_off + 1]) * s;
        let w = boxes[box_off + 2].exp() * s;
        let h = boxes[box_off + 3].exp() * s;

        let mut det = RawDetection::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            score,
        );
        let kp_off = idx * 10;
        if kp_off + 10 <= kps.len() {
            det.keypoints = (0..5)
                .map(|n| {
                    [
                        (kps[kp_off + 2 * n] + c) * s,
                        (kps[kp_off + 2 * n + 1] + r) * s,
                    ]
                })
                .collect();
        }
        detections.push(det);
    }
    detections
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

fn padded_extent(dim: u32) -> u32 {
    ((dim.max(1) - 1) / GRID_ALIGNMENT + 1) * GRID_ALIGNMENT
}

/// NCHW float tensor of raw pixel values, zero-padded right and bottom.
fn preprocess(frame: &Frame, pad_w: u32, pad_h: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, pad_h as usize, pad_w as usize));
    for y in 0..frame.height() as usize {
        for x in 0..frame.width() as usize {
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[y, x, c]] as f32;
            }
        }
    }
    tensor
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
