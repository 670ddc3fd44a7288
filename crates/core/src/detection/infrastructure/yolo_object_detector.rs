//! Secondary YOLO object detector over ONNX Runtime.
//!
//! Runs alongside any face engine and contributes COCO-labelled records
//! under its own `source_detector` tag. The model resolves through the
//! registry's path tiers first; when no local copy exists the default
//! artifact is fetched into the cache.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ort::session::Session;

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::ObjectDetectorConfig;
use crate::detection::infrastructure::execution_provider::{build_session, providers_for};
use crate::detection::infrastructure::face_landmarker::parse_declared_dims;
use crate::detection::infrastructure::math::{nms, RawDetection};
use crate::detection::infrastructure::model_fetcher;
use crate::detection::infrastructure::model_registry::{self, ModelRegistryError};
use crate::shared::bbox::BBox;
use crate::shared::constants::{OBJECT_MODEL_NAME, OBJECT_MODEL_URL};
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "yolo";

/// Registry identifier of the default object model.
const OBJECT_MODEL_ID: &str = "yolov8n";

/// Input resolution assumed when the model does not declare a static shape.
const DEFAULT_INPUT_SIZE: u32 = 640;

const NMS_IOU_THRESH: f32 = 0.45;

/// Letterbox padding intensity, the YOLO training convention.
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// COCO class names in model output order.
pub const COCO_LABELS: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub struct YoloObjectDetector {
    session: Mutex<Session>,
    min_confidence: f32,
    input_size: u32,
}

impl YoloObjectDetector {
    pub fn from_config(config: &ObjectDetectorConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let model_path = match model_registry::resolve_model(
            OBJECT_MODEL_ID,
            config.model_override.as_deref(),
            config.model_dir.as_deref(),
        ) {
            Ok(path) => path,
            Err(ModelRegistryError::NotFound { .. }) => model_fetcher::resolve(
                OBJECT_MODEL_NAME,
                OBJECT_MODEL_URL,
                config.model_dir.as_deref(),
                None,
            )?,
            Err(other) => return Err(other.into()),
        };
        let session = build_session(SOURCE_TAG, &model_path, providers_for(config.use_gpu))?;

        let declared = session
            .inputs
            .first()
            .and_then(|input| parse_declared_dims(&format!("{:?}", input.input_type)));
        if declared.is_none() {
            log::debug!(
                "object model declares no static input shape; assuming {DEFAULT_INPUT_SIZE}"
            );
        }
        let (input_size, _) = declared.unwrap_or((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE));

        Ok(Self {
            session: Mutex::new(session),
            min_confidence: config.min_confidence,
            input_size,
        })
    }
}

impl Detector for YoloObjectDetector {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let (input_tensor, scale, pad_x, pad_y) = letterbox(frame, self.input_size);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("object detector session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("object model produced no outputs".into());
        }

        let tensor = outputs[0].try_extract_array::<f32>()?;
        let shape = tensor.shape();
        if shape.len() != 3 {
            return Err(format!("unexpected object model output shape {shape:?}").into());
        }
        // [1, features, detections] (transposed) or [1, detections, features]
        let transposed = shape[1] < shape[2];
        let (num_dets, num_feats) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        let data = tensor.as_slice().ok_or("Cannot get output slice")?;

        let detections = decode_detections(
            data,
            num_dets,
            num_feats,
            transposed,
            self.min_confidence,
            scale,
            pad_x,
            pad_y,
        )?;

        let mut records = Vec::new();
        for (class_id, dets) in group_by_class(detections) {
            for det in nms(dets, NMS_IOU_THRESH) {
                let bbox = BBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                    .clamped(frame.width(), frame.height());
                if bbox.is_empty() {
                    continue;
                }
                records.push(DetectionRecord::new(
                    bbox,
                    SOURCE_TAG,
                    COCO_LABELS[class_id],
                    det.score.min(1.0),
                ));
            }
        }
        Ok(records)
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One decoded detection in frame space, still carrying its class index.
struct ClassedDetection {
    raw: RawDetection,
    class_id: usize,
}

/// Decode YOLO output rows into frame-space detections.
///
/// Two exported row layouts exist: `[cx, cy, w, h, class scores...]` and
/// the older `[cx, cy, w, h, objectness, class scores...]` where the
/// final score is objectness times the class score. The row width picks
/// the layout; any other width is an error.
#[allow(clippy::too_many_arguments)]
fn decode_detections(
    data: &[f32],
    num_dets: usize,
    num_feats: usize,
    transposed: bool,
    min_confidence: f32,
    scale: f64,
    pad_x: u32,
    pad_y: u32,
) -> Result<Vec<ClassedDetection>, Box<dyn std::error::Error>> {
    let class_offset = if num_feats == 4 + COCO_LABELS.len() {
        4
    } else if num_feats == 5 + COCO_LABELS.len() {
        5
    } else {
        return Err(format!(
            "object model rows carry {num_feats} values; expected {} or {}",
            4 + COCO_LABELS.len(),
            5 + COCO_LABELS.len()
        )
        .into());
    };

    let value_at = |det: usize, feat: usize| {
        if transposed {
            data[feat * num_dets + det]
        } else {
            data[det * num_feats + feat]
        }
    };

    let mut detections = Vec::new();
    for i in 0..num_dets {
        let mut best_class = 0;
        let mut best_score = 0.0_f32;
        for class_id in 0..COCO_LABELS.len() {
            let score = value_at(i, class_offset + class_id);
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }
        if class_offset == 5 {
            best_score *= value_at(i, 4);
        }
        if best_score < min_confidence {
            continue;
        }

        let cx = value_at(i, 0);
        let cy = value_at(i, 1);
        let w = value_at(i, 2);
        let h = value_at(i, 3);

        let x1 = ((cx - w / 2.0) as f64 - pad_x as f64) / scale;
        let y1 = ((cy - h / 2.0) as f64 - pad_y as f64) / scale;
        let x2 = ((cx + w / 2.0) as f64 - pad_x as f64) / scale;
        let y2 = ((cy + h / 2.0) as f64 - pad_y as f64) / scale;

        detections.push(ClassedDetection {
            raw: RawDetection::new(x1 as f32, y1 as f32, x2 as f32, y2 as f32, best_score),
            class_id: best_class,
        });
    }
    Ok(detections)
}

/// Suppression runs within a class; a chair overlapping a person is not
/// a duplicate.
fn group_by_class(detections: Vec<ClassedDetection>) -> BTreeMap<usize, Vec<RawDetection>> {
    let mut by_class: BTreeMap<usize, Vec<RawDetection>> = BTreeMap::new();
    for det in detections {
        by_class.entry(det.class_id).or_default().push(det.raw);
    }
    by_class
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Letterbox-resize a frame to `target_size` square, centered, gray
/// padding, values normalized [0,1] NCHW.
///
/// Returns `(tensor, scale, pad_x, pad_y)`.
fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, f64, u32, u32) {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = (fw * scale).round() as u32;
    let new_h = (fh * scale).round() as u32;
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    let mut tensor = ndarray::Array4::<f32>::from_elem(
        (1, 3, target_size as usize, target_size as usize),
        LETTERBOX_FILL,
    );

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;

    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    (tensor, scale, pad_x, pad_y)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
