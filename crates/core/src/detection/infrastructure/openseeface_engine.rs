//! OpenSeeFace face tracker port: heatmap face detector plus a sparse
//! landmark regressor, both ONNX sessions.
//!
//! The detection model emits a face-center heatmap alongside its own
//! max-pooled copy; peaks are cells the pooling left unchanged. The
//! landmark model emits per-point heatmaps with two offset channels
//! decoded through a scaled logit. Unlike every other accelerated
//! backend, session creation falls back to CPU on provider failure.

use std::cmp::Ordering;
use std::sync::Mutex;

use ort::session::Session;

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::OpenSeeFaceConfig;
use crate::detection::infrastructure::downscale::WorkingCopy;
use crate::detection::infrastructure::execution_provider::build_session_with_fallback;
use crate::detection::infrastructure::math::RawDetection;
use crate::detection::infrastructure::model_fetcher;
use crate::detection::infrastructure::throttle::ThrottleCounter;
use crate::shared::bbox::BBox;
use crate::shared::constants::{
    OPENSEEFACE_DETECT_MODEL_NAME, OPENSEEFACE_LANDMARK_MODEL_NAME, OPENSEEFACE_MODEL_BASE_URL,
    SPARSE_LANDMARK_COUNT,
};
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "openseeface";

/// Both models take 224x224 inputs.
const INPUT_SIZE: u32 = 224;

/// Detection heatmap resolution (stride 4 over the input).
const DETECT_GRID: usize = 56;

/// Landmark heatmap resolution.
const LANDMARK_GRID: usize = 28;

/// Offset channels carry probabilities; positions recover through
/// `ln(p / (1 - p)) / 16`, in input-resolution units.
const LOGIT_FACTOR: f32 = 16.0;

/// Crop margins around the detected box before landmark regression.
const CROP_MARGIN_X: f32 = 0.1;
const CROP_MARGIN_Y: f32 = 0.125;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct OpenSeeFaceEngine {
    detect_session: Mutex<Session>,
    landmark_session: Mutex<Session>,
    max_detection_width: u32,
    min_confidence: f32,
    max_faces: usize,
    throttle: ThrottleCounter,
    last_result: Option<Vec<DetectionRecord>>,
}

impl OpenSeeFaceEngine {
    pub fn from_config(config: &OpenSeeFaceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let model_dir = config.model_dir.as_deref();
        let detect_path = model_fetcher::resolve(
            OPENSEEFACE_DETECT_MODEL_NAME,
            &format!("{OPENSEEFACE_MODEL_BASE_URL}/{OPENSEEFACE_DETECT_MODEL_NAME}"),
            model_dir,
            None,
        )?;
        let landmark_path = model_fetcher::resolve(
            OPENSEEFACE_LANDMARK_MODEL_NAME,
            &format!("{OPENSEEFACE_MODEL_BASE_URL}/{OPENSEEFACE_LANDMARK_MODEL_NAME}"),
            model_dir,
            None,
        )?;

        let detect_session = build_session_with_fallback(SOURCE_TAG, &detect_path, config.use_gpu)?;
        let landmark_session =
            build_session_with_fallback(SOURCE_TAG, &landmark_path, config.use_gpu)?;

        Ok(Self {
            detect_session: Mutex::new(detect_session),
            landmark_session: Mutex::new(landmark_session),
            max_detection_width: config.max_detection_width,
            min_confidence: config.min_confidence,
            max_faces: config.max_faces,
            throttle: ThrottleCounter::new(config.throttle_interval),
            last_result: None,
        })
    }

    fn compute(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let work = WorkingCopy::new(frame, self.max_detection_width);
        let raw = self.detect_stage(work.frame())?;

        let mut records = Vec::with_capacity(raw.len());
        for det in raw {
            let bbox = work.restore_bbox(
                BBox::from_corners(det.x1, det.y1, det.x2, det.y2),
                frame.width(),
                frame.height(),
            );
            if bbox.is_empty() {
                continue;
            }

            // Landmarks regress on the original frame; only detection pays
            // the downscale.
            let landmarks = match self.landmark_stage(frame, &bbox) {
                Ok(points) => points,
                Err(e) => {
                    log::warn!("openseeface landmark regression failed for face at {bbox:?}: {e}");
                    Vec::new()
                }
            };

            records.push(
                DetectionRecord::new(bbox, SOURCE_TAG, "face", det.score.min(1.0))
                    .with_landmarks(landmarks),
            );
        }
        Ok(records)
    }

    fn detect_stage(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        let full = BBox::new(0, 0, frame.width() as i32, frame.height() as i32);
        let input_tensor = preprocess_region(frame, &full, INPUT_SIZE);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut session = self
            .detect_session
            .lock()
            .map_err(|e| format!("openseeface detect session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;

        if outputs.len() < 2 {
            return Err(format!(
                "OpenSeeFace detection model expected 2 outputs, got {}",
                outputs.len()
            )
            .into());
        }
        let heatmap = outputs[0].try_extract_array::<f32>()?;
        let pooled = outputs[1].try_extract_array::<f32>()?;
        let heat = heatmap.as_slice().ok_or("Cannot get heatmap slice")?;
        let pool = pooled.as_slice().ok_or("Cannot get maxpool slice")?;

        Ok(decode_heatmap(
            heat,
            pool,
            self.min_confidence,
            self.max_faces,
            frame.width(),
            frame.height(),
        ))
    }

    fn landmark_stage(
        &mut self,
        frame: &Frame,
        bbox: &BBox,
    ) -> Result<Vec<[f32; 3]>, Box<dyn std::error::Error>> {
        let crop = expand_crop(bbox, frame.width(), frame.height());
        if crop.is_empty() {
            return Ok(Vec::new());
        }

        let input_tensor = preprocess_region(frame, &crop, INPUT_SIZE);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut session = self
            .landmark_session
            .lock()
            .map_err(|e| format!("openseeface landmark session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;

        let tensor = outputs[0].try_extract_array::<f32>()?;
        let data = tensor.as_slice().ok_or("Cannot get landmark slice")?;

        Ok(pad_landmarks(decode_landmarks(data, &crop)))
    }
}

impl Detector for OpenSeeFaceEngine {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let on_phase = self.throttle.tick();
        if on_phase || self.last_result.is_none() {
            let records = self.compute(frame)?;
            self.last_result = Some(records);
        }
        // last_result is always Some here
        Ok(self.last_result.clone().unwrap_or_default())
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Peaks of the center heatmap, best first, as frame-pixel detections.
///
/// A cell is a peak when max pooling left its value unchanged; the second
/// heatmap channel holds the face radius as a fraction of half the input.
fn decode_heatmap(
    heat: &[f32],
    pool: &[f32],
    min_confidence: f32,
    max_faces: usize,
    frame_width: u32,
    frame_height: u32,
) -> Vec<RawDetection> {
    let cells = DETECT_GRID * DETECT_GRID;
    if heat.len() < 2 * cells || pool.len() < cells {
        return Vec::new();
    }
    let stride = (INPUT_SIZE as usize / DETECT_GRID) as f32;
    let sx = frame_width as f32 / INPUT_SIZE as f32;
    let sy = frame_height as f32 / INPUT_SIZE as f32;

    let mut peaks: Vec<(usize, f32)> = (0..cells)
        .filter(|&i| (heat[i] - pool[i]).abs() < 1e-4)
        .map(|i| (i, heat[i]))
        .filter(|&(_, score)| score >= min_confidence)
        .collect();
    peaks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    peaks.truncate(max_faces);

    peaks
        .into_iter()
        .map(|(idx, score)| {
            let x = (idx % DETECT_GRID) as f32 * stride;
            let y = (idx / DETECT_GRID) as f32 * stride;
            let r = heat[cells + idx] * (INPUT_SIZE as f32 / 2.0);
            RawDetection::new((x - r) * sx, (y - r) * sy, (x + r) * sx, (y + r) * sy, score)
        })
        .collect()
}

fn logit(p: f32) -> f32 {
    let p = p.clamp(1e-7, 1.0 - 1e-7);
    (p / (1.0 - p)).ln() / LOGIT_FACTOR
}

/// Landmark tensor layout: `count` heatmap channels, then `count` row
/// offsets, then `count` column offsets, all on the same grid. The point
/// count comes from the channel count, so model variants with more or
/// fewer points decode unchanged. The third output component is the
/// heatmap confidence.
fn decode_landmarks(data: &[f32], crop: &BBox) -> Vec<[f32; 3]> {
    let cells = LANDMARK_GRID * LANDMARK_GRID;
    let count = data.len() / cells / 3;
    if count == 0 {
        return Vec::new();
    }
    let res1 = (INPUT_SIZE - 1) as f32;
    let grid1 = (LANDMARK_GRID - 1) as f32;
    let scale_x = crop.width as f32 / INPUT_SIZE as f32;
    let scale_y = crop.height as f32 / INPUT_SIZE as f32;

    (0..count)
        .map(|i| {
            let heat = &data[i * cells..(i + 1) * cells];
            let (best, conf) = argmax(heat);
            let cell_y = (best / LANDMARK_GRID) as f32;
            let cell_x = (best % LANDMARK_GRID) as f32;
            let off_y = logit(data[(count + i) * cells + best]);
            let off_x = logit(data[(2 * count + i) * cells + best]);

            let x = res1 * (cell_x / grid1 + off_x);
            let y = res1 * (cell_y / grid1 + off_y);
            [
                crop.x as f32 + x * scale_x,
                crop.y as f32 + y * scale_y,
                conf,
            ]
        })
        .collect()
}

fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    (best, best_value)
}

/// Pads a short landmark set up to the sparse count by replicating the
/// last point. The reference tracker fills the final two slots from a
/// separate gaze network this engine does not carry.
fn pad_landmarks(mut points: Vec<[f32; 3]>) -> Vec<[f32; 3]> {
    if points.is_empty() {
        return points;
    }
    while points.len() < SPARSE_LANDMARK_COUNT {
        let last = points[points.len() - 1];
        points.push(last);
    }
    points
}

fn expand_crop(bbox: &BBox, frame_width: u32, frame_height: u32) -> BBox {
    let mx = bbox.width as f32 * CROP_MARGIN_X;
    let my = bbox.height as f32 * CROP_MARGIN_Y;
    BBox::from_corners(
        bbox.x as f32 - mx,
        bbox.y as f32 - my,
        (bbox.x + bbox.width) as f32 + mx,
        (bbox.y + bbox.height) as f32 + my,
    )
    .clamped(frame_width, frame_height)
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Center-sampled resize of `region` to `size x size`, normalized with
/// ImageNet statistics, NCHW.
fn preprocess_region(frame: &Frame, region: &BBox, size: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let max_x = frame.width() as i64 - 1;
    let max_y = frame.height() as i64 - 1;
    let s = size as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));
    for y in 0..s {
        let src_y = region.y as f64 + (y as f64 + 0.5) * region.height as f64 / s as f64;
        let src_y = (src_y as i64).clamp(0, max_y) as usize;
        for x in 0..s {
            let src_x = region.x as f64 + (x as f64 + 0.5) * region.width as f64 / s as f64;
            let src_x = (src_x as i64).clamp(0, max_x) as usize;
            for c in 0..3 {
                let value = src[[src_y, src_x, c]] as f32 / 255.0;
                tensor[[0, c, y, x]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }
    tensor
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
