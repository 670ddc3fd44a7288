//! InsightFace `buffalo_l` detector. GPU-only: construction fails hard
//! when GPU use is disabled or the accelerated provider is absent.
//!
//! Detection is SCRFD: three strides, each with a score head and a
//! distance-to-border box head, two anchors per grid point. The frame is
//! letterboxed into a square input with aspect ratio preserved. The pack
//! directory is validated as a unit; an incomplete or unloadable pack is
//! quarantined and re-fetched exactly once before giving up.

use std::path::Path;
use std::sync::Mutex;

use ort::session::{Session, SessionOutputs};

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::InsightFaceConfig;
use crate::detection::infrastructure::downscale::WorkingCopy;
use crate::detection::infrastructure::execution_provider::{
    build_session, providers_for, require_gpu,
};
use crate::detection::infrastructure::math::{nms, RawDetection};
use crate::detection::infrastructure::model_fetcher;
use crate::shared::bbox::BBox;
use crate::shared::constants::{INSIGHTFACE_PACK_FILES, INSIGHTFACE_PACK_NAME};
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "insightface";

/// SCRFD square input edge.
const INPUT_SIZE: u32 = 640;

const STRIDES: [usize; 3] = [8, 16, 32];

const NMS_IOU_THRESH: f32 = 0.4;

/// Pixel normalization: `(value - 127.5) / 128`. Letterbox padding is
/// black, so padded cells sit at the normalized floor.
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;

pub struct InsightFaceEngine {
    session: Mutex<Session>,
    max_detection_width: u32,
    min_confidence: f32,
    max_faces: usize,
}

impl InsightFaceEngine {
    pub fn from_config(config: &InsightFaceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        require_gpu(SOURCE_TAG, config.use_gpu)?;

        let pack_dir = match &config.pack_dir {
            Some(dir) => dir.clone(),
            None => model_fetcher::model_cache_dir()?.join(INSIGHTFACE_PACK_NAME),
        };
        let session = recover_once(&pack_dir, |dir| init_pack(dir, config.use_gpu))?;

        Ok(Self {
            session: Mutex::new(session),
            max_detection_width: config.max_detection_width,
            min_confidence: config.min_confidence,
            max_faces: config.max_faces,
        })
    }

    fn detect_raw(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        let work = WorkingCopy::new(frame, self.max_detection_width);
        let work_frame = work.frame();

        let det_scale = (INPUT_SIZE as f32 / work_frame.width() as f32)
            .min(INPUT_SIZE as f32 / work_frame.height() as f32);
        let input_tensor = preprocess_letterbox(work_frame, det_scale);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let candidates = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| format!("insightface session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![input_value])?;

            if outputs.len() < 2 * STRIDES.len() {
                return Err(format!(
                    "SCRFD model expected at least {} outputs, got {}",
                    2 * STRIDES.len(),
                    outputs.len()
                )
                .into());
            }

            // Outputs are positional: score heads first, then box heads,
            // stride-ascending within each group.
            let mut all = Vec::new();
            for (i, &stride) in STRIDES.iter().enumerate() {
                let scores = output_slice(&outputs, i)?;
                let deltas = output_slice(&outputs, i + STRIDES.len())?;
                all.extend(decode_stride(stride, &scores, &deltas, self.min_confidence));
            }
            all
        };

        let mut detections = nms(candidates, NMS_IOU_THRESH);
        detections.truncate(self.max_faces);

        // Undo the letterbox, then the width cap.
        let sx = work.scale_x() as f32 / det_scale;
        let sy = work.scale_y() as f32 / det_scale;
        for det in &mut detections {
            det.x1 *= sx;
            det.y1 *= sy;
            det.x2 *= sx;
            det.y2 *= sy;
        }
        Ok(detections)
    }
}

impl Detector for InsightFaceEngine {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let raw = self.detect_raw(frame)?;
        let mut records = Vec::with_capacity(raw.len());
        for det in raw {
            let bbox = BBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                .clamped(frame.width(), frame.height());
            if bbox.is_empty() {
                continue;
            }
            records.push(DetectionRecord::new(
                bbox,
                SOURCE_TAG,
                "face",
                det.score.min(1.0),
            ));
        }
        Ok(records)
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

/// Fetches the pack if missing, validates completeness, and loads the
/// SCRFD detector. The auxiliary dense-landmark file is part of the
/// completeness check but no session is built on it.
fn init_pack(pack_dir: &Path, use_gpu: bool) -> Result<Session, Box<dyn std::error::Error>> {
    model_fetcher::ensure_pack(pack_dir, INSIGHTFACE_PACK_FILES)?;
    let model_path = pack_dir.join(INSIGHTFACE_PACK_FILES[0].0);
    Ok(build_session(SOURCE_TAG, &model_path, providers_for(use_gpu))?)
}

/// Runs `init` once; if it fails while the pack directory exists on disk,
/// the directory is quarantined and `init` runs once more against a fresh
/// fetch. The second failure propagates. A failure with no directory
/// present has nothing to quarantine and is immediately fatal.
fn recover_once<T>(
    pack_dir: &Path,
    mut init: impl FnMut(&Path) -> Result<T, Box<dyn std::error::Error>>,
) -> Result<T, Box<dyn std::error::Error>> {
    match init(pack_dir) {
        Ok(value) => Ok(value),
        Err(first) if pack_dir.exists() => {
            log::warn!(
                "model pack at {} failed to initialize: {first}; quarantining and retrying",
                pack_dir.display()
            );
            model_fetcher::quarantine_pack(pack_dir)?;
            init(pack_dir)
        }
        Err(first) => Err(first),
    }
}

fn output_slice(
    outputs: &SessionOutputs<'_>,
    index: usize,
) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let array = outputs[index].try_extract_array::<f32>()?;
    let slice = array
        .as_slice()
        .ok_or_else(|| format!("SCRFD output {index} is not contiguous"))?;
    Ok(slice.to_vec())
}

/// Distance-to-border decode on one stride's grid. Anchor centers sit at
/// `(col, row) * stride`; each grid point carries `scores.len() / points`
/// anchors laid out consecutively. Deltas are (left, top, right, bottom)
/// in stride units.
fn decode_stride(
    stride: usize,
    scores: &[f32],
    deltas: &[f32],
    min_confidence: f32,
) -> Vec<RawDetection> {
    let side = INPUT_SIZE as usize / stride;
    let grid_points = side * side;
    if grid_points == 0 || scores.len() < grid_points {
        return Vec::new();
    }
    let anchors_per_point = scores.len() / grid_points;

    let mut out = Vec::new();
    for point in 0..grid_points {
        let cx = (point % side) as f32 * stride as f32;
        let cy = (point / side) as f32 * stride as f32;
        for anchor in 0..anchors_per_point {
            let idx = point * anchors_per_point + anchor;
            let score = scores[idx];
            if score < min_confidence {
                continue;
            }
            let off = idx * 4;
            if off + 4 > deltas.len() {
                return out;
            }
            let l = deltas[off] * stride as f32;
            let t = deltas[off + 1] * stride as f32;
            let r = deltas[off + 2] * stride as f32;
            let b = deltas[off + 3] * stride as f32;
            out.push(RawDetection::new(cx - l, cy - t, cx + r, cy + b, score));
        }
    }
    out
}

/// Aspect-preserving resize into the top-left of a square input, black
/// padding elsewhere, normalized NCHW.
fn preprocess_letterbox(frame: &Frame, det_scale: f32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let size = INPUT_SIZE as usize;
    let scaled_w = ((frame.width() as f32 * det_scale).round() as usize).min(size);
    let scaled_h = ((frame.height() as f32 * det_scale).round() as usize).min(size);
    let max_x = frame.width() as usize - 1;
    let max_y = frame.height() as usize - 1;

    let padding = (0.0 - PIXEL_MEAN) / PIXEL_SCALE;
    let mut tensor = ndarray::Array4::<f32>::from_elem((1, 3, size, size), padding);
    for y in 0..scaled_h {
        let src_y = (((y as f32 + 0.5) / det_scale) as usize).min(max_y);
        for x in 0..scaled_w {
            let src_x = (((x as f32 + 0.5) / det_scale) as usize).min(max_x);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (src[[src_y, src_x, c]] as f32 - PIXEL_MEAN) / PIXEL_SCALE;
            }
        }
    }
    tensor
}
