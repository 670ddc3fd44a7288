//! Dense face landmark regressor (478-point mesh) using ONNX Runtime.
//!
//! Runs on a cropped face region and returns points in original-frame
//! pixels. Exported model variants disagree on output conventions, so
//! decoding branches on the magnitude heuristic described at
//! `COORDINATE_ABS_THRESHOLD`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ort::session::Session;

use crate::detection::domain::engine_config::EnvLookup;
use crate::detection::domain::regressors::MeshRegressor;
use crate::detection::infrastructure::execution_provider::{build_session, providers_for};
use crate::detection::infrastructure::model_fetcher;
use crate::shared::bbox::BBox;
use crate::shared::constants::{
    COORDINATE_ABS_THRESHOLD, ENV_FACE_MESH_MODEL, FACE_MESH_MODEL_NAME, FACE_MESH_MODEL_URL,
    MESH_LANDMARK_COUNT,
};
use crate::shared::frame::Frame;

/// Input resolution assumed when the model does not declare a static shape.
const FALLBACK_INPUT_SIZE: u32 = 256;

/// Fraction of the face box added on every side before cropping; the
/// regressor needs forehead/chin context the detector box cuts off.
const CROP_MARGIN: f32 = 0.25;

pub struct FaceLandmarker {
    session: Mutex<Session>,
    input_width: u32,
    input_height: u32,
}

impl FaceLandmarker {
    /// Load the mesh model, resolving it through override path, then the
    /// `FRAMESIGHT_FACE_MESH_MODEL` variable, then conventional locations
    /// (fetching into the cache as a last resort).
    pub fn new(
        override_path: Option<&Path>,
        model_dir: Option<&Path>,
        use_gpu: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let model_path = resolve_mesh_model_with(override_path, model_dir, &|key| {
            std::env::var(key).ok()
        })?;
        let session = build_session("face_mesh", &model_path, providers_for(use_gpu))?;

        let declared = session
            .inputs
            .first()
            .and_then(|input| parse_declared_dims(&format!("{:?}", input.input_type)));
        if declared.is_none() {
            log::debug!(
                "face mesh model declares no static input shape; assuming {FALLBACK_INPUT_SIZE}"
            );
        }
        let (input_width, input_height) =
            declared.unwrap_or((FALLBACK_INPUT_SIZE, FALLBACK_INPUT_SIZE));

        Ok(Self {
            session: Mutex::new(session),
            input_width,
            input_height,
        })
    }
}

impl MeshRegressor for FaceLandmarker {
    fn regress(
        &mut self,
        frame: &Frame,
        bbox: &BBox,
    ) -> Result<Vec<[f32; 3]>, Box<dyn std::error::Error>> {
        let crop = expand_crop(bbox, CROP_MARGIN, frame.width(), frame.height());
        if crop.is_empty() {
            return Ok(Vec::new());
        }

        let input_tensor = crop_resize(frame, &crop, self.input_width, self.input_height);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("face mesh session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;

        let landmarks = outputs[0].try_extract_array::<f32>()?;
        let raw = landmarks.as_slice().ok_or("Cannot get landmark slice")?;

        let points = denormalize_landmarks(
            raw,
            &crop,
            self.input_width,
            self.input_height,
            frame.width(),
            frame.height(),
        );
        Ok(pad_to_mesh(points))
    }
}

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

fn resolve_mesh_model_with(
    override_path: Option<&Path>,
    model_dir: Option<&Path>,
    lookup: EnvLookup,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    if let Some(path) = lookup(ENV_FACE_MESH_MODEL).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }
    if let Some(dir) = model_dir {
        let candidate = dir.join(FACE_MESH_MODEL_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(model_fetcher::resolve(
        FACE_MESH_MODEL_NAME,
        FACE_MESH_MODEL_URL,
        model_dir,
        None,
    )?)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Recover `[N, C, H, W]` from the declared input type; `None` when the
/// shape is absent, symbolic, or dynamic. The dims list reaches us via
/// the type's Debug form, e.g.
/// `Tensor { ty: Float32, dimensions: [1, 3, 256, 256], .. }`.
pub(crate) fn parse_declared_dims(type_repr: &str) -> Option<(u32, u32)> {
    let start = type_repr.find('[')?;
    let end = type_repr[start..].find(']')? + start;
    let dims = type_repr[start + 1..end]
        .split(',')
        .map(|token| token.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    if dims.len() < 4 {
        return None;
    }
    let height = dims[dims.len() - 2];
    let width = dims[dims.len() - 1];
    if height <= 0 || width <= 0 {
        return None;
    }
    Some((width as u32, height as u32))
}

/// Face box grown by `margin` on every side, clamped to the frame.
fn expand_crop(bbox: &BBox, margin: f32, frame_width: u32, frame_height: u32) -> BBox {
    let dx = bbox.width as f32 * margin;
    let dy = bbox.height as f32 * margin;
    BBox::from_corners(
        bbox.x as f32 - dx,
        bbox.y as f32 - dy,
        (bbox.x + bbox.width) as f32 + dx,
        (bbox.y + bbox.height) as f32 + dy,
    )
    .clamped(frame_width, frame_height)
}

/// Map raw regressor output to original-frame pixels.
///
/// Values whose max magnitude exceeds the threshold are absolute pixels in
/// the model's input space; otherwise they are normalized [0,1] over the
/// crop. Both branches add the crop origin and clamp x/y to the frame.
fn denormalize_landmarks(
    raw: &[f32],
    crop: &BBox,
    input_width: u32,
    input_height: u32,
    frame_width: u32,
    frame_height: u32,
) -> Vec<[f32; 3]> {
    let max_abs = raw.iter().fold(0.0_f32, |acc, v| acc.max(v.abs()));
    let absolute = max_abs > COORDINATE_ABS_THRESHOLD;

    let crop_w = crop.width as f32;
    let crop_h = crop.height as f32;
    let (sx, sy) = if absolute {
        (crop_w / input_width as f32, crop_h / input_height as f32)
    } else {
        (crop_w, crop_h)
    };

    raw.chunks_exact(3)
        .map(|p| {
            let x = (p[0] * sx + crop.x as f32).clamp(0.0, frame_width as f32);
            let y = (p[1] * sy + crop.y as f32).clamp(0.0, frame_height as f32);
            let z = p[2] * sx;
            [x, y, z]
        })
        .collect()
}

/// Pad a short mesh up to the full count by repeating the last real
/// point. Output longer than the target is kept as produced.
fn pad_to_mesh(mut points: Vec<[f32; 3]>) -> Vec<[f32; 3]> {
    if points.is_empty() {
        return points;
    }
    while points.len() < MESH_LANDMARK_COUNT {
        let last = points[points.len() - 1];
        points.push(last);
    }
    points
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Resize the crop rect to `out_w × out_h`, normalized [0,1] NCHW float32.
fn crop_resize(frame: &Frame, crop: &BBox, out_w: u32, out_h: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let frame_w = frame.width() as usize;
    let frame_h = frame.height() as usize;
    let ow = out_w as usize;
    let oh = out_h as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, oh, ow));

    for y in 0..oh {
        let src_y = (crop.y as f64 + (y as f64 + 0.5) * crop.height as f64 / oh as f64) as usize;
        let src_y = src_y.min(frame_h - 1);
        for x in 0..ow {
            let src_x =
                (crop.x as f64 + (x as f64 + 0.5) * crop.width as f64 / ow as f64) as usize;
            let src_x = src_x.min(frame_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    tensor
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
