//! Composite 3D morphable-model engine: YuNet boxes feed a dense
//! landmark mesh whose positions are fit with ridge-regularized PCA
//! coefficients.
//!
//! The fit is orthographic. Landmark and model-mean clouds are both
//! similarity-normalized (centroid at the origin, RMS radius one); the
//! shape basis is solved first and the expression basis on the
//! remaining residual. Box detection runs on every call while the mesh
//! and fit stages follow the spatial-identity throttle, so a stationary
//! face replays its cached coefficients between phases.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::{EnvLookup, EosConfig};
use crate::detection::domain::regressors::MeshRegressor;
use crate::detection::infrastructure::execution_provider::ensure_accelerated;
use crate::detection::infrastructure::face_landmarker::FaceLandmarker;
use crate::detection::infrastructure::face_mesh_engine::BoxStage;
use crate::detection::infrastructure::math::solve_ridge;
use crate::detection::infrastructure::model_fetcher;
use crate::detection::infrastructure::throttle::{SpatialCache, ThrottleCounter};
use crate::detection::infrastructure::yunet_engine::YuNetEngine;
use crate::shared::bbox::BBox;
use crate::shared::constants::{ENV_MORPHABLE_MODEL, MORPHABLE_MODEL_NAME, MORPHABLE_MODEL_URL};
use crate::shared::detection_record::{DetectionRecord, MorphableCoefficients};
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "eos";

#[derive(Error, Debug)]
pub enum MorphableModelError {
    #[error("failed to read morphable model: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse morphable model: {0}")]
    Format(#[from] safetensors::SafeTensorError),
    #[error("bad tensor {name}: {reason}")]
    BadTensor { name: String, reason: String },
}

/// Coefficient fit over a landmark mesh. `Ok(None)` means the system
/// was degenerate or singular for this input; errors are reserved for
/// misconfiguration such as a landmark count the model cannot accept.
pub(crate) trait MorphableFitStage: Send {
    fn fit(
        &mut self,
        landmarks: &[[f32; 3]],
    ) -> Result<Option<MorphableCoefficients>, Box<dyn std::error::Error>>;
}

/// Landmarks and morphable coefficients from one expensive-stage run.
type CachedStages = (Vec<[f32; 3]>, Option<MorphableCoefficients>);

pub struct EosEngine {
    boxes: Box<dyn BoxStage>,
    mesh: Box<dyn MeshRegressor>,
    fit: Box<dyn MorphableFitStage>,
    throttle: ThrottleCounter,
    cache: SpatialCache<CachedStages>,
    max_faces: usize,
}

impl EosEngine {
    pub fn from_config(config: &EosConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if config.use_gpu {
            ensure_accelerated(SOURCE_TAG)?;
        }

        // one GPU decision for the whole composite
        let mut yunet_config = config.yunet.clone();
        yunet_config.use_gpu = config.use_gpu;
        let boxes = YuNetEngine::from_config(&yunet_config)?;

        let mesh = FaceLandmarker::new(
            config.mesh_model_override.as_deref(),
            config.model_dir.as_deref(),
            config.use_gpu,
        )?;
        let fit = RidgeFitter::new(
            config.morphable_model_override.as_deref(),
            config.model_dir.as_deref(),
            config.regularization,
        )?;

        Ok(Self::with_stages(
            Box::new(boxes),
            Box::new(mesh),
            Box::new(fit),
            config.throttle_interval,
            config.yunet.max_faces,
        ))
    }

    pub(crate) fn with_stages(
        boxes: Box<dyn BoxStage>,
        mesh: Box<dyn MeshRegressor>,
        fit: Box<dyn MorphableFitStage>,
        throttle_interval: u32,
        max_faces: usize,
    ) -> Self {
        Self {
            boxes,
            mesh,
            fit,
            throttle: ThrottleCounter::new(throttle_interval),
            cache: SpatialCache::new(),
            max_faces,
        }
    }

    fn run_expensive_stages(&mut self, frame: &Frame, bbox: &BBox) -> CachedStages {
        let landmarks = match self.mesh.regress(frame, bbox) {
            Ok(points) => points,
            Err(e) => {
                log::warn!("landmark regression failed for face at {bbox:?}: {e}");
                Vec::new()
            }
        };
        let coefficients = if landmarks.is_empty() {
            None
        } else {
            match self.fit.fit(&landmarks) {
                Ok(coefficients) => coefficients,
                Err(e) => {
                    log::warn!("morphable fit failed for face at {bbox:?}: {e}");
                    None
                }
            }
        };
        (landmarks, coefficients)
    }
}

impl Detector for EosEngine {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let on_phase = self.throttle.tick();

        // the box stage wants BGR; the mesh stage reads the frame as-is
        let bgr = frame.swapped_rb();
        let mut detections = self.boxes.detect_boxes(&bgr)?;
        detections.truncate(self.max_faces);

        let mut records = Vec::with_capacity(detections.len());
        for det in &detections {
            let bbox = BBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                .clamped(frame.width(), frame.height());
            if bbox.is_empty() {
                continue;
            }
            let key = bbox.corner_key();

            let cached = if on_phase {
                None
            } else {
                self.cache.lookup(&key).cloned()
            };
            let (landmarks, coefficients) = match cached {
                Some(stages) => stages,
                None => {
                    let stages = self.run_expensive_stages(frame, &bbox);
                    self.cache.store(key, stages.clone());
                    stages
                }
            };

            let mut record = DetectionRecord::new(bbox, SOURCE_TAG, "face", det.score.min(1.0))
                .with_landmarks(landmarks);
            if let Some(coefficients) = coefficients {
                record = record.with_eos(coefficients);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

// ---------------------------------------------------------------------------
// Ridge fitter
// ---------------------------------------------------------------------------

/// PCA basis loaded from a safetensors artifact.
///
/// Expected tensors, all f32: `shape.mean` as a flat `[3N]` xyz vector,
/// with `shape.basis` as `[3N, S]` and `expression.basis` as `[3N, E]`
/// in the same point order as the landmark mesh the fitter consumes.
/// Only x and y rows enter the design matrices.
struct MorphableBasis {
    point_count: usize,
    mean_norm: Array1<f32>,
    shape_design: Array2<f32>,
    expression_design: Array2<f32>,
}

impl MorphableBasis {
    fn precompute(
        mean: &[f32],
        shape: &Array2<f32>,
        expression: &Array2<f32>,
    ) -> Result<Self, MorphableModelError> {
        let point_count = mean.len() / 3;
        let n = point_count as f32;

        let mut cx = 0.0_f32;
        let mut cy = 0.0_f32;
        for i in 0..point_count {
            cx += mean[3 * i];
            cy += mean[3 * i + 1];
        }
        cx /= n;
        cy /= n;

        let mut var = 0.0_f32;
        for i in 0..point_count {
            let dx = mean[3 * i] - cx;
            let dy = mean[3 * i + 1] - cy;
            var += dx * dx + dy * dy;
        }
        let scale = (var / n).sqrt();
        if scale <= f32::EPSILON {
            return Err(MorphableModelError::BadTensor {
                name: "shape.mean".to_string(),
                reason: "mean shape collapses to a single 2D point".to_string(),
            });
        }

        let mut mean_norm = Array1::zeros(2 * point_count);
        for i in 0..point_count {
            mean_norm[2 * i] = (mean[3 * i] - cx) / scale;
            mean_norm[2 * i + 1] = (mean[3 * i + 1] - cy) / scale;
        }

        Ok(Self {
            point_count,
            mean_norm,
            shape_design: project_design(shape, point_count, scale),
            expression_design: project_design(expression, point_count, scale),
        })
    }

    fn fit(&self, landmarks: &[[f32; 3]], lambda: f32) -> Option<MorphableCoefficients> {
        let observed = normalize_landmarks(landmarks)?;
        let residual = &observed - &self.mean_norm;

        let shape = solve_ridge(&self.shape_design, &residual, lambda)?;
        let explained = self.shape_design.dot(&shape);
        let expression_residual = &residual - &explained;
        let expression = solve_ridge(&self.expression_design, &expression_residual, lambda)?;

        Some(MorphableCoefficients {
            shape: shape.to_vec(),
            expression: expression.to_vec(),
        })
    }
}

/// Drop the z rows of a `[3N, K]` basis and rescale by the mean shape's
/// RMS radius, matching the normalized space the fit runs in.
fn project_design(basis: &Array2<f32>, point_count: usize, scale: f32) -> Array2<f32> {
    let cols = basis.ncols();
    let mut design = Array2::zeros((2 * point_count, cols));
    for i in 0..point_count {
        for j in 0..cols {
            design[[2 * i, j]] = basis[[3 * i, j]] / scale;
            design[[2 * i + 1, j]] = basis[[3 * i + 1, j]] / scale;
        }
    }
    design
}

/// Similarity-normalize 2D landmark positions: centroid to the origin,
/// RMS radius to one. `None` when every point coincides.
fn normalize_landmarks(landmarks: &[[f32; 3]]) -> Option<Array1<f32>> {
    let n = landmarks.len() as f32;
    let cx = landmarks.iter().map(|p| p[0]).sum::<f32>() / n;
    let cy = landmarks.iter().map(|p| p[1]).sum::<f32>() / n;
    let var = landmarks
        .iter()
        .map(|p| {
            let dx = p[0] - cx;
            let dy = p[1] - cy;
            dx * dx + dy * dy
        })
        .sum::<f32>()
        / n;
    let scale = var.sqrt();
    if scale <= f32::EPSILON {
        return None;
    }

    let mut out = Array1::zeros(2 * landmarks.len());
    for (i, p) in landmarks.iter().enumerate() {
        out[2 * i] = (p[0] - cx) / scale;
        out[2 * i + 1] = (p[1] - cy) / scale;
    }
    Some(out)
}

struct RidgeFitter {
    basis: MorphableBasis,
    lambda: f32,
}

impl RidgeFitter {
    fn new(
        override_path: Option<&Path>,
        model_dir: Option<&Path>,
        lambda: f32,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let path = resolve_model_with(override_path, model_dir, &|key| std::env::var(key).ok())?;
        let basis = load_basis(&path)?;
        log::debug!(
            "morphable model {}: {} points, {} shape and {} expression components",
            path.display(),
            basis.point_count,
            basis.shape_design.ncols(),
            basis.expression_design.ncols()
        );
        Ok(Self { basis, lambda })
    }

    #[cfg(test)]
    fn from_bytes(data: &[u8], lambda: f32) -> Result<Self, MorphableModelError> {
        Ok(Self {
            basis: basis_from_bytes(data)?,
            lambda,
        })
    }
}

impl MorphableFitStage for RidgeFitter {
    fn fit(
        &mut self,
        landmarks: &[[f32; 3]],
    ) -> Result<Option<MorphableCoefficients>, Box<dyn std::error::Error>> {
        if landmarks.len() != self.basis.point_count {
            return Err(format!(
                "morphable model expects {} landmarks, mesh produced {}",
                self.basis.point_count,
                landmarks.len()
            )
            .into());
        }
        Ok(self.basis.fit(landmarks, self.lambda))
    }
}

fn load_basis(path: &Path) -> Result<MorphableBasis, MorphableModelError> {
    let data = fs::read(path)?;
    basis_from_bytes(&data)
}

fn basis_from_bytes(data: &[u8]) -> Result<MorphableBasis, MorphableModelError> {
    let tensors = SafeTensors::deserialize(data)?;

    let mean = vector(&tensors, "shape.mean")?;
    if mean.len() % 3 != 0 || mean.len() < 9 {
        return Err(MorphableModelError::BadTensor {
            name: "shape.mean".to_string(),
            reason: format!(
                "expected a flat xyz vector of at least 3 points, got length {}",
                mean.len()
            ),
        });
    }

    let shape = matrix(&tensors, "shape.basis", mean.len())?;
    let expression = matrix(&tensors, "expression.basis", mean.len())?;
    MorphableBasis::precompute(&mean, &shape, &expression)
}

fn vector(tensors: &SafeTensors, name: &str) -> Result<Vec<f32>, MorphableModelError> {
    let view = tensors.tensor(name)?;
    if view.shape().len() != 1 {
        return Err(MorphableModelError::BadTensor {
            name: name.to_string(),
            reason: format!("expected 1-d vector, got shape {:?}", view.shape()),
        });
    }
    tensor_to_f32(&view, name)
}

fn matrix(tensors: &SafeTensors, name: &str, rows: usize) -> Result<Array2<f32>, MorphableModelError> {
    let view = tensors.tensor(name)?;
    let shape = view.shape().to_vec();
    if shape.len() != 2 || shape[0] != rows || shape[1] == 0 {
        return Err(MorphableModelError::BadTensor {
            name: name.to_string(),
            reason: format!("expected a [{rows}, K] basis, got shape {shape:?}"),
        });
    }
    let values = tensor_to_f32(&view, name)?;
    Array2::from_shape_vec((shape[0], shape[1]), values).map_err(|e| {
        MorphableModelError::BadTensor {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })
}

fn tensor_to_f32(view: &TensorView, name: &str) -> Result<Vec<f32>, MorphableModelError> {
    if view.dtype() != Dtype::F32 {
        return Err(MorphableModelError::BadTensor {
            name: name.to_string(),
            reason: format!("expected f32, got {:?}", view.dtype()),
        });
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn resolve_model_with(
    override_path: Option<&Path>,
    model_dir: Option<&Path>,
    lookup: EnvLookup,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    if let Some(path) = lookup(ENV_MORPHABLE_MODEL).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }
    if let Some(dir) = model_dir {
        let candidate = dir.join(MORPHABLE_MODEL_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(model_fetcher::resolve(
        MORPHABLE_MODEL_NAME,
        MORPHABLE_MODEL_URL,
        model_dir,
        None,
    )?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
