//! Composite expression engine: YuNet boxes, dense landmark mesh, and
//! expression coefficients, with the expensive stages throttled per
//! spatial identity.
//!
//! The box stage runs on every call. Landmark and expression regression
//! compute on throttle phases and whenever a bbox identity has no cache
//! entry, so a newly appeared face never yields a null result. Between
//! phases a stationary face reuses its cached stages under a fresh box.

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::PyFeatConfig;
use crate::detection::domain::regressors::{ExpressionRegressor, MeshRegressor};
use crate::detection::infrastructure::blendshape_extractor::BlendshapeExtractor;
use crate::detection::infrastructure::execution_provider::ensure_accelerated;
use crate::detection::infrastructure::face_landmarker::FaceLandmarker;
use crate::detection::infrastructure::face_mesh_engine::BoxStage;
use crate::detection::infrastructure::throttle::{SpatialCache, ThrottleCounter};
use crate::detection::infrastructure::yunet_engine::YuNetEngine;
use crate::shared::bbox::BBox;
use crate::shared::blendshapes::Blendshapes;
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "composite-pyfeat";

/// Landmarks and expression coefficients from one expensive-stage run.
type CachedStages = (Vec<[f32; 3]>, Option<Blendshapes>);

pub struct PyFeatEngine {
    boxes: Box<dyn BoxStage>,
    mesh: Box<dyn MeshRegressor>,
    expression: Box<dyn ExpressionRegressor>,
    throttle: ThrottleCounter,
    cache: SpatialCache<CachedStages>,
    max_faces: usize,
}

impl PyFeatEngine {
    pub fn from_config(config: &PyFeatConfig) -> Result<Self, Box<dyn std::error::Error>> {
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
        let expression = BlendshapeExtractor::new(
            config.checkpoint_override.as_deref(),
            config.model_dir.as_deref(),
        )?;

        Ok(Self::with_stages(
            Box::new(boxes),
            Box::new(mesh),
            Box::new(expression),
            config.throttle_interval,
            config.yunet.max_faces,
        ))
    }

    pub(crate) fn with_stages(
        boxes: Box<dyn BoxStage>,
        mesh: Box<dyn MeshRegressor>,
        expression: Box<dyn ExpressionRegressor>,
        throttle_interval: u32,
        max_faces: usize,
    ) -> Self {
        Self {
            boxes,
            mesh,
            expression,
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
        let blendshapes = if landmarks.is_empty() {
            None
        } else {
            match self
                .expression
                .extract(&landmarks, frame.width(), frame.height())
            {
                Ok(shapes) => shapes,
                Err(e) => {
                    log::warn!("expression extraction failed for face at {bbox:?}: {e}");
                    None
                }
            }
        };
        (landmarks, blendshapes)
    }
}

impl Detector for PyFeatEngine {
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
            let (landmarks, blendshapes) = match cached {
                Some(stages) => stages,
                None => {
                    let stages = self.run_expensive_stages(frame, &bbox);
                    self.cache.store(key, stages.clone());
                    stages
                }
            };

            records.push(
                DetectionRecord::new(bbox, SOURCE_TAG, "face", det.score.min(1.0))
                    .with_landmarks(landmarks)
                    .with_blendshapes(blendshapes),
            );
        }
        Ok(records)
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
