//! Built-in face engine: BlazeFace boxes, dense landmark mesh, and
//! expression coefficients, with whole-result throttling.
//!
//! Between throttle phases `detect` returns the previous result set
//! unchanged; the first call always computes.

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::FaceMeshConfig;
use crate::detection::domain::regressors::{ExpressionRegressor, MeshRegressor};
use crate::detection::infrastructure::blendshape_extractor::BlendshapeExtractor;
use crate::detection::infrastructure::execution_provider::ensure_accelerated;
use crate::detection::infrastructure::face_box_detector::FaceBoxDetector;
use crate::detection::infrastructure::face_landmarker::FaceLandmarker;
use crate::detection::infrastructure::math::RawDetection;
use crate::detection::infrastructure::model_fetcher;
use crate::detection::infrastructure::throttle::ThrottleCounter;
use crate::shared::bbox::BBox;
use crate::shared::constants::{FACE_BOX_MODEL_NAME, FACE_BOX_MODEL_URL};
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::Frame;

const SOURCE_TAG: &str = "mediapipe";

/// Face box stage seam; lets pipeline stages be swapped independently.
pub(crate) trait BoxStage: Send {
    fn detect_boxes(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>>;
}

impl BoxStage for FaceBoxDetector {
    fn detect_boxes(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
        FaceBoxDetector::detect_boxes(self, frame)
    }
}

pub struct FaceMeshEngine {
    boxes: Box<dyn BoxStage>,
    mesh: Box<dyn MeshRegressor>,
    expression: Box<dyn ExpressionRegressor>,
    throttle: ThrottleCounter,
    max_faces: usize,
    last_result: Option<Vec<DetectionRecord>>,
}

impl FaceMeshEngine {
    pub fn from_config(config: &FaceMeshConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if config.use_gpu {
            ensure_accelerated(SOURCE_TAG)?;
        }
        let model_dir = config.model_dir.as_deref();
        let box_model =
            model_fetcher::resolve(FACE_BOX_MODEL_NAME, FACE_BOX_MODEL_URL, model_dir, None)?;
        let boxes = FaceBoxDetector::new(&box_model, config.min_confidence, config.use_gpu)?;
        let mesh = FaceLandmarker::new(
            config.mesh_model_override.as_deref(),
            model_dir,
            config.use_gpu,
        )?;
        let expression =
            BlendshapeExtractor::new(config.checkpoint_override.as_deref(), model_dir)?;

        Ok(Self::with_stages(
            Box::new(boxes),
            Box::new(mesh),
            Box::new(expression),
            config.throttle_interval,
            config.max_faces,
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
            max_faces,
            last_result: None,
        }
    }

    fn compute(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let mut detections = self.boxes.detect_boxes(frame)?;
        detections.truncate(self.max_faces);

        let mut records = Vec::with_capacity(detections.len());
        for det in &detections {
            let bbox = BBox::from_corners(det.x1, det.y1, det.x2, det.y2)
                .clamped(frame.width(), frame.height());
            if bbox.is_empty() {
                continue;
            }

            let landmarks = match self.mesh.regress(frame, &bbox) {
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
                        log::warn!("blendshape extraction failed for face at {bbox:?}: {e}");
                        None
                    }
                }
            };

            records.push(
                DetectionRecord::new(bbox, SOURCE_TAG, "face", det.score)
                    .with_landmarks(landmarks)
                    .with_blendshapes(blendshapes),
            );
        }
        Ok(records)
    }
}

impl Detector for FaceMeshEngine {
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
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::blendshapes::Blendshapes;

    /// Cycles through canned box sets; each fresh compute consumes the
    /// next one, so result positions reveal when recomputes happened.
    struct FakeBoxes {
        results: Vec<Vec<RawDetection>>,
        call_count: usize,
    }

    impl FakeBoxes {
        fn new(results: Vec<Vec<RawDetection>>) -> Self {
            Self {
                results,
                call_count: 0,
            }
        }
    }

    impl BoxStage for FakeBoxes {
        fn detect_boxes(
            &mut self,
            _frame: &Frame,
        ) -> Result<Vec<RawDetection>, Box<dyn std::error::Error>> {
            let result = self.results[self.call_count % self.results.len()].clone();
            self.call_count += 1;
            Ok(result)
        }
    }

    struct FakeMesh {
        fail: bool,
    }

    impl MeshRegressor for FakeMesh {
        fn regress(
            &mut self,
            _frame: &Frame,
            bbox: &BBox,
        ) -> Result<Vec<[f32; 3]>, Box<dyn std::error::Error>> {
            if self.fail {
                return Err("mesh stage down".into());
            }
            Ok(vec![[bbox.x as f32, bbox.y as f32, 0.0]; 478])
        }
    }

    struct FakeExpression;

    impl ExpressionRegressor for FakeExpression {
        fn extract(
            &mut self,
            _landmarks: &[[f32; 3]],
            _frame_width: u32,
            _frame_height: u32,
        ) -> Result<Option<Blendshapes>, Box<dyn std::error::Error>> {
            Ok(Blendshapes::from_coefficients(&[0.25; 52]))
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 256 * 256 * 3], 256, 256, 3, 0)
    }

    fn face_at(x: f32) -> Vec<RawDetection> {
        vec![RawDetection::new(x, 10.0, x + 30.0, 40.0, 0.9)]
    }

    fn engine_with(
        results: Vec<Vec<RawDetection>>,
        interval: u32,
        max_faces: usize,
    ) -> FaceMeshEngine {
        FaceMeshEngine::with_stages(
            Box::new(FakeBoxes::new(results)),
            Box::new(FakeMesh { fail: false }),
            Box::new(FakeExpression),
            interval,
            max_faces,
        )
    }

    #[test]
    fn test_detect_builds_full_records() {
        let mut engine = engine_with(vec![face_at(10.0)], 1, 8);

        let records = engine.detect(&frame()).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.source_detector, "mediapipe");
        assert_eq!(rec.label, "face");
        assert_eq!(rec.bbox, BBox::new(10, 10, 30, 30));
        assert_eq!(rec.landmarks.len(), 478);
        assert!(rec.blendshapes.is_some());
        assert!(rec.eos.is_none());
    }

    #[test]
    fn test_throttle_computes_on_phase_and_first_call() {
        // The fake advances x on every real compute. Interval 3 opens at
        // calls 3, 6, 9; call 1 computes anyway since nothing is cached.
        let results = vec![face_at(10.0), face_at(50.0), face_at(90.0), face_at(130.0)];
        let mut engine = engine_with(results, 3, 8);

        let xs: Vec<i32> = (0..9)
            .map(|_| engine.detect(&frame()).unwrap()[0].bbox.x)
            .collect();
        assert_eq!(xs, vec![10, 10, 50, 50, 50, 90, 90, 90, 130]);
    }

    #[test]
    fn test_off_phase_returns_identical_result() {
        let mut engine = engine_with(vec![face_at(10.0), face_at(80.0)], 4, 8);

        let first = engine.detect(&frame()).unwrap();
        let second = engine.detect(&frame()).unwrap();
        let third = engine.detect(&frame()).unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn test_interval_one_computes_every_call() {
        let mut engine = engine_with(vec![face_at(10.0), face_at(20.0)], 1, 8);

        let a = engine.detect(&frame()).unwrap()[0].bbox.x;
        let b = engine.detect(&frame()).unwrap()[0].bbox.x;
        let c = engine.detect(&frame()).unwrap()[0].bbox.x;
        assert_eq!((a, b, c), (10, 20, 10));
    }

    #[test]
    fn test_max_faces_caps_records() {
        let many: Vec<RawDetection> = (0..6)
            .map(|i| {
                let offset = i as f32 * 40.0;
                RawDetection::new(offset, 0.0, offset + 20.0, 20.0, 0.9)
            })
            .collect();
        let mut engine = engine_with(vec![many], 1, 2);
        let records = engine.detect(&frame()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_mesh_failure_emits_partial_record() {
        let mut engine = FaceMeshEngine::with_stages(
            Box::new(FakeBoxes::new(vec![face_at(10.0)])),
            Box::new(FakeMesh { fail: true }),
            Box::new(FakeExpression),
            1,
            8,
        );
        let records = engine.detect(&frame()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].landmarks.is_empty());
        assert!(records[0].blendshapes.is_none());
    }

    #[test]
    fn test_no_boxes_yields_empty_result() {
        let mut engine = engine_with(vec![Vec::new()], 1, 8);
        let records = engine.detect(&frame()).unwrap();
        assert!(records.is_empty());
    }
}
