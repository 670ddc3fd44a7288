use serde::Serialize;

use crate::shared::bbox::BBox;
use crate::shared::blendshapes::Blendshapes;

/// 3D morphable-model fit output: PCA coefficient vectors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MorphableCoefficients {
    pub shape: Vec<f32>,
    pub expression: Vec<f32>,
}

/// One detected face/object in one frame.
///
/// All coordinates (bbox, centroid, landmarks) are original-frame pixels,
/// never a backend's internal working resolution. `landmarks` holds 0, 68
/// or 478 points depending on the backend; `blendshapes` is the full
/// 52-coefficient set or null. Consumers must tolerate partial records.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub bbox: BBox,
    pub centroid: (i32, i32),
    pub source_detector: String,
    pub label: String,
    pub confidence: f32,
    pub landmarks: Vec<[f32; 3]>,
    pub blendshapes: Option<Blendshapes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos: Option<MorphableCoefficients>,
}

impl DetectionRecord {
    pub fn new(bbox: BBox, source_detector: &str, label: &str, confidence: f32) -> Self {
        Self {
            bbox,
            centroid: bbox.centroid(),
            source_detector: source_detector.to_string(),
            label: label.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            landmarks: Vec::new(),
            blendshapes: None,
            eos: None,
        }
    }

    #[must_use]
    pub fn with_landmarks(mut self, landmarks: Vec<[f32; 3]>) -> Self {
        self.landmarks = landmarks;
        self
    }

    #[must_use]
    pub fn with_blendshapes(mut self, blendshapes: Option<Blendshapes>) -> Self {
        self.blendshapes = blendshapes;
        self
    }

    #[must_use]
    pub fn with_eos(mut self, eos: MorphableCoefficients) -> Self {
        self.eos = Some(eos);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_centroid_from_bbox() {
        let rec = DetectionRecord::new(BBox::new(10, 20, 30, 40), "yunet", "face", 0.9);
        assert_eq!(rec.centroid, (25, 40));
        assert_eq!(rec.source_detector, "yunet");
        assert_eq!(rec.label, "face");
    }

    #[test]
    fn test_new_clamps_confidence() {
        let low = DetectionRecord::new(BBox::new(0, 0, 1, 1), "a", "face", -0.5);
        let high = DetectionRecord::new(BBox::new(0, 0, 1, 1), "a", "face", 1.5);
        assert_eq!(low.confidence, 0.0);
        assert_eq!(high.confidence, 1.0);
    }

    #[test]
    fn test_serialization_with_empty_stages() {
        let rec = DetectionRecord::new(BBox::new(1, 2, 3, 4), "haar", "face", 0.8);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["bbox"]["x"], 1);
        assert_eq!(json["bbox"]["w"], 3);
        assert_eq!(json["centroid"][0], 2);
        assert_eq!(json["landmarks"].as_array().unwrap().len(), 0);
        assert!(json["blendshapes"].is_null());
        // absent eos is omitted entirely
        assert!(json.get("eos").is_none());
    }

    #[test]
    fn test_serialization_with_all_stages() {
        let bs = Blendshapes::from_coefficients(&[0.1; 52]).unwrap();
        let rec = DetectionRecord::new(BBox::new(0, 0, 10, 10), "composite-pyfeat", "face", 1.0)
            .with_landmarks(vec![[1.0, 2.0, 3.0]])
            .with_blendshapes(Some(bs))
            .with_eos(MorphableCoefficients {
                shape: vec![0.5],
                expression: vec![-0.5],
            });
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["landmarks"][0][2], 3.0);
        assert_eq!(json["blendshapes"].as_object().unwrap().len(), 52);
        assert_eq!(json["eos"]["shape"][0], 0.5);
        assert_eq!(json["eos"]["expression"][0], -0.5);
    }
}
