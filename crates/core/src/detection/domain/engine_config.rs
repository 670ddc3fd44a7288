use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::shared::constants::{
    DEFAULT_MAX_DETECTION_WIDTH, DEFAULT_MAX_FACES, DEFAULT_MIN_CONFIDENCE,
    DEFAULT_THROTTLE_INTERVAL, ENV_BLENDSHAPE_CHECKPOINT, ENV_FACE_MESH_MODEL, ENV_HAAR_CASCADE,
    ENV_HAAR_SCALE_FACTOR, ENV_INSIGHTFACE_DIR, ENV_MAX_DETECTION_WIDTH, ENV_MAX_FACES,
    ENV_MIN_CONFIDENCE, ENV_MODEL_DIR, ENV_MORPHABLE_MODEL, ENV_OPENSEEFACE_DIR,
    ENV_THROTTLE_INTERVAL, ENV_YUNET_MODEL,
};

// Engine code never touches the process environment; each engine receives
// one of these value objects, normally built via `from_env()`. The lookup
// seam keeps construction testable without mutating global state.

pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn path_from(lookup: EnvLookup, key: &str) -> Option<PathBuf> {
    lookup(key).map(PathBuf::from)
}

fn parse_from<T: FromStr>(lookup: EnvLookup, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Built-in face-mesh engine settings.
#[derive(Clone, Debug)]
pub struct FaceMeshConfig {
    pub model_dir: Option<PathBuf>,
    pub mesh_model_override: Option<PathBuf>,
    pub checkpoint_override: Option<PathBuf>,
    pub min_confidence: f32,
    pub max_faces: usize,
    pub throttle_interval: u32,
    pub use_gpu: bool,
}

impl Default for FaceMeshConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            mesh_model_override: None,
            checkpoint_override: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_faces: DEFAULT_MAX_FACES,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            use_gpu: false,
        }
    }
}

impl FaceMeshConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            mesh_model_override: path_from(lookup, ENV_FACE_MESH_MODEL),
            checkpoint_override: path_from(lookup, ENV_BLENDSHAPE_CHECKPOINT),
            min_confidence: parse_from(lookup, ENV_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE),
            max_faces: parse_from(lookup, ENV_MAX_FACES, DEFAULT_MAX_FACES),
            throttle_interval: parse_from(lookup, ENV_THROTTLE_INTERVAL, DEFAULT_THROTTLE_INTERVAL),
            use_gpu: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenSeeFaceConfig {
    pub model_dir: Option<PathBuf>,
    pub max_detection_width: u32,
    pub min_confidence: f32,
    pub max_faces: usize,
    pub throttle_interval: u32,
    pub use_gpu: bool,
}

impl Default for OpenSeeFaceConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            max_detection_width: DEFAULT_MAX_DETECTION_WIDTH,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_faces: DEFAULT_MAX_FACES,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            use_gpu: false,
        }
    }
}

impl OpenSeeFaceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            model_dir: path_from(lookup, ENV_OPENSEEFACE_DIR),
            max_detection_width: parse_from(
                lookup,
                ENV_MAX_DETECTION_WIDTH,
                DEFAULT_MAX_DETECTION_WIDTH,
            ),
            min_confidence: parse_from(lookup, ENV_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE),
            max_faces: parse_from(lookup, ENV_MAX_FACES, DEFAULT_MAX_FACES),
            throttle_interval: parse_from(lookup, ENV_THROTTLE_INTERVAL, DEFAULT_THROTTLE_INTERVAL),
            use_gpu: false,
        }
    }
}

/// InsightFace is GPU-only; `use_gpu` must be set for construction to
/// succeed at all.
#[derive(Clone, Debug)]
pub struct InsightFaceConfig {
    pub pack_dir: Option<PathBuf>,
    pub max_detection_width: u32,
    pub min_confidence: f32,
    pub max_faces: usize,
    pub use_gpu: bool,
}

impl Default for InsightFaceConfig {
    fn default() -> Self {
        Self {
            pack_dir: None,
            max_detection_width: DEFAULT_MAX_DETECTION_WIDTH,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_faces: DEFAULT_MAX_FACES,
            use_gpu: false,
        }
    }
}

impl InsightFaceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            pack_dir: path_from(lookup, ENV_INSIGHTFACE_DIR),
            max_detection_width: parse_from(
                lookup,
                ENV_MAX_DETECTION_WIDTH,
                DEFAULT_MAX_DETECTION_WIDTH,
            ),
            min_confidence: parse_from(lookup, ENV_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE),
            max_faces: parse_from(lookup, ENV_MAX_FACES, DEFAULT_MAX_FACES),
            use_gpu: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HaarConfig {
    pub cascade_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub max_detection_width: u32,
}

impl Default for HaarConfig {
    fn default() -> Self {
        Self {
            cascade_path: None,
            model_dir: None,
            scale_factor: 1.1,
            min_neighbors: 3,
            max_detection_width: DEFAULT_MAX_DETECTION_WIDTH,
        }
    }
}

impl HaarConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            cascade_path: path_from(lookup, ENV_HAAR_CASCADE),
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            scale_factor: parse_from(lookup, ENV_HAAR_SCALE_FACTOR, 1.1),
            min_neighbors: 3,
            max_detection_width: parse_from(
                lookup,
                ENV_MAX_DETECTION_WIDTH,
                DEFAULT_MAX_DETECTION_WIDTH,
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct YuNetConfig {
    pub model_override: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub max_detection_width: u32,
    pub min_confidence: f32,
    pub max_faces: usize,
    pub use_gpu: bool,
}

impl Default for YuNetConfig {
    fn default() -> Self {
        Self {
            model_override: None,
            model_dir: None,
            max_detection_width: DEFAULT_MAX_DETECTION_WIDTH,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_faces: DEFAULT_MAX_FACES,
            use_gpu: false,
        }
    }
}

impl YuNetConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            model_override: path_from(lookup, ENV_YUNET_MODEL),
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            max_detection_width: parse_from(
                lookup,
                ENV_MAX_DETECTION_WIDTH,
                DEFAULT_MAX_DETECTION_WIDTH,
            ),
            min_confidence: parse_from(lookup, ENV_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE),
            max_faces: parse_from(lookup, ENV_MAX_FACES, DEFAULT_MAX_FACES),
            use_gpu: false,
        }
    }
}

/// Composite YuNet → mesh → expression engine settings.
#[derive(Clone, Debug)]
pub struct PyFeatConfig {
    pub yunet: YuNetConfig,
    pub mesh_model_override: Option<PathBuf>,
    pub checkpoint_override: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub throttle_interval: u32,
    pub use_gpu: bool,
}

impl Default for PyFeatConfig {
    fn default() -> Self {
        Self {
            yunet: YuNetConfig::default(),
            mesh_model_override: None,
            checkpoint_override: None,
            model_dir: None,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            use_gpu: false,
        }
    }
}

impl PyFeatConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            yunet: YuNetConfig::from_lookup(lookup),
            mesh_model_override: path_from(lookup, ENV_FACE_MESH_MODEL),
            checkpoint_override: path_from(lookup, ENV_BLENDSHAPE_CHECKPOINT),
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            throttle_interval: parse_from(lookup, ENV_THROTTLE_INTERVAL, DEFAULT_THROTTLE_INTERVAL),
            use_gpu: false,
        }
    }
}

/// Composite engine fitting 3D morphable-model coefficients.
#[derive(Clone, Debug)]
pub struct EosConfig {
    pub yunet: YuNetConfig,
    pub mesh_model_override: Option<PathBuf>,
    pub morphable_model_override: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub throttle_interval: u32,
    /// Ridge term for the coefficient fit.
    pub regularization: f32,
    pub use_gpu: bool,
}

impl Default for EosConfig {
    fn default() -> Self {
        Self {
            yunet: YuNetConfig::default(),
            mesh_model_override: None,
            morphable_model_override: None,
            model_dir: None,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            regularization: 30.0,
            use_gpu: false,
        }
    }
}

impl EosConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            yunet: YuNetConfig::from_lookup(lookup),
            mesh_model_override: path_from(lookup, ENV_FACE_MESH_MODEL),
            morphable_model_override: path_from(lookup, ENV_MORPHABLE_MODEL),
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            throttle_interval: parse_from(lookup, ENV_THROTTLE_INTERVAL, DEFAULT_THROTTLE_INTERVAL),
            regularization: 30.0,
            use_gpu: false,
        }
    }
}

/// Secondary YOLO object detector settings.
#[derive(Clone, Debug)]
pub struct ObjectDetectorConfig {
    pub model_override: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub min_confidence: f32,
    pub use_gpu: bool,
}

impl Default for ObjectDetectorConfig {
    fn default() -> Self {
        Self {
            model_override: None,
            model_dir: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            use_gpu: false,
        }
    }
}

impl ObjectDetectorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    pub(crate) fn from_lookup(lookup: EnvLookup) -> Self {
        Self {
            model_override: None,
            model_dir: path_from(lookup, ENV_MODEL_DIR),
            min_confidence: parse_from(lookup, ENV_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE),
            use_gpu: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_carry_detection_constants() {
        let cfg = YuNetConfig::default();
        assert_eq!(cfg.max_detection_width, DEFAULT_MAX_DETECTION_WIDTH);
        assert_eq!(cfg.min_confidence, DEFAULT_MIN_CONFIDENCE);
        assert_eq!(cfg.max_faces, DEFAULT_MAX_FACES);
        assert!(cfg.model_override.is_none());
        assert!(!cfg.use_gpu);
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let vars = lookup_of(&[
            (ENV_YUNET_MODEL, "/models/yunet.onnx"),
            (ENV_MAX_DETECTION_WIDTH, "320"),
            (ENV_MIN_CONFIDENCE, "0.75"),
        ]);
        let cfg = YuNetConfig::from_lookup(&|k| vars.get(k).cloned());
        assert_eq!(cfg.model_override, Some(PathBuf::from("/models/yunet.onnx")));
        assert_eq!(cfg.max_detection_width, 320);
        assert_eq!(cfg.min_confidence, 0.75);
    }

    #[test]
    fn test_from_lookup_falls_back_on_unparsable_values() {
        let vars = lookup_of(&[(ENV_MAX_DETECTION_WIDTH, "not-a-number")]);
        let cfg = OpenSeeFaceConfig::from_lookup(&|k| vars.get(k).cloned());
        assert_eq!(cfg.max_detection_width, DEFAULT_MAX_DETECTION_WIDTH);
    }

    #[test]
    fn test_from_lookup_empty_environment_matches_defaults() {
        let cfg = FaceMeshConfig::from_lookup(&|_| None);
        assert_eq!(cfg.min_confidence, FaceMeshConfig::default().min_confidence);
        assert_eq!(cfg.max_faces, FaceMeshConfig::default().max_faces);
        assert!(cfg.mesh_model_override.is_none());
    }

    #[test]
    fn test_composite_config_shares_detection_vars_with_inner_stage() {
        let vars = lookup_of(&[
            (ENV_MAX_DETECTION_WIDTH, "480"),
            (ENV_THROTTLE_INTERVAL, "3"),
        ]);
        let cfg = PyFeatConfig::from_lookup(&|k| vars.get(k).cloned());
        assert_eq!(cfg.yunet.max_detection_width, 480);
        assert_eq!(cfg.throttle_interval, 3);
    }

    #[test]
    fn test_haar_scale_factor_parse() {
        let vars = lookup_of(&[(ENV_HAAR_SCALE_FACTOR, "1.25")]);
        let cfg = HaarConfig::from_lookup(&|k| vars.get(k).cloned());
        assert_eq!(cfg.scale_factor, 1.25);
    }
}
