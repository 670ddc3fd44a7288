// Self-hosted artifacts for the built-in face-mesh engine.
pub const FACE_BOX_MODEL_NAME: &str = "blazeface_short_range.onnx";
pub const FACE_BOX_MODEL_URL: &str =
    "https://github.com/neutrinographics/framesight/releases/download/v0.1.0/blazeface_short_range.onnx";

pub const FACE_MESH_MODEL_NAME: &str = "face_landmarks_detector.onnx";
pub const FACE_MESH_MODEL_URL: &str =
    "https://github.com/neutrinographics/framesight/releases/download/v0.1.0/face_landmarks_detector.onnx";

pub const BLENDSHAPE_CHECKPOINT_NAME: &str = "blendshape_regressor.safetensors";
pub const BLENDSHAPE_CHECKPOINT_URL: &str =
    "https://github.com/neutrinographics/framesight/releases/download/v0.1.0/blendshape_regressor.safetensors";

pub const MORPHABLE_MODEL_NAME: &str = "sfm_shape_3448.safetensors";
pub const MORPHABLE_MODEL_URL: &str =
    "https://github.com/neutrinographics/framesight/releases/download/v0.1.0/sfm_shape_3448.safetensors";

// Upstream artifacts fetched from their original hosts.
pub const YUNET_MODEL_NAME: &str = "face_detection_yunet_2023mar.onnx";
pub const YUNET_MODEL_URL: &str =
    "https://github.com/opencv/opencv_zoo/raw/main/models/face_detection_yunet/face_detection_yunet_2023mar.onnx";

pub const OPENSEEFACE_DETECT_MODEL_NAME: &str = "mnv3_detection_opt.onnx";
pub const OPENSEEFACE_LANDMARK_MODEL_NAME: &str = "lm_model3_opt.onnx";
pub const OPENSEEFACE_MODEL_BASE_URL: &str =
    "https://raw.githubusercontent.com/emilianavt/OpenSeeFace/master/models";

/// InsightFace pack contents: (filename, download URL).
pub const INSIGHTFACE_PACK_NAME: &str = "buffalo_l";
pub const INSIGHTFACE_PACK_FILES: &[(&str, &str)] = &[
    (
        "det_10g.onnx",
        "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    ),
    (
        "2d106det.onnx",
        "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/2d106det.onnx",
    ),
];

/// Cascade artifact is operator-supplied; there is no canonical JSON
/// conversion to download.
pub const HAAR_CASCADE_NAME: &str = "haarcascade_frontalface_default.json";

pub const OBJECT_MODEL_NAME: &str = "yolov8n.onnx";
pub const OBJECT_MODEL_URL: &str =
    "https://github.com/neutrinographics/framesight/releases/download/v0.1.0/yolov8n.onnx";

// Environment variables read at engine construction (never inside detect).
pub const ENV_MODEL_DIR: &str = "FRAMESIGHT_MODEL_DIR";
pub const ENV_FACE_MESH_MODEL: &str = "FRAMESIGHT_FACE_MESH_MODEL";
pub const ENV_BLENDSHAPE_CHECKPOINT: &str = "FRAMESIGHT_BLENDSHAPE_CHECKPOINT";
pub const ENV_MORPHABLE_MODEL: &str = "FRAMESIGHT_MORPHABLE_MODEL";
pub const ENV_HAAR_CASCADE: &str = "FRAMESIGHT_HAAR_CASCADE";
pub const ENV_HAAR_SCALE_FACTOR: &str = "FRAMESIGHT_HAAR_SCALE_FACTOR";
pub const ENV_YUNET_MODEL: &str = "FRAMESIGHT_YUNET_MODEL";
pub const ENV_OPENSEEFACE_DIR: &str = "FRAMESIGHT_OPENSEEFACE_DIR";
pub const ENV_INSIGHTFACE_DIR: &str = "FRAMESIGHT_INSIGHTFACE_DIR";
pub const ENV_MAX_DETECTION_WIDTH: &str = "FRAMESIGHT_MAX_DETECTION_WIDTH";
pub const ENV_THROTTLE_INTERVAL: &str = "FRAMESIGHT_THROTTLE_INTERVAL";
pub const ENV_MIN_CONFIDENCE: &str = "FRAMESIGHT_MIN_CONFIDENCE";
pub const ENV_MAX_FACES: &str = "FRAMESIGHT_MAX_FACES";

pub const DEFAULT_MAX_DETECTION_WIDTH: u32 = 640;
pub const DEFAULT_THROTTLE_INTERVAL: u32 = 1;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_MAX_FACES: usize = 8;

/// Per-session ONNX Runtime thread caps. Kept low so many workers can
/// share one host without oversubscription.
pub const SESSION_INTRA_THREADS: usize = 2;
pub const SESSION_INTER_THREADS: usize = 1;

/// Landmark outputs whose max |value| exceeds this are treated as absolute
/// crop-space pixels; below it they are normalized [0,1]. Empirical
/// disambiguator between exported model variants; re-validate before
/// trusting it with a new model source.
pub const COORDINATE_ABS_THRESHOLD: f32 = 2.0;

/// Full landmark mesh size; shorter regressor outputs are padded up to
/// this by replicating the last real point.
pub const MESH_LANDMARK_COUNT: usize = 478;
pub const SPARSE_LANDMARK_COUNT: usize = 68;
