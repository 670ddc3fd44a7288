//! Facial expression coefficients from a landmark mesh.
//!
//! The regressor weights ship as a weights-only safetensors checkpoint
//! with no architecture descriptor; the network is reconstructed by
//! inspecting which parameter keys are present. Candidate architectures
//! are tried in order, most specific first, because the shallower
//! variant's key set is a subset of the deeper one's.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

use crate::detection::domain::engine_config::EnvLookup;
use crate::detection::domain::regressors::ExpressionRegressor;
use crate::detection::infrastructure::model_fetcher;
use crate::shared::blendshapes::Blendshapes;
use crate::shared::constants::{
    BLENDSHAPE_CHECKPOINT_NAME, BLENDSHAPE_CHECKPOINT_URL, COORDINATE_ABS_THRESHOLD,
    ENV_BLENDSHAPE_CHECKPOINT, MESH_LANDMARK_COUNT,
};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to read checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse checkpoint: {0}")]
    Format(#[from] safetensors::SafeTensorError),
    #[error("checkpoint matches no known architecture; keys: {}", keys.join(", "))]
    UnknownArchitecture { keys: Vec<String> },
    #[error("bad tensor {name}: {reason}")]
    BadTensor { name: String, reason: String },
}

/// Mesh indices fed to the regressor: face contour, lips, eyes, brows,
/// and the ten iris points. Order matters; it matches the training
/// layout of the shipped checkpoints.
const LANDMARK_SUBSET: [usize; 146] = [
    0, 1, 4, 5, 6, 7, 8, 10, 13, 14, 17, 21, 33, 37, 39, 40, 46, 52, 53, 54, 55, 58, 61, 63, 65,
    66, 67, 70, 78, 80, 81, 82, 84, 87, 88, 91, 93, 95, 103, 105, 107, 109, 127, 132, 133, 136,
    144, 145, 146, 148, 149, 150, 152, 153, 154, 155, 157, 158, 159, 160, 161, 162, 163, 168, 172,
    173, 176, 178, 181, 185, 191, 195, 197, 234, 246, 249, 251, 263, 267, 269, 270, 276, 282, 283,
    284, 285, 288, 291, 293, 295, 296, 297, 300, 308, 310, 311, 312, 314, 317, 318, 321, 323, 324,
    332, 334, 336, 338, 356, 361, 362, 365, 373, 374, 375, 377, 378, 379, 380, 381, 382, 384, 385,
    386, 387, 388, 389, 390, 397, 398, 400, 402, 405, 409, 415, 454, 466, 468, 469, 470, 471, 472,
    473, 474, 475, 476, 477,
];

struct Layer {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Layer {
    fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(input) + &self.bias
    }
}

enum Network {
    TwoLayer { hidden: Layer, out: Layer },
    ThreeLayer { first: Layer, second: Layer, out: Layer },
}

impl Network {
    fn architecture(&self) -> &'static str {
        match self {
            Network::TwoLayer { .. } => "mlp2",
            Network::ThreeLayer { .. } => "mlp3",
        }
    }

    fn infer(&self, input: &Array1<f32>) -> Array1<f32> {
        match self {
            Network::TwoLayer { hidden, out } => out.forward(&relu(hidden.forward(input))),
            Network::ThreeLayer { first, second, out } => {
                out.forward(&relu(second.forward(&relu(first.forward(input)))))
            }
        }
    }
}

fn relu(mut values: Array1<f32>) -> Array1<f32> {
    values.mapv_inplace(|v| v.max(0.0));
    values
}

// Tried in order; the deeper variant must come first since its key set
// contains the shallower variant's keys.
const ARCHITECTURES: &[(
    &str,
    fn(&[&str]) -> bool,
    fn(&SafeTensors) -> Result<Network, CheckpointError>,
)] = &[
    ("mlp3", has_three_layer_keys, build_three_layer),
    ("mlp2", has_two_layer_keys, build_two_layer),
];

fn has_three_layer_keys(names: &[&str]) -> bool {
    names.contains(&"net.4.weight")
}

fn has_two_layer_keys(names: &[&str]) -> bool {
    names.contains(&"net.0.weight") && names.contains(&"net.2.weight")
}

fn build_two_layer(tensors: &SafeTensors) -> Result<Network, CheckpointError> {
    Ok(Network::TwoLayer {
        hidden: layer(tensors, "net.0")?,
        out: layer(tensors, "net.2")?,
    })
}

fn build_three_layer(tensors: &SafeTensors) -> Result<Network, CheckpointError> {
    Ok(Network::ThreeLayer {
        first: layer(tensors, "net.0")?,
        second: layer(tensors, "net.2")?,
        out: layer(tensors, "net.4")?,
    })
}

fn layer(tensors: &SafeTensors, prefix: &str) -> Result<Layer, CheckpointError> {
    let weight_name = format!("{prefix}.weight");
    let bias_name = format!("{prefix}.bias");
    let weight_view = tensors.tensor(&weight_name)?;
    let bias_view = tensors.tensor(&bias_name)?;

    let weight_shape = weight_view.shape().to_vec();
    if weight_shape.len() != 2 {
        return Err(CheckpointError::BadTensor {
            name: weight_name,
            reason: format!("expected 2-d weight, got shape {weight_shape:?}"),
        });
    }
    let weight = Array2::from_shape_vec(
        (weight_shape[0], weight_shape[1]),
        tensor_to_f32(&weight_view, &weight_name)?,
    )
    .map_err(|e| CheckpointError::BadTensor {
        name: weight_name.clone(),
        reason: e.to_string(),
    })?;

    let bias = Array1::from_vec(tensor_to_f32(&bias_view, &bias_name)?);
    if bias.len() != weight_shape[0] {
        return Err(CheckpointError::BadTensor {
            name: bias_name,
            reason: format!(
                "bias length {} does not match {} output rows",
                bias.len(),
                weight_shape[0]
            ),
        });
    }

    Ok(Layer { weight, bias })
}

fn tensor_to_f32(view: &TensorView, name: &str) -> Result<Vec<f32>, CheckpointError> {
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointError::BadTensor {
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

/// Expression regressor over a fixed subset of the landmark mesh.
pub struct BlendshapeExtractor {
    network: Network,
}

impl BlendshapeExtractor {
    pub fn new(
        override_path: Option<&Path>,
        model_dir: Option<&Path>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let path = resolve_checkpoint_with(override_path, model_dir, &|key| {
            std::env::var(key).ok()
        })?;
        let network = load_network(&path)?;
        log::debug!(
            "blendshape checkpoint {} reconstructed as {}",
            path.display(),
            network.architecture()
        );
        Ok(Self { network })
    }

    #[cfg(test)]
    fn from_bytes(data: &[u8]) -> Result<Self, CheckpointError> {
        let tensors = SafeTensors::deserialize(data)?;
        Ok(Self {
            network: pick_architecture(&tensors)?,
        })
    }

    #[cfg(test)]
    fn architecture(&self) -> &'static str {
        self.network.architecture()
    }
}

impl ExpressionRegressor for BlendshapeExtractor {
    fn extract(
        &mut self,
        landmarks: &[[f32; 3]],
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Option<Blendshapes>, Box<dyn std::error::Error>> {
        if landmarks.len() < MESH_LANDMARK_COUNT {
            return Ok(None);
        }
        let input = subset_input(landmarks, frame_width, frame_height);
        let output = self.network.infer(&input);
        Ok(Blendshapes::from_coefficients(&output.to_vec()))
    }
}

fn load_network(path: &Path) -> Result<Network, CheckpointError> {
    let data = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data)?;
    pick_architecture(&tensors)
}

fn pick_architecture(tensors: &SafeTensors) -> Result<Network, CheckpointError> {
    let names = tensors.names();
    let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    for (label, matches, build) in ARCHITECTURES {
        if matches(&names) {
            log::debug!("checkpoint key set matches {label}");
            return build(tensors);
        }
    }
    Err(CheckpointError::UnknownArchitecture {
        keys: names.iter().map(|s| s.to_string()).collect(),
    })
}

/// Flatten the landmark subset to the network input, rescaling by the
/// frame dimensions when values look like absolute pixels.
fn subset_input(landmarks: &[[f32; 3]], frame_width: u32, frame_height: u32) -> Array1<f32> {
    let max_abs = LANDMARK_SUBSET
        .iter()
        .map(|&i| landmarks[i][0].abs().max(landmarks[i][1].abs()))
        .fold(0.0_f32, f32::max);
    let absolute = max_abs > COORDINATE_ABS_THRESHOLD;

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let mut input = Vec::with_capacity(LANDMARK_SUBSET.len() * 2);
    for &i in &LANDMARK_SUBSET {
        let [x, y, _] = landmarks[i];
        if absolute {
            input.push(x / fw);
            input.push(y / fh);
        } else {
            input.push(x);
            input.push(y);
        }
    }
    Array1::from_vec(input)
}

fn resolve_checkpoint_with(
    override_path: Option<&Path>,
    model_dir: Option<&Path>,
    lookup: EnvLookup,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    if let Some(path) = lookup(ENV_BLENDSHAPE_CHECKPOINT).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }
    if let Some(dir) = model_dir {
        let candidate = dir.join(BLENDSHAPE_CHECKPOINT_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(model_fetcher::resolve(
        BLENDSHAPE_CHECKPOINT_NAME,
        BLENDSHAPE_CHECKPOINT_URL,
        model_dir,
        None,
    )?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT_LEN: usize = LANDMARK_SUBSET.len() * 2;

    /// Serialize named f32 tensors into an in-memory checkpoint.
    fn checkpoint(entries: Vec<(&str, Vec<usize>, Vec<f32>)>) -> Vec<u8> {
        let views: Vec<(String, TensorView)> = entries
            .iter()
            .map(|(name, shape, values)| {
                (
                    name.to_string(),
                    TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(values))
                        .unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, &None).unwrap()
    }

    /// Two-layer checkpoint whose output only copies `subset_input[0]`
    /// through a single hidden unit.
    fn passthrough_two_layer() -> Vec<u8> {
        let mut hidden_w = vec![0.0_f32; 4 * INPUT_LEN];
        hidden_w[0] = 1.0;
        let mut out_w = vec![0.0_f32; 52 * 4];
        for row in 0..52 {
            out_w[row * 4] = 1.0;
        }
        checkpoint(vec![
            ("net.0.weight", vec![4, INPUT_LEN], hidden_w),
            ("net.0.bias", vec![4], vec![0.0; 4]),
            ("net.2.weight", vec![52, 4], out_w),
            ("net.2.bias", vec![52], vec![0.0; 52]),
        ])
    }

    fn mesh_of(x: f32, y: f32) -> Vec<[f32; 3]> {
        vec![[x, y, 0.0]; MESH_LANDMARK_COUNT]
    }

    // ── Architecture reconstruction ──────────────────────────────────

    #[test]
    fn test_two_layer_checkpoint_reconstructed() {
        let extractor = BlendshapeExtractor::from_bytes(&passthrough_two_layer()).unwrap();
        assert_eq!(extractor.architecture(), "mlp2");
    }

    #[test]
    fn test_three_layer_keys_win_over_two_layer_subset() {
        // The key set contains net.0 and net.2, which also satisfy the
        // shallower predicate; net.4 must steer to the deeper variant.
        let data = checkpoint(vec![
            ("net.0.weight", vec![4, INPUT_LEN], vec![0.0; 4 * INPUT_LEN]),
            ("net.0.bias", vec![4], vec![0.0; 4]),
            ("net.2.weight", vec![4, 4], vec![0.0; 16]),
            ("net.2.bias", vec![4], vec![0.0; 4]),
            ("net.4.weight", vec![52, 4], vec![0.0; 52 * 4]),
            ("net.4.bias", vec![52], vec![0.25; 52]),
        ]);
        let extractor = BlendshapeExtractor::from_bytes(&data).unwrap();
        assert_eq!(extractor.architecture(), "mlp3");
    }

    #[test]
    fn test_unknown_key_set_is_an_error() {
        let data = checkpoint(vec![("encoder.weight", vec![2, 2], vec![0.0; 4])]);
        let err = BlendshapeExtractor::from_bytes(&data).unwrap_err();
        match err {
            CheckpointError::UnknownArchitecture { keys } => {
                assert!(keys.contains(&"encoder.weight".to_string()));
            }
            other => panic!("expected UnknownArchitecture, got {other:?}"),
        }
    }

    #[test]
    fn test_bias_row_mismatch_is_an_error() {
        let data = checkpoint(vec![
            ("net.0.weight", vec![4, INPUT_LEN], vec![0.0; 4 * INPUT_LEN]),
            ("net.0.bias", vec![3], vec![0.0; 3]),
            ("net.2.weight", vec![52, 4], vec![0.0; 52 * 4]),
            ("net.2.bias", vec![52], vec![0.0; 52]),
        ]);
        let err = BlendshapeExtractor::from_bytes(&data).unwrap_err();
        assert!(matches!(err, CheckpointError::BadTensor { .. }));
    }

    // ── Inference ────────────────────────────────────────────────────

    #[test]
    fn test_extract_produces_52_coefficients() {
        let mut extractor = BlendshapeExtractor::from_bytes(&passthrough_two_layer()).unwrap();
        let result = extractor.extract(&mesh_of(0.5, 0.5), 1280, 720).unwrap();
        let shapes = result.unwrap();
        assert_eq!(shapes.values().len(), 52);
        for v in shapes.values() {
            assert!((v - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pixel_landmarks_rescaled_before_inference() {
        // Pixel-space mesh at (640, 360) in a 1280x720 frame must match
        // the normalized mesh at (0.5, 0.5).
        let mut extractor = BlendshapeExtractor::from_bytes(&passthrough_two_layer()).unwrap();
        let normalized = extractor
            .extract(&mesh_of(0.5, 0.5), 1280, 720)
            .unwrap()
            .unwrap();
        let pixels = extractor
            .extract(&mesh_of(640.0, 360.0), 1280, 720)
            .unwrap()
            .unwrap();
        for (a, b) in normalized.values().iter().zip(pixels.values()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_short_mesh_yields_none() {
        let mut extractor = BlendshapeExtractor::from_bytes(&passthrough_two_layer()).unwrap();
        let short = vec![[0.5, 0.5, 0.0]; 68];
        assert!(extractor.extract(&short, 1280, 720).unwrap().is_none());
    }

    #[test]
    fn test_subset_indices_fit_mesh_and_are_sorted() {
        let mut prev = None;
        for &i in &LANDMARK_SUBSET {
            assert!(i < MESH_LANDMARK_COUNT);
            if let Some(p) = prev {
                assert!(i > p, "subset must be strictly increasing at {i}");
            }
            prev = Some(i);
        }
    }
}
