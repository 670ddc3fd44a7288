//! Path-only lookup for auxiliary object-detection model artifacts.
//!
//! The registry never touches the network; it decides where a model file
//! SHOULD be, probing a fixed priority of locations, and leaves fetching
//! to `model_fetcher`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::detection::domain::engine_config::EnvLookup;
use crate::detection::infrastructure::model_fetcher::model_cache_dir;
use crate::shared::constants::ENV_MODEL_DIR;

#[derive(Error, Debug)]
pub enum ModelRegistryError {
    #[error("unknown model identifier {0:?}")]
    UnknownModel(String),
    #[error("model {name} not found; searched: {}", format_searched(searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
}

fn format_searched(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy)]
pub struct ModelEntry {
    pub name: &'static str,
    pub file_name: &'static str,
}

pub const MODEL_CATALOG: &[ModelEntry] = &[
    ModelEntry {
        name: "yolov8n",
        file_name: "yolov8n.onnx",
    },
    ModelEntry {
        name: "yolov8s",
        file_name: "yolov8s.onnx",
    },
    ModelEntry {
        name: "yolov8m",
        file_name: "yolov8m.onnx",
    },
];

/// Hardware class to recommended object-detection model. A flat table,
/// looked up verbatim.
pub const HARDWARE_RECOMMENDATIONS: &[(&str, &str)] = &[
    ("cpu", "yolov8n"),
    ("gpu", "yolov8m"),
    ("edge", "yolov8n"),
    ("workstation", "yolov8s"),
];

/// Subdirectories probed inside every searched directory, in order.
const SUBFOLDER_LAYOUTS: [&str; 3] = ["", "models", "weights"];

pub fn recommended_model(hardware: &str) -> Option<&'static str> {
    HARDWARE_RECOMMENDATIONS
        .iter()
        .find(|(hw, _)| *hw == hardware)
        .map(|(_, model)| *model)
}

fn catalog_entry(name: &str) -> Option<&'static ModelEntry> {
    MODEL_CATALOG.iter().find(|entry| entry.name == name)
}

/// Resolve a model identifier to an existing file path.
///
/// Priority: explicit override path, then the directory named by
/// `FRAMESIGHT_MODEL_DIR`, then the caller-supplied directory, then the
/// bundled defaults (user cache dir and a `models/` directory relative to
/// the working directory). Directory tiers probe the conventional
/// subfolder layouts. On total failure the error lists every location
/// that was checked.
pub fn resolve_model(
    name: &str,
    override_path: Option<&Path>,
    caller_dir: Option<&Path>,
) -> Result<PathBuf, ModelRegistryError> {
    resolve_with(name, override_path, caller_dir, &|key| {
        std::env::var(key).ok()
    })
}

fn resolve_with(
    name: &str,
    override_path: Option<&Path>,
    caller_dir: Option<&Path>,
    lookup: EnvLookup,
) -> Result<PathBuf, ModelRegistryError> {
    let entry = catalog_entry(name).ok_or_else(|| ModelRegistryError::UnknownModel(name.to_string()))?;

    let mut searched: Vec<PathBuf> = Vec::new();

    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        searched.push(path.to_path_buf());
    }

    if let Some(dir) = lookup(ENV_MODEL_DIR).map(PathBuf::from) {
        if let Some(found) = probe_layouts(&dir, entry.file_name, &mut searched) {
            return Ok(found);
        }
    }

    if let Some(dir) = caller_dir {
        if let Some(found) = probe_layouts(dir, entry.file_name, &mut searched) {
            return Ok(found);
        }
    }

    if let Ok(cache) = model_cache_dir() {
        if let Some(found) = probe_layouts(&cache, entry.file_name, &mut searched) {
            return Ok(found);
        }
    }
    if let Some(found) = probe_layouts(Path::new("models"), entry.file_name, &mut searched) {
        return Ok(found);
    }

    Err(ModelRegistryError::NotFound {
        name: name.to_string(),
        searched,
    })
}

fn probe_layouts(dir: &Path, file_name: &str, searched: &mut Vec<PathBuf>) -> Option<PathBuf> {
    for sub in SUBFOLDER_LAYOUTS {
        let candidate = if sub.is_empty() {
            dir.join(file_name)
        } else {
            dir.join(sub).join(file_name)
        };
        if candidate.exists() {
            return Some(candidate);
        }
        searched.push(candidate);
    }
    None
}
