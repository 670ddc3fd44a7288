//! Name-keyed detector construction.
//!
//! `"mediapipe"` is the built-in face-mesh engine; the factory returns
//! the `None` sentinel for it and the caller builds that engine itself.
//! Every other recognized name constructs one boxed detector from its
//! environment-derived configuration.

use thiserror::Error;

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::{
    EosConfig, HaarConfig, InsightFaceConfig, OpenSeeFaceConfig, PyFeatConfig, YuNetConfig,
};
use crate::detection::infrastructure::eos_engine::EosEngine;
use crate::detection::infrastructure::haar_engine::HaarEngine;
use crate::detection::infrastructure::insightface_engine::InsightFaceEngine;
use crate::detection::infrastructure::openseeface_engine::OpenSeeFaceEngine;
use crate::detection::infrastructure::pyfeat_engine::PyFeatEngine;
use crate::detection::infrastructure::yunet_engine::YuNetEngine;

/// Names `create_engine` accepts, the built-in sentinel first.
pub const ENGINE_NAMES: [&str; 7] = [
    "mediapipe",
    "openseeface",
    "insightface",
    "haar",
    "yunet",
    "composite-pyfeat",
    "eos",
];

#[derive(Error, Debug)]
pub enum EngineFactoryError {
    #[error("unknown engine {0:?}; known engines: {}", ENGINE_NAMES.join(", "))]
    UnknownEngine(String),
    #[error("engine {name} construction failed: {reason}")]
    Construction { name: String, reason: String },
}

/// Build the detector registered under `name`.
///
/// `Ok(None)` is the built-in face-mesh sentinel. `use_gpu` is injected
/// into each engine's environment-derived config; environment collection
/// never carries the GPU decision.
pub fn create_engine(
    name: &str,
    use_gpu: bool,
) -> Result<Option<Box<dyn Detector>>, EngineFactoryError> {
    let normalized = name.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "mediapipe" => {
            log::info!("using built-in face-mesh engine");
            Ok(None)
        }
        "openseeface" => {
            let mut config = OpenSeeFaceConfig::from_env();
            config.use_gpu = use_gpu;
            boxed(&normalized, OpenSeeFaceEngine::from_config(&config))
        }
        "insightface" => {
            let mut config = InsightFaceConfig::from_env();
            config.use_gpu = use_gpu;
            boxed(&normalized, InsightFaceEngine::from_config(&config))
        }
        "haar" => {
            if use_gpu {
                log::debug!("haar cascade runs on CPU; the GPU request has no effect");
            }
            let config = HaarConfig::from_env();
            boxed(&normalized, HaarEngine::from_config(&config))
        }
        "yunet" => {
            let mut config = YuNetConfig::from_env();
            config.use_gpu = use_gpu;
            boxed(&normalized, YuNetEngine::from_config(&config))
        }
        "composite-pyfeat" => {
            let mut config = PyFeatConfig::from_env();
            config.use_gpu = use_gpu;
            boxed(&normalized, PyFeatEngine::from_config(&config))
        }
        "eos" => {
            let mut config = EosConfig::from_env();
            config.use_gpu = use_gpu;
            boxed(&normalized, EosEngine::from_config(&config))
        }
        _ => Err(EngineFactoryError::UnknownEngine(name.to_string())),
    }
}

fn boxed<E: Detector + 'static>(
    name: &str,
    engine: Result<E, Box<dyn std::error::Error>>,
) -> Result<Option<Box<dyn Detector>>, EngineFactoryError> {
    match engine {
        Ok(engine) => {
            log::info!("engine {name} constructed");
            Ok(Some(Box::new(engine)))
        }
        Err(e) => Err(EngineFactoryError::Construction {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}
