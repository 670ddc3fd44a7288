use std::path::Path;

use ort::execution_providers::{ExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use thiserror::Error;

use crate::shared::constants::{SESSION_INTER_THREADS, SESSION_INTRA_THREADS};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("engine {engine} is GPU-only; construction requires GPU use to be enabled")]
    GpuOnly { engine: &'static str },
    #[error("engine {engine} requires execution provider {provider}, which is not available in this runtime")]
    Unavailable {
        engine: &'static str,
        provider: &'static str,
    },
    #[error("session build failed for {engine}: {source}")]
    Session {
        engine: &'static str,
        #[source]
        source: ort::Error,
    },
}

/// Accelerated providers for the current platform, most preferred first.
pub fn accelerated_execution_providers() -> Vec<ExecutionProviderDispatch> {
    #[cfg(target_os = "macos")]
    {
        vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
    }
    #[cfg(target_os = "windows")]
    {
        vec![ort::execution_providers::DirectMLExecutionProvider::default().build()]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![ort::execution_providers::CUDAExecutionProvider::default().build()]
    }
}

pub fn accelerated_provider_name() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "CoreML"
    }
    #[cfg(target_os = "windows")]
    {
        "DirectML"
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        "CUDA"
    }
}

/// Whether the runtime reports the platform's accelerated provider.
pub fn accelerated_provider_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        ort::execution_providers::CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
    #[cfg(target_os = "windows")]
    {
        ort::execution_providers::DirectMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        ort::execution_providers::CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
}

/// Providers matching an already-validated GPU choice.
pub fn providers_for(use_gpu: bool) -> Vec<ExecutionProviderDispatch> {
    if use_gpu {
        accelerated_execution_providers()
    } else {
        vec![ort::execution_providers::CPUExecutionProvider::default().build()]
    }
}

/// Hard construction gate for a GPU-only engine: GPU use must be enabled
/// AND the accelerated provider must be present. Never downgrades.
pub fn require_gpu(engine: &'static str, use_gpu: bool) -> Result<(), ProviderError> {
    validate_gpu_only(engine, use_gpu, accelerated_provider_available())
}

/// Hard check that the accelerated provider is present, for engines where
/// GPU use was requested but is optional.
pub fn ensure_accelerated(engine: &'static str) -> Result<(), ProviderError> {
    if accelerated_provider_available() {
        Ok(())
    } else {
        Err(ProviderError::Unavailable {
            engine,
            provider: accelerated_provider_name(),
        })
    }
}

fn validate_gpu_only(
    engine: &'static str,
    use_gpu: bool,
    available: bool,
) -> Result<(), ProviderError> {
    if !use_gpu {
        return Err(ProviderError::GpuOnly { engine });
    }
    if !available {
        return Err(ProviderError::Unavailable {
            engine,
            provider: accelerated_provider_name(),
        });
    }
    Ok(())
}

/// Session with capped thread pools and the given providers.
pub fn build_session(
    engine: &'static str,
    model_path: &Path,
    providers: Vec<ExecutionProviderDispatch>,
) -> Result<Session, ProviderError> {
    build_inner(model_path, providers).map_err(|source| ProviderError::Session { engine, source })
}

/// Accelerated-first build that falls back to a CPU session on failure,
/// logging a warning. Only backends documented to degrade use this.
pub fn build_session_with_fallback(
    engine: &'static str,
    model_path: &Path,
    use_gpu: bool,
) -> Result<Session, ProviderError> {
    if use_gpu {
        match build_inner(model_path, accelerated_execution_providers()) {
            Ok(session) => {
                log::info!(
                    "{engine}: session on {} execution provider",
                    accelerated_provider_name()
                );
                return Ok(session);
            }
            Err(e) => {
                log::warn!(
                    "{engine}: {} session creation failed ({e}); falling back to CPU",
                    accelerated_provider_name()
                );
            }
        }
    }
    build_inner(model_path, providers_for(false))
        .map_err(|source| ProviderError::Session { engine, source })
}

fn build_inner(
    model_path: &Path,
    providers: Vec<ExecutionProviderDispatch>,
) -> Result<Session, ort::Error> {
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(SESSION_INTRA_THREADS)?
        .with_inter_threads(SESSION_INTER_THREADS)?;
    if !providers.is_empty() {
        builder = builder.with_execution_providers(providers)?;
    }
    builder.commit_from_file(model_path)
}
