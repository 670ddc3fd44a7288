use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelFetchError {
    #[error("failed to create cache directory: {0}")]
    CacheDir(#[source] std::io::Error),
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write model to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine cache directory")]
    NoCacheDir,
    #[error("model pack at {dir} already exists but is missing {missing}; refusing to overwrite")]
    PackExists { dir: PathBuf, missing: String },
    #[error("failed to quarantine model pack {from} as {to}: {source}")]
    Quarantine {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Progress callback: `(bytes_downloaded, total_bytes)`.
/// `total_bytes` is 0 if the server didn't provide Content-Length.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send>;

/// Resolve a model file by name, checking cache locations before downloading.
///
/// Resolution order:
/// 1. User cache directory (platform-specific)
/// 2. Bundled path (for development / pre-packaged installs)
/// 3. Download from URL to cache
pub fn resolve(
    name: &str,
    url: &str,
    bundled_dir: Option<&Path>,
    progress: Option<ProgressFn>,
) -> Result<PathBuf, ModelFetchError> {
    // 1. Check user cache
    let cache_dir = model_cache_dir()?;
    let cached_path = cache_dir.join(name);
    if cached_path.exists() {
        return Ok(cached_path);
    }

    // 2. Check bundled path
    if let Some(dir) = bundled_dir {
        let bundled_path = dir.join(name);
        if bundled_path.exists() {
            return Ok(bundled_path);
        }
    }

    // 3. Download to cache
    fs::create_dir_all(&cache_dir).map_err(ModelFetchError::CacheDir)?;
    log::info!("downloading model {name} from {url}");
    download(url, &cached_path, progress)?;
    Ok(cached_path)
}

/// Platform-specific model cache directory.
///
/// - macOS: `~/Library/Application Support/FrameSight/models/`
/// - Linux: `$XDG_CACHE_HOME/FrameSight/models/` or `~/.cache/FrameSight/models/`
/// - Windows: `%LOCALAPPDATA%/FrameSight/models/`
pub fn model_cache_dir() -> Result<PathBuf, ModelFetchError> {
    #[cfg(target_os = "macos")]
    {
        dirs::data_dir()
            .map(|d| d.join("FrameSight").join("models"))
            .ok_or(ModelFetchError::NoCacheDir)
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::cache_dir()
            .map(|d| d.join("FrameSight").join("models"))
            .ok_or(ModelFetchError::NoCacheDir)
    }
}

/// Ensure a multi-file model pack is present and complete at `dir`.
///
/// A missing directory is created and every file in `files` is fetched
/// into it. A directory that already exists must contain every required
/// file; an incomplete pack is never overwritten in place, only reported,
/// so callers can quarantine it first.
pub fn ensure_pack(dir: &Path, files: &[(&str, &str)]) -> Result<(), ModelFetchError> {
    if dir.exists() {
        for (name, _) in files {
            if !dir.join(name).exists() {
                return Err(ModelFetchError::PackExists {
                    dir: dir.to_path_buf(),
                    missing: (*name).to_string(),
                });
            }
        }
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(ModelFetchError::CacheDir)?;
    for (name, url) in files {
        log::info!("downloading pack file {name} from {url}");
        download(url, &dir.join(name), None)?;
    }
    Ok(())
}

/// Move a damaged model pack aside so a fresh fetch can replace it.
///
/// The pack keeps its contents under `<dir>.corrupt.<unix-seconds>` for
/// later inspection. Returns the quarantine path.
pub fn quarantine_pack(dir: &Path) -> Result<PathBuf, ModelFetchError> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut quarantined = dir.as_os_str().to_os_string();
    quarantined.push(format!(".corrupt.{stamp}"));
    let quarantined = PathBuf::from(quarantined);
    fs::rename(dir, &quarantined).map_err(|source| ModelFetchError::Quarantine {
        from: dir.to_path_buf(),
        to: quarantined.clone(),
        source,
    })?;
    log::warn!(
        "quarantined model pack {} as {}",
        dir.display(),
        quarantined.display()
    );
    Ok(quarantined)
}

fn download(url: &str, dest: &Path, progress: Option<ProgressFn>) -> Result<(), ModelFetchError> {
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| ModelFetchError::Download {
            url: url.to_string(),
            source: e,
        })?;

    let total = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;

    // Write to a temp file first, then rename for atomicity
    let temp_path = dest.with_extension("part");
    let mut file = fs::File::create(&temp_path).map_err(|e| ModelFetchError::Write {
        path: temp_path.clone(),
        source: e,
    })?;

    let bytes = response.bytes().map_err(|e| ModelFetchError::Download {
        url: url.to_string(),
        source: e,
    })?;

    // Report progress in chunks to avoid excessive callbacks
    let chunk_size = 1024 * 1024; // 1MB
    for chunk in bytes.chunks(chunk_size) {
        file.write_all(chunk)
            .map_err(|e| ModelFetchError::Write {
                path: temp_path.clone(),
                source: e,
            })?;
        downloaded += chunk.len() as u64;
        if let Some(ref cb) = progress {
            cb(downloaded, total);
        }
    }

    file.flush().map_err(|e| ModelFetchError::Write {
        path: temp_path.clone(),
        source: e,
    })?;
    drop(file);

    fs::rename(&temp_path, dest).map_err(|e| ModelFetchError::Write {
        path: dest.to_path_buf(),
        source: e,
    })?;

    Ok(())
}
