//! Haar cascade face detector over grayscale frames. No inference
//! runtime: the cascade file is a JSON export of the classic
//! frontal-face stump cascade, evaluated on an integral image with
//! per-window variance normalization.
//!
//! The cascade file is operator-supplied; there is no download fallback.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::detection::domain::detector::Detector;
use crate::detection::domain::engine_config::HaarConfig;
use crate::detection::infrastructure::downscale::WorkingCopy;
use crate::detection::infrastructure::model_fetcher;
use crate::shared::bbox::BBox;
use crate::shared::constants::HAAR_CASCADE_NAME;
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::{ColorSpace, Frame};

const SOURCE_TAG: &str = "haar";

/// Relative corner tolerance for treating two windows as neighbors.
const GROUP_EPS: f64 = 0.2;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("cascade file not found; searched {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
    #[error("failed to read cascade file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cascade file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cascade file {path} has no stages or a zero-sized window")]
    Invalid { path: PathBuf },
    #[error("scale factor must be greater than 1.0, got {0}")]
    ScaleFactor(f64),
}

#[derive(Debug, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<CascadeStage>,
}

#[derive(Debug, Deserialize)]
pub struct CascadeStage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Decision stump: a weighted rectangle sum compared against a trained
/// threshold, scaled by the window's variance normalization factor.
#[derive(Debug, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<FeatureRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Deserialize)]
pub struct FeatureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

pub struct HaarEngine {
    cascade: HaarCascade,
    scale_factor: f64,
    min_neighbors: u32,
    max_detection_width: u32,
}

impl HaarEngine {
    pub fn from_config(config: &HaarConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if config.scale_factor <= 1.0 {
            return Err(CascadeError::ScaleFactor(config.scale_factor).into());
        }
        let path = resolve_cascade_path(config.cascade_path.as_deref(), config.model_dir.as_deref())?;
        let cascade = load_cascade(&path)?;
        log::info!(
            "haar: cascade {} ({} stages, {}x{} window)",
            path.display(),
            cascade.stages.len(),
            cascade.window_width,
            cascade.window_height
        );
        Ok(Self {
            cascade,
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            max_detection_width: config.max_detection_width,
        })
    }
}

impl Detector for HaarEngine {
    fn detect(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        // The caller converts per color_space(); cope with an RGB frame
        // anyway so the engine stands alone.
        let gray_storage;
        let gray = if frame.channels() == 1 {
            frame
        } else {
            gray_storage = frame.to_grayscale();
            &gray_storage
        };

        let work = WorkingCopy::new(gray, self.max_detection_width);
        let work_frame = work.frame();
        let integral = IntegralImage::new(
            work_frame.data(),
            work_frame.width() as usize,
            work_frame.height() as usize,
        );

        let windows = sweep_windows(
            &self.cascade,
            &integral,
            work_frame.width() as usize,
            work_frame.height() as usize,
            self.scale_factor,
        );
        let grouped = group_windows(windows, self.min_neighbors);

        let records = grouped
            .into_iter()
            .map(|bbox| work.restore_bbox(bbox, frame.width(), frame.height()))
            .filter(|bbox| !bbox.is_empty())
            // the cascade emits no score; accepted windows are all equal
            .map(|bbox| DetectionRecord::new(bbox, SOURCE_TAG, "face", 1.0))
            .collect();
        Ok(records)
    }

    fn color_space(&self) -> ColorSpace {
        ColorSpace::Gray
    }

    fn source_tag(&self) -> &'static str {
        SOURCE_TAG
    }
}

fn resolve_cascade_path(
    override_path: Option<&Path>,
    model_dir: Option<&Path>,
) -> Result<PathBuf, CascadeError> {
    let mut searched = Vec::new();
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        searched.push(path.to_path_buf());
    }
    if let Some(dir) = model_dir {
        let candidate = dir.join(HAAR_CASCADE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        searched.push(candidate);
    }
    if let Ok(cache) = model_fetcher::model_cache_dir() {
        let candidate = cache.join(HAAR_CASCADE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        searched.push(candidate);
    }
    Err(CascadeError::NotFound { searched })
}

fn load_cascade(path: &Path) -> Result<HaarCascade, CascadeError> {
    let text = fs::read_to_string(path).map_err(|source| CascadeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cascade: HaarCascade = serde_json::from_str(&text).map_err(|source| CascadeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if cascade.stages.is_empty() || cascade.window_width == 0 || cascade.window_height == 0 {
        return Err(CascadeError::Invalid {
            path: path.to_path_buf(),
        });
    }
    Ok(cascade)
}

// ---------------------------------------------------------------------------
// Integral image
// ---------------------------------------------------------------------------

/// Summed-area tables over a grayscale image, plain and squared, with a
/// one-cell zero border so rectangle sums need no edge cases.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(data: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0u64; stride * (height + 1)];
        let mut sq_sum = vec![0u64; stride * (height + 1)];
        for y in 0..height {
            let mut row: u64 = 0;
            let mut row_sq: u64 = 0;
            for x in 0..width {
                let v = data[y * width + x] as u64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sq_sum,
        }
    }

    fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        corner_sum(&self.sum, self.stride, x, y, w, h)
    }

    fn rect_sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        corner_sum(&self.sq_sum, self.stride, x, y, w, h)
    }
}

fn corner_sum(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
    let tl = table[y * stride + x];
    let tr = table[y * stride + x + w];
    let bl = table[(y + h) * stride + x];
    let br = table[(y + h) * stride + x + w];
    (br + tl) - (tr + bl)
}

// ---------------------------------------------------------------------------
// Window sweep
// ---------------------------------------------------------------------------

fn sweep_windows(
    cascade: &HaarCascade,
    integral: &IntegralImage,
    width: usize,
    height: usize,
    scale_factor: f64,
) -> Vec<BBox> {
    let mut windows = Vec::new();
    let mut scale = 1.0f64;
    loop {
        let win_w = (cascade.window_width as f64 * scale).round() as usize;
        let win_h = (cascade.window_height as f64 * scale).round() as usize;
        if win_w == 0 || win_h == 0 || win_w > width || win_h > height {
            break;
        }
        let step = ((scale * 2.0).round() as usize).max(2);

        let mut y = 0;
        while y + win_h <= height {
            let mut x = 0;
            while x + win_w <= width {
                if evaluate_window(cascade, integral, x, y, win_w, win_h, scale) {
                    windows.push(BBox::new(x as i32, y as i32, win_w as i32, win_h as i32));
                }
                x += step;
            }
            y += step;
        }
        scale *= scale_factor;
    }
    windows
}

fn window_variance_norm(
    integral: &IntegralImage,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
) -> (f64, f64) {
    let inv_area = 1.0 / (w * h) as f64;
    let mean = integral.rect_sum(x, y, w, h) as f64 * inv_area;
    let variance = integral.rect_sq_sum(x, y, w, h) as f64 * inv_area - mean * mean;
    let vnorm = if variance > 1.0 { variance.sqrt() } else { 1.0 };
    (mean, vnorm)
}

/// Runs every stage against one window; any failing stage rejects it.
fn evaluate_window(
    cascade: &HaarCascade,
    integral: &IntegralImage,
    x: usize,
    y: usize,
    win_w: usize,
    win_h: usize,
    scale: f64,
) -> bool {
    let inv_area = 1.0 / (win_w * win_h) as f64;
    let (_, vnorm) = window_variance_norm(integral, x, y, win_w, win_h);

    for stage in &cascade.stages {
        let mut total = 0.0f64;
        for clf in &stage.classifiers {
            let mut feature = 0.0f64;
            for rect in &clf.rects {
                let rx = x + (rect.x as f64 * scale).round() as usize;
                let ry = y + (rect.y as f64 * scale).round() as usize;
                let rw = (rect.width as f64 * scale).round() as usize;
                let rh = (rect.height as f64 * scale).round() as usize;
                if rw == 0 || rh == 0 {
                    continue;
                }
                feature += integral.rect_sum(rx, ry, rw, rh) as f64 * rect.weight as f64;
            }
            total += if feature * inv_area < clf.threshold as f64 * vnorm {
                clf.left as f64
            } else {
                clf.right as f64
            };
        }
        if total < stage.threshold as f64 {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Neighbor grouping
// ---------------------------------------------------------------------------

/// Clusters raw windows by corner proximity, keeps clusters with at least
/// `min_neighbors` members, and returns each cluster's average box.
fn group_windows(windows: Vec<BBox>, min_neighbors: u32) -> Vec<BBox> {
    let required = min_neighbors.max(1) as usize;
    let mut clusters: Vec<(BBox, Vec<BBox>)> = Vec::new();
    for window in windows {
        match clusters
            .iter_mut()
            .find(|(rep, _)| similar_windows(rep, &window))
        {
            Some((_, members)) => members.push(window),
            None => clusters.push((window, vec![window])),
        }
    }

    clusters
        .into_iter()
        .filter(|(_, members)| members.len() >= required)
        .map(|(_, members)| {
            let n = members.len() as i64;
            let sum = members.iter().fold([0i64; 4], |mut acc, b| {
                acc[0] += b.x as i64;
                acc[1] += b.y as i64;
                acc[2] += b.width as i64;
                acc[3] += b.height as i64;
                acc
            });
            BBox::new(
                (sum[0] / n) as i32,
                (sum[1] / n) as i32,
                (sum[2] / n) as i32,
                (sum[3] / n) as i32,
            )
        })
        .collect()
}

fn similar_windows(a: &BBox, b: &BBox) -> bool {
    let delta = GROUP_EPS * 0.5 * (a.width.min(b.width) + a.height.min(b.height)) as f64;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && (((a.x + a.width) - (b.x + b.width)).abs() as f64) <= delta
        && (((a.y + a.height) - (b.y + b.height)).abs() as f64) <= delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::TempDir;

    fn bright_detector_json() -> &'static str {
        // single stump over the full window: bright windows pass, dark fail
        r#"{
            "window_width": 8,
            "window_height": 8,
            "stages": [
                {
                    "threshold": 0.5,
                    "classifiers": [
                        {
                            "rects": [{"x": 0, "y": 0, "width": 8, "height": 8, "weight": 1.0}],
                            "threshold": 100.0,
                            "left": 0.0,
                            "right": 1.0
                        }
                    ]
                }
            ]
        }"#
    }

    // ── Integral image ───────────────────────────────────────────────

    #[test]
    fn test_integral_rect_sums() {
        let data = [1u8, 2, 3, 4];
        let integral = IntegralImage::new(&data, 2, 2);
        assert_eq!(integral.rect_sum(0, 0, 2, 2), 10);
        assert_eq!(integral.rect_sum(1, 0, 1, 2), 6);
        assert_eq!(integral.rect_sum(0, 1, 2, 1), 7);
        assert_eq!(integral.rect_sum(0, 0, 1, 1), 1);
        assert_eq!(integral.rect_sq_sum(0, 0, 2, 2), 30);
    }

    #[test]
    fn test_variance_norm_flat_window_is_one() {
        let data = vec![200u8; 16 * 16];
        let integral = IntegralImage::new(&data, 16, 16);
        let (mean, vnorm) = window_variance_norm(&integral, 0, 0, 16, 16);
        assert_relative_eq!(mean, 200.0, epsilon = 1e-9);
        assert_relative_eq!(vnorm, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_variance_norm_contrast_window() {
        // half 0, half 200: mean 100, variance 10000, vnorm 100
        let mut data = vec![0u8; 4 * 4];
        for v in data.iter_mut().take(8) {
            *v = 200;
        }
        let integral = IntegralImage::new(&data, 4, 4);
        let (mean, vnorm) = window_variance_norm(&integral, 0, 0, 4, 4);
        assert_relative_eq!(mean, 100.0, epsilon = 1e-9);
        assert_relative_eq!(vnorm, 100.0, epsilon = 1e-9);
    }

    // ── Cascade evaluation ───────────────────────────────────────────

    #[test]
    fn test_bright_window_passes_dark_fails() {
        let cascade: HaarCascade = serde_json::from_str(bright_detector_json()).unwrap();
        let bright = vec![255u8; 8 * 8];
        let dark = vec![0u8; 8 * 8];

        let integral = IntegralImage::new(&bright, 8, 8);
        assert!(evaluate_window(&cascade, &integral, 0, 0, 8, 8, 1.0));

        let integral = IntegralImage::new(&dark, 8, 8);
        assert!(!evaluate_window(&cascade, &integral, 0, 0, 8, 8, 1.0));
    }

    #[test]
    fn test_sweep_finds_single_window_on_exact_fit() {
        let cascade: HaarCascade = serde_json::from_str(bright_detector_json()).unwrap();
        let data = vec![255u8; 8 * 8];
        let integral = IntegralImage::new(&data, 8, 8);
        let windows = sweep_windows(&cascade, &integral, 8, 8, 1.1);
        assert_eq!(windows, vec![BBox::new(0, 0, 8, 8)]);
    }

    #[test]
    fn test_sweep_scales_up_to_frame_size() {
        let cascade: HaarCascade = serde_json::from_str(bright_detector_json()).unwrap();
        let data = vec![255u8; 32 * 32];
        let integral = IntegralImage::new(&data, 32, 32);
        let windows = sweep_windows(&cascade, &integral, 32, 32, 2.0);
        // scales 1x (8px) and 2x (16px) and 4x (32px) all fit
        assert!(windows.contains(&BBox::new(0, 0, 8, 8)));
        assert!(windows.contains(&BBox::new(0, 0, 16, 16)));
        assert!(windows.contains(&BBox::new(0, 0, 32, 32)));
    }

    // ── Grouping ─────────────────────────────────────────────────────

    #[test]
    fn test_group_windows_averages_neighbors() {
        let windows = vec![
            BBox::new(10, 10, 40, 40),
            BBox::new(12, 11, 40, 40),
            BBox::new(11, 12, 40, 40),
        ];
        let grouped = group_windows(windows, 3);
        assert_eq!(grouped, vec![BBox::new(11, 11, 40, 40)]);
    }

    #[test]
    fn test_group_windows_drops_lonely_window() {
        let windows = vec![
            BBox::new(10, 10, 40, 40),
            BBox::new(11, 11, 40, 40),
            BBox::new(200, 200, 40, 40),
        ];
        let grouped = group_windows(windows, 2);
        assert_eq!(grouped.len(), 1);
        assert!(grouped[0].x < 100);
    }

    #[test]
    fn test_group_windows_min_neighbors_one_keeps_all() {
        let windows = vec![BBox::new(10, 10, 40, 40), BBox::new(200, 200, 40, 40)];
        assert_eq!(group_windows(windows, 1).len(), 2);
    }

    #[test]
    fn test_similar_windows_tolerance() {
        let a = BBox::new(100, 100, 50, 50);
        // delta = 0.2 * 0.5 * (50 + 50) = 10
        assert!(similar_windows(&a, &BBox::new(109, 100, 50, 50)));
        assert!(!similar_windows(&a, &BBox::new(111, 100, 50, 50)));
        assert!(!similar_windows(&a, &BBox::new(100, 100, 80, 50)));
    }

    // ── Loading / resolution ─────────────────────────────────────────

    #[test]
    fn test_load_cascade_rejects_empty_stages() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.json");
        fs::write(
            &path,
            r#"{"window_width": 24, "window_height": 24, "stages": []}"#,
        )
        .unwrap();
        assert!(matches!(
            load_cascade(&path),
            Err(CascadeError::Invalid { .. })
        ));
    }

    #[test]
    fn test_load_cascade_reports_parse_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_cascade(&path),
            Err(CascadeError::Parse { .. })
        ));
    }

    #[test]
    fn test_resolve_prefers_override_then_model_dir() {
        let tmp = TempDir::new().unwrap();
        let override_path = tmp.path().join("custom.json");
        fs::write(&override_path, "{}").unwrap();
        let resolved = resolve_cascade_path(Some(&override_path), None).unwrap();
        assert_eq!(resolved, override_path);

        let dir = tmp.path().join("models");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(HAAR_CASCADE_NAME), "{}").unwrap();
        let resolved = resolve_cascade_path(Some(&tmp.path().join("missing.json")), Some(&dir));
        assert_eq!(resolved.unwrap(), dir.join(HAAR_CASCADE_NAME));
    }

    #[test]
    fn test_resolve_not_found_lists_searched_paths() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        let dir = tmp.path().join("models");
        let err = resolve_cascade_path(Some(&missing), Some(&dir)).unwrap_err();
        match err {
            CascadeError::NotFound { searched } => {
                assert!(searched.contains(&missing));
                assert!(searched.contains(&dir.join(HAAR_CASCADE_NAME)));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_scale_factor_must_exceed_one() {
        let config = HaarConfig {
            scale_factor: 1.0,
            ..HaarConfig::default()
        };
        let err = HaarEngine::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("scale factor"));
    }

    // ── End to end on a synthetic frame ──────────────────────────────

    #[test]
    fn test_detect_bright_face_on_dark_frame() {
        let cascade: HaarCascade = serde_json::from_str(bright_detector_json()).unwrap();
        let mut engine = HaarEngine {
            cascade,
            scale_factor: 1.5,
            min_neighbors: 1,
            max_detection_width: 0,
        };

        // dark 64x64 gray frame with a bright 16x16 block at (24, 24)
        let mut data = vec![0u8; 64 * 64];
        for y in 24..40 {
            for x in 24..40 {
                data[y * 64 + x] = 255;
            }
        }
        let frame = Frame::new(data, 64, 64, 1, 0);

        let records = engine.detect(&frame).unwrap();
        assert!(!records.is_empty());
        for record in &records {
            let b = &record.bbox;
            assert!(b.x >= 0 && b.y >= 0);
            assert!(b.x + b.width <= 64 && b.y + b.height <= 64);
            assert_eq!(record.source_detector, SOURCE_TAG);
            // every accepted window overlaps the bright block
            assert!(b.x < 40 && b.x + b.width > 24);
            assert!(b.y < 40 && b.y + b.height > 24);
        }
    }
}
