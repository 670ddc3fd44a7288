//! Shared math utilities for detection infrastructure.
//!
//! Raw-detection geometry, non-maximum suppression and a small
//! normal-equations solver used across multiple backends.

use ndarray::{Array1, Array2};

/// Candidate detection in working-resolution pixels, before NMS and
/// before conversion into a record.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub keypoints: Vec<[f32; 2]>,
}

impl RawDetection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            keypoints: Vec::new(),
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// IoU between two raw detections.
pub fn raw_iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    inter / (area_a + area_b - inter)
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(mut dets: Vec<RawDetection>, iou_thresh: f32) -> Vec<RawDetection> {
    dets.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; dets.len()];

    for i in 0..dets.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(dets[i].clone());
        for j in (i + 1)..dets.len() {
            if suppressed[j] {
                continue;
            }
            if raw_iou(&dets[i], &dets[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

/// Ridge-regularized least squares: solves `(AᵀA + λI)x = Aᵀb`.
///
/// Gaussian elimination with partial pivoting; the system stays small
/// (tens of coefficients), so no factorization library is warranted.
/// Returns `None` when the system is singular even after regularization.
pub fn solve_ridge(a: &Array2<f32>, b: &Array1<f32>, lambda: f32) -> Option<Array1<f32>> {
    let n = a.ncols();
    if a.nrows() != b.len() || n == 0 {
        return None;
    }

    let mut lhs = a.t().dot(a);
    for i in 0..n {
        lhs[[i, i]] += lambda;
    }
    let mut rhs = a.t().dot(b);

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if lhs[[row, col]].abs() > lhs[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if lhs[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                let tmp = lhs[[col, k]];
                lhs[[col, k]] = lhs[[pivot, k]];
                lhs[[pivot, k]] = tmp;
            }
            rhs.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = lhs[[row, col]] / lhs[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                lhs[[row, k]] -= factor * lhs[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::<f32>::zeros(n);
    for col in (0..n).rev() {
        let mut sum = rhs[col];
        for k in (col + 1)..n {
            sum -= lhs[[col, k]] * x[k];
        }
        x[col] = sum / lhs[[col, col]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_sigmoid_zero() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_saturates() {
        assert!((sigmoid(10.0) - 1.0).abs() < 0.001);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_raw_iou_no_overlap() {
        let a = RawDetection::new(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = RawDetection::new(20.0, 20.0, 30.0, 30.0, 1.0);
        assert_eq!(raw_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_raw_iou_perfect_overlap() {
        let a = RawDetection::new(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((raw_iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_raw_iou_partial_overlap() {
        let a = RawDetection::new(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = RawDetection::new(5.0, 5.0, 15.0, 15.0, 1.0);
        let expected = 25.0 / 175.0;
        assert!((raw_iou(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let dets = vec![
            RawDetection::new(0.0, 0.0, 100.0, 100.0, 0.9),
            RawDetection::new(5.0, 5.0, 105.0, 105.0, 0.7),
        ];
        let kept = nms(dets, 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_nms_keeps_separate() {
        let dets = vec![
            RawDetection::new(0.0, 0.0, 50.0, 50.0, 0.9),
            RawDetection::new(200.0, 200.0, 250.0, 250.0, 0.8),
        ];
        let kept = nms(dets, 0.3);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_orders_by_score() {
        let dets = vec![
            RawDetection::new(200.0, 200.0, 250.0, 250.0, 0.5),
            RawDetection::new(0.0, 0.0, 50.0, 50.0, 0.9),
        ];
        let kept = nms(dets, 0.3);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.5);
    }

    #[test]
    fn test_solve_ridge_identity_system() {
        // A = I, b = [3, 4] with no regularization → x = b
        let a = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let b = arr1(&[3.0, 4.0]);
        let x = solve_ridge(&a, &b, 0.0).unwrap();
        assert_relative_eq!(x[0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(x[1], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_solve_ridge_overdetermined() {
        // Best fit of y = 2x from three noisy-free observations.
        let a = arr2(&[[1.0], [2.0], [3.0]]);
        let b = arr1(&[2.0, 4.0, 6.0]);
        let x = solve_ridge(&a, &b, 0.0).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_solve_ridge_regularization_shrinks_solution() {
        let a = arr2(&[[1.0], [2.0], [3.0]]);
        let b = arr1(&[2.0, 4.0, 6.0]);
        let plain = solve_ridge(&a, &b, 0.0).unwrap();
        let ridged = solve_ridge(&a, &b, 10.0).unwrap();
        assert!(ridged[0].abs() < plain[0].abs());
        assert!(ridged[0] > 0.0);
    }

    #[test]
    fn test_solve_ridge_singular_without_regularization() {
        // Rank-deficient: second column is a multiple of the first.
        let a = arr2(&[[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]]);
        let b = arr1(&[1.0, 2.0, 3.0]);
        assert!(solve_ridge(&a, &b, 0.0).is_none());
        // Ridge term restores solvability.
        assert!(solve_ridge(&a, &b, 1.0).is_some());
    }

    #[test]
    fn test_solve_ridge_dimension_mismatch() {
        let a = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let b = arr1(&[1.0, 2.0, 3.0]);
        assert!(solve_ridge(&a, &b, 0.0).is_none());
    }
}
