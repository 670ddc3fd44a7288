use serde::Serialize;

/// Axis-aligned box in original-frame pixel space.
///
/// Coordinates are integers; backends working at a reduced resolution
/// rescale and clamp before building one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    #[serde(rename = "w")]
    pub width: i32,
    #[serde(rename = "h")]
    pub height: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rounds float corner coordinates into an integer box.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let x = x1.round() as i32;
        let y = y1.round() as i32;
        Self {
            x,
            y,
            width: (x2.round() as i32 - x).max(0),
            height: (y2.round() as i32 - y).max(0),
        }
    }

    /// Corner-clamps the box into `[0,0,frame_width,frame_height]`.
    pub fn clamped(&self, frame_width: u32, frame_height: u32) -> BBox {
        let fw = frame_width as i32;
        let fh = frame_height as i32;
        let x1 = self.x.clamp(0, fw);
        let y1 = self.y.clamp(0, fh);
        let x2 = (self.x + self.width).clamp(0, fw);
        let y2 = (self.y + self.height).clamp(0, fh);
        BBox::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
    }

    /// Scales position and size back to original-frame space.
    pub fn scaled(&self, sx: f64, sy: f64) -> BBox {
        BBox::new(
            (self.x as f64 * sx).round() as i32,
            (self.y as f64 * sy).round() as i32,
            (self.width as f64 * sx).round() as i32,
            (self.height as f64 * sy).round() as i32,
        )
    }

    pub fn centroid(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Spatial-identity key derived from the integer corners.
    ///
    /// A positional proxy for "the same face" across consecutive frames;
    /// not a tracker.
    pub fn corner_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.x,
            self.y,
            self.x + self.width,
            self.y + self.height
        )
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.width).min(other.x + other.width);
        let iy2 = (self.y + self.height).min(other.y + other.height);

        let inter = (ix2 - ix1).max(0) as f64 * (iy2 - iy1).max(0) as f64;
        if inter == 0.0 {
            return 0.0;
        }

        let area_a = self.width as f64 * self.height as f64;
        let area_b = other.width as f64 * other.height as f64;
        inter / (area_a + area_b - inter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    // ── Clamping ─────────────────────────────────────────────────────

    #[test]
    fn test_clamped_inside_is_unchanged() {
        let b = BBox::new(10, 20, 30, 40);
        assert_eq!(b.clamped(640, 480), b);
    }

    #[test]
    fn test_clamped_negative_origin() {
        let b = BBox::new(-15, -10, 100, 100);
        let c = b.clamped(640, 480);
        assert_eq!(c, BBox::new(0, 0, 85, 90));
    }

    #[test]
    fn test_clamped_overflowing_extent() {
        let b = BBox::new(600, 450, 100, 100);
        let c = b.clamped(640, 480);
        assert_eq!(c, BBox::new(600, 450, 40, 30));
    }

    #[test]
    fn test_clamped_fully_outside_collapses() {
        let b = BBox::new(700, 500, 50, 50);
        let c = b.clamped(640, 480);
        assert!(c.is_empty());
        assert_eq!(c.x, 640);
        assert_eq!(c.y, 480);
    }

    #[rstest]
    #[case::negative_both(BBox::new(-50, -50, 40, 40))]
    #[case::straddles_right(BBox::new(630, 10, 50, 50))]
    #[case::huge(BBox::new(-1000, -1000, 5000, 5000))]
    fn test_clamped_always_in_bounds(#[case] b: BBox) {
        let c = b.clamped(640, 480);
        assert!(c.x >= 0 && c.y >= 0);
        assert!(c.x + c.width <= 640);
        assert!(c.y + c.height <= 480);
        assert!(c.width >= 0 && c.height >= 0);
    }

    // ── Scaling / corners ────────────────────────────────────────────

    #[test]
    fn test_scaled_doubles_geometry() {
        let b = BBox::new(10, 20, 30, 40);
        assert_eq!(b.scaled(2.0, 2.0), BBox::new(20, 40, 60, 80));
    }

    #[test]
    fn test_scaled_rounds_to_nearest() {
        let b = BBox::new(3, 3, 3, 3);
        // 3 * 1.5 = 4.5, rounds away from zero
        assert_eq!(b.scaled(1.5, 1.5), BBox::new(5, 5, 5, 5));
    }

    #[test]
    fn test_from_corners_rounds() {
        let b = BBox::from_corners(9.6, 10.4, 50.5, 60.2);
        assert_eq!(b, BBox::new(10, 10, 41, 50));
    }

    #[test]
    fn test_from_corners_inverted_collapses_to_empty() {
        let b = BBox::from_corners(50.0, 50.0, 10.0, 10.0);
        assert!(b.is_empty());
    }

    // ── Centroid / identity ──────────────────────────────────────────

    #[test]
    fn test_centroid() {
        let b = BBox::new(10, 20, 30, 41);
        assert_eq!(b.centroid(), (25, 40));
    }

    #[test]
    fn test_corner_key_format() {
        let b = BBox::new(10, 20, 30, 40);
        assert_eq!(b.corner_key(), "10:20:40:60");
    }

    #[test]
    fn test_corner_key_differs_when_box_moves() {
        let a = BBox::new(10, 20, 30, 40);
        let b = BBox::new(11, 20, 30, 40);
        assert_ne!(a.corner_key(), b.corner_key());
    }

    // ── IoU ──────────────────────────────────────────────────────────

    #[test]
    fn test_iou_identical() {
        let a = BBox::new(10, 10, 100, 100);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BBox::new(0, 0, 50, 50);
        let b = BBox::new(100, 100, 50, 50);
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        // intersection 50x100 = 5000, union 15000
        let a = BBox::new(0, 0, 100, 100);
        let b = BBox::new(50, 0, 100, 100);
        assert_relative_eq!(a.iou(&b), 5000.0 / 15000.0);
    }

    #[rstest]
    #[case::zero_width(BBox::new(0, 0, 0, 100), BBox::new(0, 0, 50, 50))]
    #[case::zero_height(BBox::new(0, 0, 100, 0), BBox::new(0, 0, 50, 50))]
    fn test_iou_degenerate_is_zero(#[case] a: BBox, #[case] b: BBox) {
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    // ── Serialization ────────────────────────────────────────────────

    #[test]
    fn test_serializes_with_short_keys() {
        let b = BBox::new(1, 2, 3, 4);
        let json = serde_json::to_value(b).unwrap();
        assert_eq!(json["x"], 1);
        assert_eq!(json["y"], 2);
        assert_eq!(json["w"], 3);
        assert_eq!(json["h"], 4);
    }
}
