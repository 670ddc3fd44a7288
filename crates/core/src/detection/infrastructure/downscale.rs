use std::borrow::Cow;

use crate::shared::bbox::BBox;
use crate::shared::frame::Frame;

/// Width-capped working copy of a frame, plus the mapping back to
/// original-frame pixels.
///
/// Resolution-sensitive detectors run on `frame()`; every coordinate they
/// produce goes through `restore_bbox`/`restore_point` so callers only
/// ever see original-frame pixel space.
pub struct WorkingCopy<'a> {
    frame: Cow<'a, Frame>,
    scale_x: f64,
    scale_y: f64,
}

impl<'a> WorkingCopy<'a> {
    /// Downscales to at most `max_width` columns (aspect preserved).
    /// A cap of 0 or a frame already within the cap is passed through.
    pub fn new(frame: &'a Frame, max_width: u32) -> Self {
        if max_width == 0 || frame.width() <= max_width {
            return Self {
                frame: Cow::Borrowed(frame),
                scale_x: 1.0,
                scale_y: 1.0,
            };
        }

        let work_w = max_width;
        let work_h =
            ((frame.height() as f64 * work_w as f64 / frame.width() as f64).round() as u32).max(1);
        let resized = resize_nearest(frame, work_w, work_h);
        Self {
            scale_x: frame.width() as f64 / work_w as f64,
            scale_y: frame.height() as f64 / work_h as f64,
            frame: Cow::Owned(resized),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn scale_x(&self) -> f64 {
        self.scale_x
    }

    pub fn scale_y(&self) -> f64 {
        self.scale_y
    }

    /// Maps a working-space box back to original pixels and clamps it.
    pub fn restore_bbox(&self, bbox: BBox, frame_width: u32, frame_height: u32) -> BBox {
        bbox.scaled(self.scale_x, self.scale_y)
            .clamped(frame_width, frame_height)
    }

    /// Maps a working-space landmark back to original pixels. Depth
    /// follows the horizontal scale.
    pub fn restore_point(&self, point: [f32; 3]) -> [f32; 3] {
        [
            point[0] * self.scale_x as f32,
            point[1] * self.scale_y as f32,
            point[2] * self.scale_x as f32,
        ]
    }
}

/// Nearest-neighbor resize preserving channel count.
fn resize_nearest(frame: &Frame, dst_w: u32, dst_h: u32) -> Frame {
    let src = frame.data();
    let channels = frame.channels() as usize;
    let src_w = frame.width() as usize;
    let src_h = frame.height() as usize;
    let dw = dst_w as usize;
    let dh = dst_h as usize;

    let mut data = vec![0u8; dw * dh * channels];
    for y in 0..dh {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / dh as f64) as usize).min(src_h - 1);
        for x in 0..dw {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / dw as f64) as usize).min(src_w - 1);
            let src_off = (src_y * src_w + src_x) * channels;
            let dst_off = (y * dw + x) * channels;
            data[dst_off..dst_off + channels].copy_from_slice(&src[src_off..src_off + channels]);
        }
    }
    Frame::new(data, dst_w, dst_h, frame.channels(), frame.index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(
            vec![value; (width * height * 3) as usize],
            width,
            height,
            3,
            0,
        )
    }

    #[test]
    fn test_no_downscale_when_within_cap() {
        let frame = solid_frame(320, 240, 7);
        let wc = WorkingCopy::new(&frame, 640);
        assert_eq!(wc.frame().width(), 320);
        assert_relative_eq!(wc.scale_x(), 1.0);
        assert_relative_eq!(wc.scale_y(), 1.0);
    }

    #[test]
    fn test_zero_cap_disables_downscale() {
        let frame = solid_frame(1920, 1080, 7);
        let wc = WorkingCopy::new(&frame, 0);
        assert_eq!(wc.frame().width(), 1920);
    }

    #[test]
    fn test_downscale_halves_and_preserves_aspect() {
        let frame = solid_frame(1280, 720, 50);
        let wc = WorkingCopy::new(&frame, 640);
        assert_eq!(wc.frame().width(), 640);
        assert_eq!(wc.frame().height(), 360);
        assert_relative_eq!(wc.scale_x(), 2.0);
        assert_relative_eq!(wc.scale_y(), 2.0);
        assert_eq!(wc.frame().data()[0], 50);
    }

    #[test]
    fn test_restore_bbox_rescales_and_clamps() {
        let frame = solid_frame(1280, 720, 0);
        let wc = WorkingCopy::new(&frame, 640);
        // working-space box near the right edge
        let restored = wc.restore_bbox(BBox::new(600, 300, 60, 60), 1280, 720);
        assert_eq!(restored.x, 1200);
        assert_eq!(restored.y, 600);
        // width clipped so the box ends at the frame edge
        assert_eq!(restored.x + restored.width, 1280);
        assert_eq!(restored.y + restored.height, 720);
    }

    #[test]
    fn test_restore_point_scales_each_axis() {
        let frame = solid_frame(1000, 500, 0);
        let wc = WorkingCopy::new(&frame, 500);
        // 1000x500 capped at 500 → 500x250, scale 2x both axes
        let p = wc.restore_point([10.0, 20.0, 5.0]);
        assert_relative_eq!(p[0], 20.0);
        assert_relative_eq!(p[1], 40.0);
        assert_relative_eq!(p[2], 10.0);
    }

    #[test]
    fn test_downscale_vs_direct_tolerance() {
        // A block of bright pixels keeps its position within a couple of
        // pixels after down-and-restore.
        let mut data = vec![0u8; 1280 * 720 * 3];
        for y in 100..200 {
            for x in 400..520 {
                let off = (y * 1280 + x) * 3;
                data[off] = 255;
                data[off + 1] = 255;
                data[off + 2] = 255;
            }
        }
        let frame = Frame::new(data, 1280, 720, 3, 0);
        let wc = WorkingCopy::new(&frame, 640);

        // locate the block in working space
        let work = wc.frame();
        let arr = work.as_ndarray();
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        for y in 0..work.height() {
            for x in 0..work.width() {
                if arr[[y as usize, x as usize, 0]] > 128 {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                }
            }
        }
        let restored = wc.restore_bbox(
            BBox::new(min_x as i32, min_y as i32, 1, 1),
            1280,
            720,
        );
        assert!((restored.x - 400).abs() <= 2, "x drifted: {}", restored.x);
        assert!((restored.y - 100).abs() <= 2, "y drifted: {}", restored.y);
    }

    #[test]
    fn test_resize_preserves_single_channel() {
        let gray = Frame::new(vec![9u8; 100 * 50], 100, 50, 1, 3);
        let wc = WorkingCopy::new(&gray, 50);
        assert_eq!(wc.frame().channels(), 1);
        assert_eq!(wc.frame().width(), 50);
        assert_eq!(wc.frame().height(), 25);
        assert_eq!(wc.frame().index(), 3);
    }
}
