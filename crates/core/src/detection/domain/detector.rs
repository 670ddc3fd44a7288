use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::{ColorSpace, Frame};

/// Capability contract every detection backend implements.
///
/// Implementations are stateful (throttle counters, spatial caches, native
/// session handles), hence `&mut self`. A call may return the last
/// computed result instead of a fresh one; that relaxation is part of the
/// contract, not an implementation accident. No file I/O happens inside
/// `detect`.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>>;

    /// Pixel layout this backend expects; the caller converts each frame
    /// exactly once before the call.
    fn color_space(&self) -> ColorSpace {
        ColorSpace::Rgb
    }

    /// Tag written into `DetectionRecord::source_detector`.
    fn source_tag(&self) -> &'static str;
}
