use crate::shared::bbox::BBox;
use crate::shared::blendshapes::Blendshapes;
use crate::shared::frame::Frame;

/// Landmark stage of a composite pipeline: face box in, mesh out.
///
/// Returned points are original-frame pixels (the crop offset is already
/// applied). An empty mesh means the stage produced nothing for this
/// face; the caller emits a partial record rather than dropping it.
pub trait MeshRegressor: Send {
    fn regress(
        &mut self,
        frame: &Frame,
        bbox: &BBox,
    ) -> Result<Vec<[f32; 3]>, Box<dyn std::error::Error>>;
}

/// Expression stage: landmark mesh in, canonical coefficient set out.
///
/// `None` means the stage could not produce coefficients for this face
/// (too few landmarks, degenerate geometry); the record is still emitted.
pub trait ExpressionRegressor: Send {
    fn extract(
        &mut self,
        landmarks: &[[f32; 3]],
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Option<Blendshapes>, Box<dyn std::error::Error>>;
}
