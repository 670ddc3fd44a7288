pub mod bbox;
pub mod blendshapes;
pub mod constants;
pub mod detection_record;
pub mod frame;
pub mod video_metadata;
