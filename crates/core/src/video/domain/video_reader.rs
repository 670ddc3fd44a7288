use std::path::Path;

use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;

/// Reads frames from a video source.
///
/// Implementations handle I/O details (codec, container format, seeking)
/// while the pipeline works with the abstract `Frame` and `VideoMetadata`
/// types.
pub trait VideoReader: Send {
    /// Opens a video file and returns its metadata.
    fn open(&mut self, path: &Path) -> Result<VideoMetadata, Box<dyn std::error::Error>>;

    /// Decodes and returns the next frame, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>>;

    /// Repositions the reader so the next `read` returns `frame_index`.
    fn seek(&mut self, frame_index: usize) -> Result<(), Box<dyn std::error::Error>>;

    /// Releases any resources held by the reader.
    fn close(&mut self);
}
