use std::path::Path;

use serde::Serialize;

use crate::detection::domain::detector::Detector;
use crate::shared::detection_record::DetectionRecord;
use crate::shared::frame::{ColorSpace, Frame};
use crate::video::domain::video_reader::VideoReader;

/// All detections found in one frame, in detector call order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameRecord {
    pub frame_index: usize,
    pub detections: Vec<DetectionRecord>,
}

/// Processes one contiguous chunk of frames with its own video handle and
/// engine instance.
///
/// The engine is constructed once per chunk and reused for every frame,
/// so its internal throttle counters and spatial cache carry across the
/// chunk. Each frame is color-converted at most once per detector. When a
/// secondary detector is present, its detections are appended to the
/// primary's under the same record schema.
pub struct FrameWorker {
    reader: Box<dyn VideoReader>,
    engine: Box<dyn Detector>,
    secondary: Option<Box<dyn Detector>>,
}

impl FrameWorker {
    pub fn new(
        reader: Box<dyn VideoReader>,
        engine: Box<dyn Detector>,
        secondary: Option<Box<dyn Detector>>,
    ) -> Self {
        Self {
            reader,
            engine,
            secondary,
        }
    }

    /// Opens `path` and returns one record per frame in `[start, end)`.
    ///
    /// For a chunk that does not begin at frame zero, a single read is
    /// issued before the seek; decoders settle their internal position on
    /// that first read, and its frame is discarded.
    pub fn process_chunk(
        &mut self,
        path: &Path,
        start: usize,
        end: usize,
    ) -> Result<Vec<FrameRecord>, Box<dyn std::error::Error>> {
        if start >= end {
            return Ok(Vec::new());
        }

        self.reader.open(path)?;

        if start > 0 {
            let _ = self.reader.read()?;
            self.reader.seek(start)?;
        }

        log::debug!(
            "chunk [{start}, {end}) started with engine {}",
            self.engine.source_tag()
        );

        // `end` may be usize::MAX when the frame count is unknown; cap the
        // reservation.
        let mut records = Vec::with_capacity((end - start).min(4096));
        while let Some(frame) = self.reader.read()? {
            if frame.index() >= end {
                break;
            }

            let detections = self.detect_frame(&frame)?;
            records.push(FrameRecord {
                frame_index: frame.index(),
                detections,
            });

            if frame.index() + 1 >= end {
                break;
            }
        }

        self.reader.close();
        Ok(records)
    }

    fn detect_frame(
        &mut self,
        frame: &Frame,
    ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
        let mut detections = detect_in_color_space(self.engine.as_mut(), frame)?;

        if let Some(secondary) = self.secondary.as_mut() {
            match detect_in_color_space(secondary.as_mut(), frame) {
                Ok(mut extra) => detections.append(&mut extra),
                Err(e) => log::warn!(
                    "secondary detector {} failed on frame {}: {e}",
                    secondary.source_tag(),
                    frame.index()
                ),
            }
        }

        Ok(detections)
    }
}

/// Converts the frame into the detector's expected color space, then runs
/// detection. RGB detectors receive the frame as decoded, without a copy.
fn detect_in_color_space(
    detector: &mut dyn Detector,
    frame: &Frame,
) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
    let converted = match detector.color_space() {
        ColorSpace::Rgb => None,
        ColorSpace::Bgr => Some(frame.swapped_rb()),
        ColorSpace::Gray => Some(frame.to_grayscale()),
    };
    detector.detect(converted.as_ref().unwrap_or(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::shared::bbox::BBox;
    use crate::shared::video_metadata::VideoMetadata;

    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct ScriptedReader {
        log: CallLog,
        frames: Vec<Frame>,
        cursor: usize,
    }

    impl ScriptedReader {
        fn new(log: CallLog, frames: Vec<Frame>) -> Self {
            Self {
                log,
                frames,
                cursor: 0,
            }
        }
    }

    impl VideoReader for ScriptedReader {
        fn open(&mut self, _path: &Path) -> Result<VideoMetadata, Box<dyn std::error::Error>> {
            self.log.push("open");
            Ok(VideoMetadata {
                width: 16,
                height: 16,
                fps: 30.0,
                total_frames: self.frames.len(),
                codec: String::new(),
                source_path: None,
            })
        }

        fn read(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>> {
            self.log.push("read");
            let frame = self.frames.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(frame)
        }

        fn seek(&mut self, frame_index: usize) -> Result<(), Box<dyn std::error::Error>> {
            self.log.push(format!("seek({frame_index})"));
            self.cursor = frame_index;
            Ok(())
        }

        fn close(&mut self) {
            self.log.push("close");
        }
    }

    struct StubEngine {
        tag: &'static str,
        space: ColorSpace,
        fail: bool,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
    }

    impl StubEngine {
        fn new(tag: &'static str) -> Self {
            Self {
                tag,
                space: ColorSpace::Rgb,
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn in_space(mut self, space: ColorSpace) -> Self {
            self.space = space;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    impl Detector for StubEngine {
        fn detect(
            &mut self,
            frame: &Frame,
        ) -> Result<Vec<DetectionRecord>, Box<dyn std::error::Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("stub engine failure".into());
            }
            self.seen
                .lock()
                .unwrap()
                .push((frame.channels(), frame.data()[..3].to_vec()));
            Ok(vec![DetectionRecord::new(
                BBox::new(1, 2, 3, 4),
                self.tag,
                "face",
                0.9,
            )])
        }

        fn color_space(&self) -> ColorSpace {
            self.space
        }

        fn source_tag(&self) -> &'static str {
            self.tag
        }
    }

    fn rgb_frame(index: usize) -> Frame {
        let data: Vec<u8> = [10u8, 20, 30].iter().copied().cycle().take(16 * 16 * 3).collect();
        Frame::new(data, 16, 16, 3, index)
    }

    fn frames(count: usize) -> Vec<Frame> {
        (0..count).map(rgb_frame).collect()
    }

    fn worker_with(
        log: CallLog,
        frame_count: usize,
        engine: StubEngine,
        secondary: Option<StubEngine>,
    ) -> FrameWorker {
        FrameWorker::new(
            Box::new(ScriptedReader::new(log, frames(frame_count))),
            Box::new(engine),
            secondary.map(|s| Box::new(s) as Box<dyn Detector>),
        )
    }

    // ── Chunk access pattern ──

    #[test]
    fn test_chunk_from_start_never_seeks() {
        let log = CallLog::default();
        let mut worker = worker_with(log.clone(), 5, StubEngine::new("alpha"), None);

        let records = worker.process_chunk(Path::new("in.mp4"), 0, 3).unwrap();

        let indices: Vec<usize> = records.iter().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(log.entries().iter().all(|e| !e.starts_with("seek")));
    }

    #[test]
    fn test_chunk_issues_read_before_seek() {
        let log = CallLog::default();
        let mut worker = worker_with(log.clone(), 5, StubEngine::new("alpha"), None);

        let records = worker.process_chunk(Path::new("in.mp4"), 3, 5).unwrap();

        let entries = log.entries();
        assert_eq!(entries[0], "open");
        assert_eq!(entries[1], "read");
        assert_eq!(entries[2], "seek(3)");

        let indices: Vec<usize> = records.iter().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![3, 4]);
    }

    #[test]
    fn test_chunk_closes_reader_when_done() {
        let log = CallLog::default();
        let mut worker = worker_with(log.clone(), 3, StubEngine::new("alpha"), None);

        worker.process_chunk(Path::new("in.mp4"), 0, 3).unwrap();

        assert_eq!(log.entries().last().map(String::as_str), Some("close"));
    }

    #[test]
    fn test_short_video_truncates_chunk() {
        let log = CallLog::default();
        let mut worker = worker_with(log, 4, StubEngine::new("alpha"), None);

        let records = worker.process_chunk(Path::new("in.mp4"), 0, 10).unwrap();

        assert_eq!(records.len(), 4);
    }

    #[test]
    fn test_empty_chunk_touches_nothing() {
        let log = CallLog::default();
        let mut worker = worker_with(log.clone(), 3, StubEngine::new("alpha"), None);

        let records = worker.process_chunk(Path::new("in.mp4"), 2, 2).unwrap();

        assert!(records.is_empty());
        assert!(log.entries().is_empty());
    }

    // ── Engine interaction ──

    #[test]
    fn test_engine_instance_reused_across_chunk() {
        let log = CallLog::default();
        let engine = StubEngine::new("alpha");
        let calls = engine.calls.clone();
        let mut worker = worker_with(log, 6, engine, None);

        worker.process_chunk(Path::new("in.mp4"), 0, 6).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_bgr_engine_sees_swapped_channels() {
        let log = CallLog::default();
        let engine = StubEngine::new("alpha").in_space(ColorSpace::Bgr);
        let seen = engine.seen.clone();
        let mut worker = worker_with(log, 1, engine, None);

        worker.process_chunk(Path::new("in.mp4"), 0, 1).unwrap();

        let observed = seen.lock().unwrap();
        assert_eq!(observed[0].1, vec![30, 20, 10]);
    }

    #[test]
    fn test_gray_engine_sees_single_channel() {
        let log = CallLog::default();
        let engine = StubEngine::new("alpha").in_space(ColorSpace::Gray);
        let seen = engine.seen.clone();
        let mut worker = worker_with(log, 1, engine, None);

        worker.process_chunk(Path::new("in.mp4"), 0, 1).unwrap();

        assert_eq!(seen.lock().unwrap()[0].0, 1);
    }

    #[test]
    fn test_rgb_engine_sees_frame_as_decoded() {
        let log = CallLog::default();
        let engine = StubEngine::new("alpha");
        let seen = engine.seen.clone();
        let mut worker = worker_with(log, 1, engine, None);

        worker.process_chunk(Path::new("in.mp4"), 0, 1).unwrap();

        let observed = seen.lock().unwrap();
        assert_eq!(observed[0], (3, vec![10, 20, 30]));
    }

    #[test]
    fn test_primary_failure_fails_chunk() {
        let log = CallLog::default();
        let mut worker = worker_with(log, 3, StubEngine::new("alpha").failing(), None);

        assert!(worker.process_chunk(Path::new("in.mp4"), 0, 3).is_err());
    }

    // ── Secondary detector merge ──

    #[test]
    fn test_secondary_detections_appended_with_own_tag() {
        let log = CallLog::default();
        let mut worker = worker_with(
            log,
            1,
            StubEngine::new("alpha"),
            Some(StubEngine::new("beta")),
        );

        let records = worker.process_chunk(Path::new("in.mp4"), 0, 1).unwrap();

        let tags: Vec<&str> = records[0]
            .detections
            .iter()
            .map(|d| d.source_detector.as_str())
            .collect();
        assert_eq!(tags, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_secondary_failure_keeps_primary_detections() {
        let log = CallLog::default();
        let mut worker = worker_with(
            log,
            1,
            StubEngine::new("alpha"),
            Some(StubEngine::new("beta").failing()),
        );

        let records = worker.process_chunk(Path::new("in.mp4"), 0, 1).unwrap();

        assert_eq!(records[0].detections.len(), 1);
        assert_eq!(records[0].detections[0].source_detector, "alpha");
    }
}
