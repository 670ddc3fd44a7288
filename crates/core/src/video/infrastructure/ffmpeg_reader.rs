use std::path::Path;

use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::video_reader::VideoReader;

/// Decodes video frames via ffmpeg-next (libavformat + libavcodec).
///
/// Converts each decoded frame to RGB24 and wraps it in a [`Frame`].
/// Seeking issues a backward-biased container seek to the nearest
/// keyframe at or before the target, flushes the decoder, and decodes
/// forward to the exact frame index.
pub struct FfmpegReader {
    state: Option<OpenState>,
}

// Safety: FfmpegReader is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegReader {}

struct OpenState {
    ictx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    video_stream_index: usize,
    fps: f64,
    time_base_seconds: f64,
    next_frame_index: usize,
    // Decode-forward target set by `seek`; frames with a smaller
    // timestamp-derived index are discarded.
    pending_skip: Option<usize>,
    flushing: bool,
    done: bool,
}

impl FfmpegReader {
    pub fn new() -> Self {
        Self { state: None }
    }
}

impl Default for FfmpegReader {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoReader for FfmpegReader {
    fn open(&mut self, path: &Path) -> Result<VideoMetadata, Box<dyn std::error::Error>> {
        ffmpeg_next::init()?;

        let ictx = ffmpeg_next::format::input(path)?;

        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or("No video stream found")?;

        let video_stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let time_base = stream.time_base();
        let time_base_seconds = if time_base.denominator() != 0 {
            time_base.numerator() as f64 / time_base.denominator() as f64
        } else {
            0.0
        };

        // Some containers do not carry a frame count; estimate from the
        // stream duration when possible.
        let total_frames = if stream.frames() > 0 {
            stream.frames() as usize
        } else if stream.duration() > 0 && fps > 0.0 {
            (stream.duration() as f64 * time_base_seconds * fps).round() as usize
        } else {
            0
        };

        let metadata = VideoMetadata {
            width: decoder.width(),
            height: decoder.height(),
            fps,
            total_frames,
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            source_path: Some(path.to_path_buf()),
        };

        let width = decoder.width();
        let height = decoder.height();
        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )?;

        self.state = Some(OpenState {
            ictx,
            decoder,
            scaler,
            width,
            height,
            video_stream_index,
            fps,
            time_base_seconds,
            next_frame_index: 0,
            pending_skip: None,
            flushing: false,
            done: false,
        });

        Ok(metadata)
    }

    fn read(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>> {
        let state = self.state.as_mut().ok_or("FfmpegReader: not opened")?;

        loop {
            let Some(decoded) = state.next_decoded()? else {
                return Ok(None);
            };

            if let Some(target) = state.pending_skip {
                let landed = state.frame_index_of(&decoded);
                if landed < target {
                    continue;
                }
                state.pending_skip = None;
                state.next_frame_index = landed;
            }

            let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
            state.scaler.run(&decoded, &mut rgb_frame)?;

            let pixels = extract_rgb_pixels(&rgb_frame, state.width, state.height);
            let frame = Frame::new(
                pixels,
                state.width,
                state.height,
                3,
                state.next_frame_index,
            );
            state.next_frame_index += 1;
            return Ok(Some(frame));
        }
    }

    fn seek(&mut self, frame_index: usize) -> Result<(), Box<dyn std::error::Error>> {
        let state = self.state.as_mut().ok_or("FfmpegReader: not opened")?;
        if state.fps <= 0.0 {
            return Err("cannot seek: stream has no frame rate".into());
        }

        let seconds = frame_index as f64 / state.fps;
        let position = (seconds * f64::from(ffmpeg_next::ffi::AV_TIME_BASE)) as i64;
        state.ictx.seek(position, ..position)?;

        state.decoder.flush();
        state.flushing = false;
        state.done = false;
        state.next_frame_index = frame_index;
        state.pending_skip = Some(frame_index);
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }
}

impl OpenState {
    fn receive(&mut self) -> Option<ffmpeg_next::util::frame::video::Video> {
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            Some(decoded)
        } else {
            None
        }
    }

    /// Pumps packets into the decoder until a frame comes out, switching
    /// to drain mode at end of stream.
    fn next_decoded(
        &mut self,
    ) -> Result<Option<ffmpeg_next::util::frame::video::Video>, Box<dyn std::error::Error>> {
        if self.done {
            return Ok(None);
        }

        if let Some(frame) = self.receive() {
            return Ok(Some(frame));
        }

        if self.flushing {
            self.done = true;
            return Ok(None);
        }

        loop {
            let Some((stream, packet)) = self.ictx.packets().next() else {
                let _ = self.decoder.send_eof();
                self.flushing = true;
                if let Some(frame) = self.receive() {
                    return Ok(Some(frame));
                }
                self.done = true;
                return Ok(None);
            };

            if stream.index() != self.video_stream_index {
                continue;
            }

            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }

            if let Some(frame) = self.receive() {
                return Ok(Some(frame));
            }
        }
    }

    /// Derives a frame index from the decoded frame's timestamp. Frames
    /// without a timestamp fall back to the sequential counter.
    fn frame_index_of(&self, decoded: &ffmpeg_next::util::frame::video::Video) -> usize {
        match decoded.pts() {
            Some(pts) if self.fps > 0.0 && self.time_base_seconds > 0.0 => {
                let seconds = pts as f64 * self.time_base_seconds;
                (seconds * self.fps).round().max(0.0) as usize
            }
            _ => self.next_frame_index,
        }
    }
}

/// Copies pixel data from an ffmpeg frame into a contiguous RGB buffer.
///
/// ffmpeg frames may have padding bytes at the end of each row (stride > width*3).
/// This function strips that padding to produce a tightly-packed pixel buffer.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let w = width as usize;
    let h = height as usize;

    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}

/// Encodes a tiny MPEG4 video of flat gray frames for tests; frame `i`
/// holds the value `(i * 40) % 256` in every channel.
#[cfg(test)]
pub(crate) fn create_test_video(
    path: &Path,
    num_frames: usize,
    width: u32,
    height: u32,
    fps: f64,
) {
    ffmpeg_next::init().unwrap();

    let mut octx = ffmpeg_next::format::output(path).unwrap();

    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

    let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4).unwrap();
    let mut ost = octx.add_stream(Some(codec)).unwrap();

    let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .unwrap();

    encoder_ctx.set_width(width);
    encoder_ctx.set_height(height);
    encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
    encoder_ctx.set_time_base(ffmpeg_next::Rational(1, fps as i32));
    encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational(fps as i32, 1)));

    if global_header {
        encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }

    let mut encoder = encoder_ctx
        .open_with(ffmpeg_next::Dictionary::new())
        .unwrap();
    ost.set_parameters(&encoder);

    octx.write_header().unwrap();

    let ost_time_base = octx.stream(0).unwrap().time_base();

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        ffmpeg_next::format::Pixel::RGB24,
        width,
        height,
        ffmpeg_next::format::Pixel::YUV420P,
        width,
        height,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )
    .unwrap();

    for i in 0..num_frames {
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
        );
        let stride = rgb_frame.stride(0);
        let data = rgb_frame.data_mut(0);
        let value = ((i * 40) % 256) as u8;
        for row in 0..height as usize {
            for col in 0..width as usize {
                let offset = row * stride + col * 3;
                data[offset] = value;
                data[offset + 1] = value;
                data[offset + 2] = value;
            }
        }

        let mut yuv_frame = ffmpeg_next::util::frame::video::Video::empty();
        scaler.run(&rgb_frame, &mut yuv_frame).unwrap();
        yuv_frame.set_pts(Some(i as i64));

        encoder.send_frame(&yuv_frame).unwrap();

        let mut encoded = ffmpeg_next::Packet::empty();
        while encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(0);
            encoded.rescale_ts(ffmpeg_next::Rational(1, fps as i32), ost_time_base);
            encoded.write_interleaved(&mut octx).unwrap();
        }
    }

    encoder.send_eof().unwrap();
    let mut encoded = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(0);
        encoded.rescale_ts(ffmpeg_next::Rational(1, fps as i32), ost_time_base);
        encoded.write_interleaved(&mut octx).unwrap();
    }

    octx.write_trailer().unwrap();
}
