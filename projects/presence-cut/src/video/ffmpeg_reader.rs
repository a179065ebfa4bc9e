use super::VideoReader;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use opencv::{core, prelude::*};
use std::path::Path;

/// Software decoder backed by ffmpeg-next. Frames are converted to BGR24 and
/// copied into owned OpenCV Mats.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Created on the first frame, once the decoded pixel format is known.
    scaler: Option<scaling::Context>,
    source_fps: f64,
    total_frames: usize,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: a reader is owned by exactly one pipeline run and never shared;
// the raw pointers inside ffmpeg-next types are not aliased across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let source = Path::new(path);
        if !source.exists() {
            return Err(anyhow!("Video file not found: {}", path));
        }

        let input_ctx = ffmpeg_next::format::input(&source).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path))?;
        let video_stream_index = video_stream.index();

        let rate = video_stream.avg_frame_rate();
        let source_fps = if rate.denominator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 && source_fps > 0.0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        let decoder = ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
            .context("Failed to create decoder context")?
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        tracing::info!(
            "FfmpegReader: opened {} ({}x{}), duration={:.2}s, fps={:.2}, estimated_frames={}",
            path,
            decoder.width(),
            decoder.height(),
            duration_secs,
            source_fps,
            total_frames
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            source_fps,
            total_frames,
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Receive the next decoded frame, feeding packets as needed.
    /// Returns `Ok(false)` once the decoder is fully drained.
    fn decode_next(&mut self, target: &mut VideoFrame) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until one belongs to the video stream, or flush on EOF.
            let mut fed = false;
            loop {
                match self.packet.read(&mut self.input_ctx) {
                    Ok(()) => {
                        if self.packet.stream() == self.video_stream_index {
                            self.decoder
                                .send_packet(&self.packet)
                                .context("Failed to send packet to decoder")?;
                            fed = true;
                            break;
                        }
                    }
                    Err(ffmpeg_next::Error::Eof) => break,
                    Err(e) => return Err(anyhow!("Failed to read packet: {}", e)),
                }
            }

            if !fed {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_bgr(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        if self.scaler.is_none() {
            self.scaler = Some(
                scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    Pixel::BGR24,
                    frame.width(),
                    frame.height(),
                    scaling::Flags::BILINEAR,
                )
                .context("Failed to create scaler")?,
            );
        }

        let mut bgr = VideoFrame::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut bgr).context("Scaler failed")?;
        }
        Ok(bgr)
    }
}

/// Deep-copy a BGR24 frame into a Mat that owns its data.
fn bgr_frame_to_mat(frame: &VideoFrame) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let row_bytes = width as usize * 3;
    let data = frame.data(0);
    let stride = frame.stride(0);

    let mut mat =
        core::Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, core::Scalar::all(0.0))?;

    for y in 0..height as usize {
        let src = &data[y * stride..y * stride + row_bytes];
        let dst = mat.ptr_mut(y as i32)?;
        // SAFETY: each Mat row holds `width * 3` contiguous bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, row_bytes);
        }
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn next_frame(&mut self) -> Result<Option<core::Mat>> {
        let mut raw = VideoFrame::empty();
        if !self.decode_next(&mut raw)? {
            return Ok(None);
        }
        let bgr = self.to_bgr(&raw)?;
        bgr_frame_to_mat(&bgr).map(Some)
    }
}
