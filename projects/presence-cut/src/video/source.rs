// FrameSource: indexed, forward-only frame iterator over a VideoReader
//
// Owns the decoder for the duration of one analysis pass. Reopen the file to
// iterate again.

use super::{open_reader, Backend, VideoReader};
use crate::error::PipelineError;
use crate::pipeline::types::Frame;
use std::path::Path;

/// Frame rate assumed when the container does not report a usable one.
pub const DEFAULT_FPS: f64 = 25.0;

/// Replace a missing, zero, negative or non-finite frame rate with the default.
pub fn effective_fps(reported: f64) -> f64 {
    if reported.is_finite() && reported > 0.0 {
        reported
    } else {
        DEFAULT_FPS
    }
}

pub struct FrameSource {
    reader: Box<dyn VideoReader>,
    label: String,
    fps: f64,
    total_frames: usize,
    next_index: usize,
    finished: bool,
}

impl FrameSource {
    pub fn open(path: &Path, backend: Backend) -> Result<Self, PipelineError> {
        let label = path.display().to_string();
        if !path.is_file() {
            return Err(PipelineError::source(label, "file does not exist"));
        }
        let reader =
            open_reader(&label, backend).map_err(|e| PipelineError::source(&label, e))?;
        Self::from_reader(label, reader)
    }

    pub fn from_reader(
        label: impl Into<String>,
        reader: Box<dyn VideoReader>,
    ) -> Result<Self, PipelineError> {
        let label = label.into();
        let reported = reader
            .source_fps()
            .map_err(|e| PipelineError::source(&label, e))?;
        let fps = effective_fps(reported);
        if fps != reported {
            tracing::warn!(
                "FrameSource: {} reports fps={}, falling back to {:.1}",
                label,
                reported,
                DEFAULT_FPS
            );
        }
        let total_frames = reader
            .frame_count()
            .map_err(|e| PipelineError::source(&label, e))?;

        Ok(Self {
            reader,
            label,
            fps,
            total_frames,
            next_index: 0,
            finished: false,
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.total_frames as f64 / self.fps
        } else {
            0.0
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Iterator for FrameSource {
    type Item = Result<Frame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.reader.next_frame() {
            Ok(Some(image)) => {
                let index = self.next_index;
                self.next_index += 1;
                Some(Ok(Frame { index, image }))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                // A decode failure ends the pass; it is never skipped.
                self.finished = true;
                Some(Err(PipelineError::source(
                    &self.label,
                    format!("frame {} could not be decoded: {}", self.next_index, e),
                )))
            }
        }
    }
}
