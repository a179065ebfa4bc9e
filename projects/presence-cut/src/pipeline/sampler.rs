// Presence sampling
//
// Every `stride`-th frame is downscaled to the analysis width and classified;
// the frames in between inherit the last sampled decision. The whole pass is
// a fold over the frame iterator, so no state survives between runs.

use crate::error::PipelineError;
use crate::pipeline::detection::{FrameClassifier, PERSON_CLASS_ID};
use crate::pipeline::types::{Detection, Frame, RunState};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const DEFAULT_STRIDE: i64 = 10;
pub const DEFAULT_MIN_AREA_RATIO: f64 = 0.01;
pub const DEFAULT_MAX_AREA_RATIO: f64 = 1.0;
pub const ANALYSIS_WIDTH: i32 = 640;

/// Raw analysis parameters as received from a caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Process every Nth frame
    pub stride: i64,
    pub min_area_ratio: f64,
    pub max_area_ratio: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            stride: DEFAULT_STRIDE,
            min_area_ratio: DEFAULT_MIN_AREA_RATIO,
            max_area_ratio: DEFAULT_MAX_AREA_RATIO,
        }
    }
}

impl SamplerConfig {
    /// Reject strides below one and windows that are inverted or outside [0, 1].
    pub fn validate(&self) -> Result<SamplerSettings, PipelineError> {
        if self.stride < 1 {
            return Err(PipelineError::config(format!(
                "stride must be at least 1, got {}",
                self.stride
            )));
        }

        let (min, max) = (self.min_area_ratio, self.max_area_ratio);
        if !min.is_finite() || !max.is_finite() {
            return Err(PipelineError::config("area ratios must be finite numbers"));
        }
        if min < 0.0 || max > 1.0 {
            return Err(PipelineError::config(format!(
                "area ratio window [{}, {}] must lie within [0, 1]",
                min, max
            )));
        }
        if min > max {
            return Err(PipelineError::config(format!(
                "min_area_ratio {} is greater than max_area_ratio {}",
                min, max
            )));
        }

        Ok(SamplerSettings {
            stride: self.stride as usize,
            window: AreaWindow { min, max },
            analysis_width: ANALYSIS_WIDTH,
            person_class_id: PERSON_CLASS_ID,
        })
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct AreaWindow {
    pub min: f64,
    pub max: f64,
}

impl AreaWindow {
    pub fn contains(&self, ratio: f64) -> bool {
        self.min <= ratio && ratio <= self.max
    }
}

/// Validated sampler parameters.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    pub stride: usize,
    pub window: AreaWindow,
    pub analysis_width: i32,
    pub person_class_id: usize,
}

/// Outcome of classifying a single sampled frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameVerdict {
    pub person_seen: bool,
    pub qualifies: bool,
}

/// Decide whether any person in `detections` fills a share of the analysis
/// frame that lies inside the window. Stops at the first qualifying person.
pub fn evaluate_detections(
    detections: &[Detection],
    analysis_area: f64,
    window: AreaWindow,
    person_class_id: usize,
) -> FrameVerdict {
    let mut verdict = FrameVerdict::default();
    if analysis_area <= 0.0 {
        return verdict;
    }

    for det in detections.iter().filter(|d| d.class_id == person_class_id) {
        verdict.person_seen = true;
        if window.contains(det.bbox.area() / analysis_area) {
            verdict.qualifies = true;
            break;
        }
    }

    verdict
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct PresenceReport {
    pub presence: Vec<bool>,
    pub sampled_frames: usize,
    pub any_person_detected: bool,
    pub any_valid_size: bool,
}

impl PresenceReport {
    /// Fold step: sampled frames contribute a verdict, others repeat the
    /// previous value (or `false` before the first sample).
    fn push(mut self, verdict: Option<FrameVerdict>) -> Self {
        let present = match verdict {
            Some(v) => {
                self.sampled_frames += 1;
                self.any_person_detected |= v.person_seen;
                self.any_valid_size |= v.qualifies;
                v.qualifies
            }
            None => self.presence.last().copied().unwrap_or(false),
        };
        self.presence.push(present);
        self
    }
}

/// Resize to `target_width`, preserving aspect ratio (height rounds down).
pub fn resize_to_width(image: &Mat, target_width: i32) -> opencv::Result<Mat> {
    let size = image.size()?;
    if size.width <= 0 || size.height <= 0 {
        return Err(opencv::Error::new(
            opencv::core::StsBadSize,
            format!("cannot resize a {}x{} frame", size.width, size.height),
        ));
    }

    let scale = target_width as f64 / size.width as f64;
    let height = ((size.height as f64 * scale) as i32).max(1);

    let mut resized = Mat::default();
    imgproc::resize(
        image,
        &mut resized,
        Size::new(target_width, height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Classify a single frame at the analysis resolution.
fn classify_frame<C>(
    frame: &Frame,
    classifier: &mut C,
    settings: &SamplerSettings,
) -> Result<FrameVerdict, PipelineError>
where
    C: FrameClassifier + ?Sized,
{
    let resized = resize_to_width(&frame.image, settings.analysis_width).map_err(|e| {
        PipelineError::source("frame", format!("frame {} is unusable: {}", frame.index, e))
    })?;
    let analysis_area = resized.cols() as f64 * resized.rows() as f64;

    let detections = classifier
        .classify(&resized)
        .map_err(|e| PipelineError::Detection {
            frame: frame.index,
            reason: e.to_string(),
        })?;

    Ok(evaluate_detections(
        &detections,
        analysis_area,
        settings.window,
        settings.person_class_id,
    ))
}

/// Produce one presence value per frame of `frames`.
pub fn sample_presence<I, C>(
    frames: I,
    classifier: &mut C,
    settings: &SamplerSettings,
    state: &RunState,
) -> Result<PresenceReport, PipelineError>
where
    I: IntoIterator<Item = Result<Frame, PipelineError>>,
    C: FrameClassifier + ?Sized,
{
    if settings.stride == 0 {
        return Err(PipelineError::config("stride must be at least 1"));
    }

    let report = frames
        .into_iter()
        .try_fold(PresenceReport::default(), |report, frame| {
            if state.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let frame = frame?;

            let verdict = if frame.index % settings.stride == 0 {
                let start = Instant::now();
                let verdict = classify_frame(&frame, classifier, settings)?;
                state.update_stage(
                    "sample",
                    frame.index + 1,
                    start.elapsed().as_secs_f64() * 1000.0,
                );
                Some(verdict)
            } else {
                None
            };

            Ok(report.push(verdict))
        })?;

    state.update_stage("sample", report.presence.len(), 0.0);
    tracing::info!(
        "Sampled {} of {} frames (person_detected={}, valid_size={})",
        report.sampled_frames,
        report.presence.len(),
        report.any_person_detected,
        report.any_valid_size
    );

    Ok(report)
}
