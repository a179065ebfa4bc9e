// Segment extraction: presence sequence -> ordered kept/removed runs

use crate::pipeline::types::TimeRange;
use crate::video::source::effective_fps;
use serde::{Deserialize, Serialize};

/// Decimal places used when reporting removed segments.
pub const REPORT_DECIMALS: i32 = 2;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Kept,
    Removed,
}

/// A maximal run of equal presence values. Frame bounds are inclusive.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_frame: usize,
    pub end_frame: usize,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl Segment {
    pub fn frame_count(&self) -> usize {
        self.end_frame + 1 - self.start_frame
    }

    /// Time covered by the run's frames, including the last frame's display time.
    pub fn duration_secs(&self, fps: f64) -> f64 {
        self.frame_count() as f64 / fps
    }

    /// Range to cut from the source: from the first frame up to the end of the last one.
    pub fn splice_range(&self, fps: f64) -> TimeRange {
        TimeRange {
            start: self.start_frame as f64 / fps,
            end: (self.end_frame + 1) as f64 / fps,
        }
    }
}

/// Removed segment as reported to callers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RemovedSpan {
    pub start: f64,
    pub end: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    pub fps: f64,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    pub fn kept(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Kept)
    }

    pub fn removed(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Removed)
    }

    /// Exact (unrounded) ranges for the splicer, in playback order.
    pub fn kept_ranges(&self) -> Vec<TimeRange> {
        self.kept().map(|s| s.splice_range(self.fps)).collect()
    }

    pub fn removed_spans(&self) -> Vec<RemovedSpan> {
        self.removed()
            .map(|s| RemovedSpan {
                start: round_to(s.start_secs, REPORT_DECIMALS),
                end: round_to(s.end_secs, REPORT_DECIMALS),
            })
            .collect()
    }

    pub fn total_frames(&self) -> usize {
        self.segments.iter().map(Segment::frame_count).sum()
    }
}

/// Round to `decimals` places, halves to even.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Split `presence` into maximal runs in a single left-to-right scan.
pub fn extract_segments(presence: &[bool], fps: f64) -> SegmentPlan {
    let fps = effective_fps(fps);
    let mut segments: Vec<Segment> = Vec::new();

    let mut run_start = 0;
    for i in 1..=presence.len() {
        let run_ends = i == presence.len() || presence[i] != presence[run_start];
        if !run_ends {
            continue;
        }

        let end = i - 1;
        segments.push(Segment {
            kind: if presence[run_start] {
                SegmentKind::Kept
            } else {
                SegmentKind::Removed
            },
            start_frame: run_start,
            end_frame: end,
            start_secs: run_start as f64 / fps,
            end_secs: end as f64 / fps,
        });
        run_start = i;
    }

    SegmentPlan { fps, segments }
}
