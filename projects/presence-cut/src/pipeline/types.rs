use indicatif::ProgressBar;
use opencv::core::Mat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;

/// A decoded frame and its position in the stream.
pub struct Frame {
    pub index: usize,
    pub image: Mat,
}

/// Axis-aligned box in pixel coordinates of the frame given to the classifier.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }
}

/// One object reported by a `FrameClassifier`.
#[derive(Serialize, Debug, Clone)]
pub struct Detection {
    pub class_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Half-open time range in seconds handed to a splicer.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_frame: f64,
}

/// Per-run progress and cancellation state. Each run owns its own instance.
pub struct RunState {
    pub run_id: String,
    is_active: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    stages: RwLock<BTreeMap<String, StageProgress>>,
    pb: ProgressBar,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_progress_bar(run_id, ProgressBar::hidden())
    }

    pub fn with_progress_bar(run_id: impl Into<String>, pb: ProgressBar) -> Self {
        let mut stages = BTreeMap::new();
        for stage in ["sample", "splice"] {
            stages.insert(
                stage.to_string(),
                StageProgress {
                    current: 0,
                    total: 0,
                    ms_per_frame: 0.0,
                },
            );
        }

        Self {
            run_id: run_id.into(),
            is_active: AtomicBool::new(true),
            cancel_tx: watch::channel(false).0,
            stages: RwLock::new(stages),
            pb,
        }
    }

    /// Request cancellation; workers observe it at their next checkpoint.
    pub fn cancel(&self) {
        self.is_active.store(false, Ordering::Relaxed);
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.is_active.load(Ordering::Relaxed)
    }

    /// Resolves once `cancel` has been called, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn set_stage_total(&self, stage: &str, total: usize) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.total = total;
            }
        }
        if stage == "sample" {
            self.pb.set_length(total as u64);
        }
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current = current;
                // Exponential moving average to smooth per-frame durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
        if stage == "sample" {
            self.pb.set_position(current as u64);
        }
    }

    pub fn stage(&self, stage: &str) -> Option<StageProgress> {
        self.stages.read().ok()?.get(stage).cloned()
    }

    pub fn finish_progress(&self) {
        self.pb.finish_and_clear();
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        serde_json::json!({
            "run_id": self.run_id,
            "is_cancelled": self.is_cancelled(),
            "stages": stages,
        })
    }
}
