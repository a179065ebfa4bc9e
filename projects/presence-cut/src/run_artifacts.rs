// Run artifact struct definitions
//
// Files persisted next to a published result: the run manifest
// (`result_<run_id>.json`) and the optional per-frame presence report.

use crate::error::PipelineError;
use crate::pipeline::orchestrator::PipelineResult;
use crate::pipeline::sampler::SamplerConfig;
use crate::pipeline::segments::{RemovedSpan, Segment};
use crate::run_context::RunContext;
use crate::video::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Description of a finished run, written as `result_<run_id>.json`.
#[derive(Serialize, Debug, Clone)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// File name of the input, never its full path
    pub source: String,
    pub backend: Backend,
    pub params: SamplerConfig,
    pub fps: f64,
    pub duration: f64,
    pub sampled_frames: usize,
    pub artifact: String,
    pub source_passthrough: bool,
    pub segments: Vec<Segment>,
    pub removed_segments: Vec<RemovedSpan>,
}

impl RunManifest {
    pub fn new(
        ctx: &RunContext,
        source_path: &Path,
        backend: Backend,
        params: &SamplerConfig,
        result: &PipelineResult,
    ) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            created_at: ctx.created_at,
            source: source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            backend,
            params: params.clone(),
            fps: result.fps,
            duration: result.duration,
            sampled_frames: result.sampled_frames,
            artifact: result.artifact.name.clone(),
            source_passthrough: result.source_passthrough,
            segments: result.segments.clone(),
            removed_segments: result.removed_segments.clone(),
        }
    }

    pub fn write(&self, ctx: &RunContext) -> Result<PathBuf, PipelineError> {
        let path = ctx.results_root().join(ctx.manifest_name());
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceRow {
    pub frame_index: usize,
    pub timestamp: f64,
    pub present: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub run_id: String,
    pub fps: f64,
    pub duration: f64,
    pub total_frames: usize,
    pub present_frames: usize,
    pub sampled_frames: usize,
    pub kept_segments: usize,
    pub removed_segments: Vec<RemovedSpan>,
    pub artifact: String,
}

/// Write `presence.csv` and `summary.json` into `dir`.
pub fn write_presence_report(
    dir: &Path,
    run_id: &str,
    result: &PipelineResult,
) -> Result<(), PipelineError> {
    fs::create_dir_all(dir)?;

    let mut writer = csv::Writer::from_path(dir.join("presence.csv"))
        .map_err(|e| PipelineError::Io(e.into()))?;
    for (frame_index, &present) in result.presence.iter().enumerate() {
        writer
            .serialize(PresenceRow {
                frame_index,
                timestamp: frame_index as f64 / result.fps,
                present,
            })
            .map_err(|e| PipelineError::Io(e.into()))?;
    }
    writer.flush()?;

    let summary = ReportSummary {
        run_id: run_id.to_string(),
        fps: result.fps,
        duration: result.duration,
        total_frames: result.presence.len(),
        present_frames: result.presence.iter().filter(|&&p| p).count(),
        sampled_frames: result.sampled_frames,
        kept_segments: result.kept_segments,
        removed_segments: result.removed_segments.clone(),
        artifact: result.artifact.name.clone(),
    };
    fs::write(
        dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    tracing::info!("Wrote presence report to {}", dir.display());
    Ok(())
}
