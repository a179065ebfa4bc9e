//! Lossless splicing of kept ranges.
//!
//! Each range is extracted to its own clip with stream copy, then the clips
//! are joined with the concat demuxer, again with stream copy. Nothing is
//! re-encoded, so cut points snap to the nearest preceding keyframe.

use crate::error::PipelineError;
use crate::pipeline::types::{RunState, TimeRange};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Cut-and-concatenate contract. Implementations write only inside `workdir`
/// and return the path of the finished file; on error nothing usable is left
/// behind.
pub trait Splicer: Send + Sync {
    fn cut(
        &self,
        source: &Path,
        ranges: &[TimeRange],
        workdir: &Path,
        state: &RunState,
    ) -> Result<PathBuf, PipelineError>;
}

pub struct FfmpegSplicer {
    binary: PathBuf,
    /// Upper bound for every single ffmpeg invocation
    timeout: Option<Duration>,
}

impl FfmpegSplicer {
    /// Locate `ffmpeg` on PATH.
    pub fn from_path(timeout: Option<Duration>) -> Result<Self, PipelineError> {
        let binary = which::which("ffmpeg")
            .map_err(|_| PipelineError::splice("ffmpeg not found in PATH"))?;
        Ok(Self::with_binary(binary, timeout))
    }

    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run one ffmpeg step from the calling (blocking) thread on the ambient
    /// tokio runtime.
    fn run(
        &self,
        args: &[String],
        log_path: &Path,
        step: &str,
        state: &RunState,
    ) -> Result<(), PipelineError> {
        let runtime = Handle::try_current()
            .map_err(|e| PipelineError::splice(format!("{}: no async runtime: {}", step, e)))?;
        runtime.block_on(self.supervise(args, log_path, step, state))
    }

    /// Spawn ffmpeg and wait for it, killing the child on timeout or cancellation.
    /// stderr goes to `log_path` so a chatty child can never block on a full pipe.
    async fn supervise(
        &self,
        args: &[String],
        log_path: &Path,
        step: &str,
        state: &RunState,
    ) -> Result<(), PipelineError> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let log = fs::File::create(log_path)?;
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::splice(format!("{}: failed to start ffmpeg: {}", step, e)))?;

        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = state.cancelled() => Outcome::Cancelled,
            _ = deadline => Outcome::TimedOut,
        };

        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::Cancelled => {
                warn!("{}: cancellation requested, killing ffmpeg", step);
                let _ = child.kill().await;
                return Err(PipelineError::Cancelled);
            }
            Outcome::TimedOut => {
                let limit = self.timeout.unwrap_or_default();
                warn!("{}: ffmpeg timed out after {:?}, killing process", step, limit);
                let _ = child.kill().await;
                return Err(PipelineError::splice(format!(
                    "{}: ffmpeg timed out after {}s",
                    step,
                    limit.as_secs()
                )));
            }
        };

        if !status.success() {
            let stderr = tokio::fs::read_to_string(log_path).await.unwrap_or_default();
            return Err(PipelineError::splice(format!(
                "{}: ffmpeg exited with {}: {}",
                step,
                status,
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        Ok(())
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Arguments extracting `range` of `source` into `clip` without re-encoding.
pub fn clip_args(source: &Path, range: &TimeRange, clip: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{:.3}", range.start),
        "-to".into(),
        format!("{:.3}", range.end),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        clip.to_string_lossy().into_owned(),
    ]
}

/// Arguments joining the clips listed in `list_file` into `output`.
pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_file.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Concat demuxer list; single quotes inside paths are escaped as `'\''`.
pub fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Container extension of the source, reused for clips and the result.
pub fn container_extension(source: &Path) -> &str {
    source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("mp4")
}

impl Splicer for FfmpegSplicer {
    fn cut(
        &self,
        source: &Path,
        ranges: &[TimeRange],
        workdir: &Path,
        state: &RunState,
    ) -> Result<PathBuf, PipelineError> {
        if ranges.is_empty() {
            return Err(PipelineError::splice("no ranges to splice"));
        }

        let ext = container_extension(source);
        let clips_dir = workdir.join("clips");
        fs::create_dir_all(&clips_dir)?;
        state.set_stage_total("splice", ranges.len() + 1);

        let mut clips = Vec::with_capacity(ranges.len());
        for (i, range) in ranges.iter().enumerate() {
            let start = Instant::now();
            let clip = clips_dir.join(format!("part{:04}.{}", i, ext));
            self.run(
                &clip_args(source, range, &clip),
                &clips_dir.join(format!("part{:04}.log", i)),
                &format!("clip {}", i),
                state,
            )?;
            if !clip.is_file() {
                return Err(PipelineError::splice(format!(
                    "clip {} ({:.3}s..{:.3}s) produced no output",
                    i, range.start, range.end
                )));
            }
            clips.push(clip);
            state.update_stage("splice", i + 1, start.elapsed().as_secs_f64() * 1000.0);
        }

        let list_file = workdir.join("concat.txt");
        fs::write(&list_file, concat_list(&clips))?;

        let output = workdir.join(format!("spliced.{}", ext));
        let start = Instant::now();
        self.run(
            &concat_args(&list_file, &output),
            &workdir.join("concat.log"),
            "concat",
            state,
        )?;
        if !output.is_file() {
            return Err(PipelineError::splice("concat produced no output"));
        }
        state.update_stage(
            "splice",
            ranges.len() + 1,
            start.elapsed().as_secs_f64() * 1000.0,
        );

        info!(
            "Spliced {} ranges ({:.2}s total) from {}",
            ranges.len(),
            ranges.iter().map(TimeRange::duration).sum::<f64>(),
            source.display()
        );
        Ok(output)
    }
}
