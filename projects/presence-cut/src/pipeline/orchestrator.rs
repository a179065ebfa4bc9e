// Pipeline orchestrator: one run from source file to published artifact
//
// FrameSource -> presence sampling -> validation -> segment extraction ->
// splice (or source passthrough) -> publish. Runs synchronously; async
// callers go through `run_blocking`.

use crate::error::PipelineError;
use crate::pipeline::detection::FrameClassifier;
use crate::pipeline::sampler::{sample_presence, SamplerConfig, SamplerSettings};
use crate::pipeline::segments::{extract_segments, RemovedSpan, Segment, SegmentPlan};
use crate::pipeline::splicer::{container_extension, Splicer};
use crate::pipeline::types::RunState;
use crate::run_artifacts::RunManifest;
use crate::run_context::{ResultArtifact, RunContext};
use crate::video::source::FrameSource;
use crate::video::Backend;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub artifact: ResultArtifact,
    pub fps: f64,
    pub duration: f64,
    pub presence: Vec<bool>,
    pub sampled_frames: usize,
    pub segments: Vec<Segment>,
    pub kept_segments: usize,
    pub removed_segments: Vec<RemovedSpan>,
    /// No qualifying range survived and the source was published as-is
    pub source_passthrough: bool,
}

pub struct Pipeline<'a> {
    config: SamplerConfig,
    settings: SamplerSettings,
    backend: Backend,
    classifier: &'a mut dyn FrameClassifier,
    splicer: &'a dyn Splicer,
}

impl<'a> Pipeline<'a> {
    /// Fails with a config error before any frame is touched.
    pub fn new(
        config: &SamplerConfig,
        backend: Backend,
        classifier: &'a mut dyn FrameClassifier,
        splicer: &'a dyn Splicer,
    ) -> Result<Self, PipelineError> {
        let settings = config.validate()?;
        Ok(Self {
            config: config.clone(),
            settings,
            backend,
            classifier,
            splicer,
        })
    }

    pub fn run(
        &mut self,
        source_path: &Path,
        ctx: &RunContext,
        state: &RunState,
    ) -> Result<PipelineResult, PipelineError> {
        let source = FrameSource::open(source_path, self.backend)?;
        self.run_source(source_path, source, ctx, state)
    }

    /// Run over an already opened source. `source_path` is what gets spliced.
    pub fn run_source(
        &mut self,
        source_path: &Path,
        mut source: FrameSource,
        ctx: &RunContext,
        state: &RunState,
    ) -> Result<PipelineResult, PipelineError> {
        let result = self.execute(source_path, &mut source, ctx, state);
        state.finish_progress();
        if let Err(e) = &result {
            error!("Run {} failed on {}: {}", ctx.run_id, source.label(), e);
        }
        result
    }

    fn execute(
        &mut self,
        source_path: &Path,
        source: &mut FrameSource,
        ctx: &RunContext,
        state: &RunState,
    ) -> Result<PipelineResult, PipelineError> {
        let fps = source.fps();
        let duration = source.duration_secs();
        info!(
            "Run {}: {} ({} frames @ {:.2} fps, stride {})",
            ctx.run_id,
            source.label(),
            source.total_frames(),
            fps,
            self.settings.stride
        );
        state.set_stage_total("sample", source.total_frames());

        let report = sample_presence(
            source.by_ref(),
            &mut *self.classifier,
            &self.settings,
            state,
        )?;

        if !report.any_person_detected {
            return Err(PipelineError::NoSubject);
        }
        if !report.any_valid_size {
            return Err(PipelineError::NoSubjectInWindow {
                min: self.settings.window.min,
                max: self.settings.window.max,
            });
        }

        let plan = extract_segments(&report.presence, fps);
        info!(
            "Run {}: {} kept / {} removed segments, keeping {:.2}s of {:.2}s",
            ctx.run_id,
            plan.kept().count(),
            plan.removed().count(),
            plan.kept().map(|s| s.duration_secs(plan.fps)).sum::<f64>(),
            plan.total_frames() as f64 / plan.fps
        );

        let (artifact, source_passthrough) =
            produce_artifact(source_path, &plan, ctx, self.splicer, state)?;

        let result = PipelineResult {
            artifact,
            fps: plan.fps,
            duration,
            kept_segments: plan.kept().count(),
            removed_segments: plan.removed_spans(),
            segments: plan.segments,
            presence: report.presence,
            sampled_frames: report.sampled_frames,
            source_passthrough,
        };

        let manifest = RunManifest::new(ctx, source_path, self.backend, &self.config, &result);
        let manifest_path = match manifest.write(ctx) {
            Ok(path) => path,
            Err(e) => {
                // A result without its manifest is not published
                let _ = fs::remove_file(&result.artifact.path);
                return Err(e);
            }
        };

        withdraw_if_cancelled(
            ctx,
            state,
            &[result.artifact.path.as_path(), manifest_path.as_path()],
        )?;
        Ok(result)
    }
}

/// Remove already published files again if the run was cancelled meanwhile.
fn withdraw_if_cancelled(
    ctx: &RunContext,
    state: &RunState,
    published: &[&Path],
) -> Result<(), PipelineError> {
    if !state.is_cancelled() {
        return Ok(());
    }
    warn!("Run {}: cancelled while publishing, withdrawing result", ctx.run_id);
    for path in published {
        let _ = fs::remove_file(path);
    }
    Err(PipelineError::Cancelled)
}

/// Splice the kept ranges of `plan` into the working directory and publish
/// the output. An empty kept list publishes a copy of the source instead.
pub fn produce_artifact(
    source_path: &Path,
    plan: &SegmentPlan,
    ctx: &RunContext,
    splicer: &dyn Splicer,
    state: &RunState,
) -> Result<(ResultArtifact, bool), PipelineError> {
    let ext = container_extension(source_path);
    let ranges = plan.kept_ranges();

    let (staged, passthrough) = if ranges.is_empty() {
        warn!(
            "Run {}: no kept segments, publishing the source unchanged",
            ctx.run_id
        );
        let staged = ctx.workdir().join(format!("passthrough.{}", ext));
        fs::copy(source_path, &staged)?;
        (staged, true)
    } else {
        (splicer.cut(source_path, &ranges, ctx.workdir(), state)?, false)
    };

    if state.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok((ctx.publish(&staged, ext)?, passthrough))
}

/// Raises the run's cancellation flag if dropped while still armed, so a
/// caller that stops waiting also stops the blocking job.
struct CancelOnDrop(Option<Arc<RunState>>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(state) = self.0.take() {
            warn!("Run {}: caller went away, cancelling", state.run_id);
            state.cancel();
        }
    }
}

/// Run `job` on the blocking pool. When `timeout` elapses, or the returned
/// future is dropped, the run's cancellation flag is raised. On timeout the
/// job is awaited until it unwinds, so its working directory is gone by the
/// time this returns. A job that finished publishing before it could observe
/// the flag keeps its result.
pub async fn run_blocking<T, F>(
    state: Arc<RunState>,
    timeout: Option<Duration>,
    job: F,
) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(Arc<RunState>) -> Result<T, PipelineError> + Send + 'static,
{
    let mut guard = CancelOnDrop(Some(state.clone()));
    let mut handle = tokio::task::spawn_blocking({
        let state = state.clone();
        move || job(state)
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "Run {} exceeded {}s, cancelling",
                    state.run_id,
                    limit.as_secs_f64()
                );
                state.cancel();
                let joined = handle.await;
                guard.disarm();
                return match joined {
                    Ok(Ok(value)) => Ok(value),
                    _ => Err(PipelineError::Cancelled),
                };
            }
        },
        None => handle.await,
    };
    guard.disarm();

    joined.map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::detection::tests::{person, ScriptedClassifier};
    use crate::pipeline::types::{Detection, TimeRange};
    use crate::video::source::tests::FakeReader;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Splicer writing a marker file and recording the ranges it was given.
    #[derive(Default)]
    struct RecordingSplicer {
        calls: Mutex<Vec<Vec<TimeRange>>>,
        fail: bool,
    }

    impl RecordingSplicer {
        fn calls(&self) -> Vec<Vec<TimeRange>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Splicer for RecordingSplicer {
        fn cut(
            &self,
            _source: &Path,
            ranges: &[TimeRange],
            workdir: &Path,
            _state: &RunState,
        ) -> Result<PathBuf, PipelineError> {
            self.calls.lock().unwrap().push(ranges.to_vec());
            if self.fail {
                return Err(PipelineError::splice("concat: ffmpeg exited with 1"));
            }
            let out = workdir.join("spliced.mp4");
            fs::write(&out, format!("{} ranges", ranges.len()))?;
            Ok(out)
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        source_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let source_path = root.path().join("input.mp4");
            fs::write(&source_path, b"source-bytes").unwrap();
            Self {
                root,
                source_path,
            }
        }

        fn results_root(&self) -> PathBuf {
            self.root.path().join("results")
        }

        /// Visible files in the results root.
        fn published(&self) -> Vec<String> {
            let Ok(entries) = fs::read_dir(self.results_root()) else {
                return Vec::new();
            };
            let mut names: Vec<String> = entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| !n.starts_with('.'))
                .collect();
            names.sort();
            names
        }

        fn source(&self, frames: usize, fps: f64) -> FrameSource {
            FrameSource::from_reader(
                "input.mp4",
                Box::new(FakeReader::blank(frames, 1280, 720, fps)),
            )
            .unwrap()
        }
    }

    fn full_frame_person() -> Vec<Detection> {
        vec![person(0.0, 0.0, 640.0, 360.0)]
    }

    fn stride_one() -> SamplerConfig {
        SamplerConfig {
            stride: 1,
            ..SamplerConfig::default()
        }
    }

    /// Per-frame script producing the given presence at stride 1.
    fn script(presence: &[bool]) -> Vec<Vec<Detection>> {
        presence
            .iter()
            .map(|&p| if p { full_frame_person() } else { Vec::new() })
            .collect()
    }

    fn run_once(
        fx: &Fixture,
        config: &SamplerConfig,
        classifier: &mut ScriptedClassifier,
        splicer: &RecordingSplicer,
        frames: usize,
        fps: f64,
    ) -> Result<PipelineResult, PipelineError> {
        let ctx = RunContext::create(&fx.results_root())?;
        let state = RunState::new(ctx.run_id.clone());
        let mut pipeline = Pipeline::new(config, Backend::Opencv, classifier, splicer)?;
        pipeline.run_source(&fx.source_path, fx.source(frames, fps), &ctx, &state)
    }

    #[test]
    fn test_mixed_presence_splices_kept_ranges() {
        let fx = Fixture::new();
        let presence = [true, true, true, false, false, true];
        let mut classifier = ScriptedClassifier::new(script(&presence));
        let splicer = RecordingSplicer::default();

        let result = run_once(&fx, &stride_one(), &mut classifier, &splicer, 6, 1.0).unwrap();

        assert_eq!(result.presence, presence.to_vec());
        assert_eq!(result.duration, 6.0);
        assert_eq!(result.kept_segments, 2);
        assert_eq!(
            result.removed_segments,
            vec![RemovedSpan {
                start: 3.0,
                end: 4.0
            }]
        );
        assert!(!result.source_passthrough);
        assert_eq!(
            splicer.calls(),
            vec![vec![
                TimeRange {
                    start: 0.0,
                    end: 3.0
                },
                TimeRange {
                    start: 5.0,
                    end: 6.0
                }
            ]]
        );

        assert_eq!(fs::read_to_string(&result.artifact.path).unwrap(), "2 ranges");
        let manifest = result.artifact.name.replace(".mp4", ".json");
        assert_eq!(fx.published(), vec![manifest, result.artifact.name.clone()]);
    }

    #[test]
    fn test_no_person_is_no_subject_before_extraction() {
        let fx = Fixture::new();
        let mut classifier = ScriptedClassifier::new(script(&[false; 5]));
        let splicer = RecordingSplicer::default();

        let err = run_once(&fx, &stride_one(), &mut classifier, &splicer, 5, 25.0).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NoSubject);
        assert!(splicer.calls().is_empty());
        assert!(fx.published().is_empty());
    }

    #[test]
    fn test_person_outside_window_is_distinct_error() {
        let fx = Fixture::new();
        // 10x10 box on a 640x360 frame is well under the 1% minimum
        let tiny = vec![vec![person(0.0, 0.0, 10.0, 10.0)]; 4];
        let mut classifier = ScriptedClassifier::new(tiny);
        let splicer = RecordingSplicer::default();

        let err = run_once(&fx, &stride_one(), &mut classifier, &splicer, 4, 25.0).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NoSubjectInWindow);
        assert!(splicer.calls().is_empty());
    }

    #[test]
    fn test_inverted_window_rejected_before_processing() {
        let mut classifier = ScriptedClassifier::default();
        let splicer = RecordingSplicer::default();
        let config = SamplerConfig {
            min_area_ratio: 0.5,
            max_area_ratio: 0.4,
            ..SamplerConfig::default()
        };

        let err = Pipeline::new(&config, Backend::Opencv, &mut classifier, &splicer)
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_runs_are_idempotent() {
        let fx = Fixture::new();
        let presence = [false, true, true, false, true, false, false, true];
        let splicer = RecordingSplicer::default();

        let first = run_once(
            &fx,
            &stride_one(),
            &mut ScriptedClassifier::new(script(&presence)),
            &splicer,
            8,
            4.0,
        )
        .unwrap();
        let second = run_once(
            &fx,
            &stride_one(),
            &mut ScriptedClassifier::new(script(&presence)),
            &splicer,
            8,
            4.0,
        )
        .unwrap();

        assert_eq!(first.presence, second.presence);
        assert_eq!(first.segments, second.segments);
        assert_eq!(first.removed_segments, second.removed_segments);
        assert_ne!(first.artifact.name, second.artifact.name);
        let calls = splicer.calls();
        assert_eq!(calls[0], calls[1]);
    }

    #[test]
    fn test_splice_failure_leaves_nothing_behind() {
        let fx = Fixture::new();
        let mut classifier = ScriptedClassifier::new(script(&[true, false, true]));
        let splicer = RecordingSplicer {
            fail: true,
            ..RecordingSplicer::default()
        };

        let err = run_once(&fx, &stride_one(), &mut classifier, &splicer, 3, 1.0).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Splice);
        // Working directories are gone as well as any output
        assert_eq!(fs::read_dir(fx.results_root()).unwrap().count(), 0);
        assert_eq!(fs::read(&fx.source_path).unwrap(), b"source-bytes");
    }

    #[test]
    fn test_cancelled_run_publishes_nothing() {
        let fx = Fixture::new();
        let mut classifier = ScriptedClassifier::new(script(&[true; 3]));
        let splicer = RecordingSplicer::default();
        let ctx = RunContext::create(&fx.results_root()).unwrap();
        let state = RunState::new(ctx.run_id.clone());
        state.cancel();

        let mut pipeline =
            Pipeline::new(&stride_one(), Backend::Opencv, &mut classifier, &splicer).unwrap();
        let err = pipeline
            .run_source(&fx.source_path, fx.source(3, 1.0), &ctx, &state)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(fx.published().is_empty());
    }

    /// Splicer during which the run gets cancelled, as when a deadline fires.
    struct CancellingSplicer(RecordingSplicer);

    impl Splicer for CancellingSplicer {
        fn cut(
            &self,
            source: &Path,
            ranges: &[TimeRange],
            workdir: &Path,
            state: &RunState,
        ) -> Result<PathBuf, PipelineError> {
            let out = self.0.cut(source, ranges, workdir, state)?;
            state.cancel();
            Ok(out)
        }
    }

    #[test]
    fn test_cancel_during_splice_publishes_nothing() {
        let fx = Fixture::new();
        let mut classifier = ScriptedClassifier::new(script(&[true, false, true]));
        let splicer = CancellingSplicer(RecordingSplicer::default());
        let ctx = RunContext::create(&fx.results_root()).unwrap();
        let state = RunState::new(ctx.run_id.clone());

        let mut pipeline =
            Pipeline::new(&stride_one(), Backend::Opencv, &mut classifier, &splicer).unwrap();
        let err = pipeline
            .run_source(&fx.source_path, fx.source(3, 1.0), &ctx, &state)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(splicer.0.calls().len(), 1);
        assert!(fx.published().is_empty());
    }

    #[test]
    fn test_cancel_after_publish_withdraws_result() {
        let fx = Fixture::new();
        let ctx = RunContext::create(&fx.results_root()).unwrap();
        let state = RunState::new(ctx.run_id.clone());
        let staged = ctx.workdir().join("spliced.mp4");
        fs::write(&staged, b"cut").unwrap();
        let artifact = ctx.publish(&staged, "mp4").unwrap();
        let manifest = fx.results_root().join(ctx.manifest_name());
        fs::write(&manifest, b"{}").unwrap();
        assert_eq!(fx.published().len(), 2);
        let published = [artifact.path.as_path(), manifest.as_path()];

        withdraw_if_cancelled(&ctx, &state, &published).unwrap();
        assert_eq!(fx.published().len(), 2);

        state.cancel();
        let err = withdraw_if_cancelled(&ctx, &state, &published).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(fx.published().is_empty());
    }

    #[test]
    fn test_missing_source_is_source_error() {
        let fx = Fixture::new();
        let mut classifier = ScriptedClassifier::default();
        let splicer = RecordingSplicer::default();
        let ctx = RunContext::create(&fx.results_root()).unwrap();
        let state = RunState::new(ctx.run_id.clone());

        let mut pipeline =
            Pipeline::new(&stride_one(), Backend::Opencv, &mut classifier, &splicer).unwrap();
        let err = pipeline
            .run(&fx.root.path().join("missing.mp4"), &ctx, &state)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_empty_kept_list_publishes_source_copy() {
        let fx = Fixture::new();
        let splicer = RecordingSplicer::default();
        let ctx = RunContext::create(&fx.results_root()).unwrap();
        let state = RunState::new(ctx.run_id.clone());
        let plan = extract_segments(&[false, false, false], 1.0);

        let (artifact, passthrough) =
            produce_artifact(&fx.source_path, &plan, &ctx, &splicer, &state).unwrap();

        assert!(passthrough);
        assert!(splicer.calls().is_empty());
        assert_eq!(fs::read(&artifact.path).unwrap(), b"source-bytes");
        assert_eq!(
            plan.removed_spans(),
            vec![RemovedSpan {
                start: 0.0,
                end: 2.0
            }]
        );
        // Source is copied, not moved
        assert!(fx.source_path.exists());
    }

    #[tokio::test]
    async fn test_run_blocking_returns_job_result() {
        let state = Arc::new(RunState::new("t"));
        let value = run_blocking(state, Some(Duration::from_secs(5)), |_| Ok(42))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_timeout_cancels_job() {
        let state = Arc::new(RunState::new("t"));
        let err = run_blocking(state.clone(), Some(Duration::from_millis(50)), |state| {
            while !state.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err::<(), _>(PipelineError::Cancelled)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(state.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_blocking_keeps_result_finished_past_timeout() {
        let state = Arc::new(RunState::new("t"));
        let value = run_blocking(state.clone(), Some(Duration::from_millis(20)), |_| {
            std::thread::sleep(Duration::from_millis(150));
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert!(state.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_caller_cancels_job() {
        let state = Arc::new(RunState::new("t"));
        let steps = Arc::new(AtomicUsize::new(0));

        let caller = run_blocking(state.clone(), None, {
            let steps = steps.clone();
            move |state| {
                for _ in 0..40 {
                    if state.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    steps.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(25));
                }
                Ok(())
            }
        });
        // The client goes away: the caller's future is dropped mid-run
        assert!(tokio::time::timeout(Duration::from_millis(100), caller)
            .await
            .is_err());
        assert!(state.is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = steps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(steps.load(Ordering::SeqCst), settled);
        assert!(settled < 40);
    }

    #[tokio::test]
    async fn test_completed_caller_does_not_cancel() {
        let state = Arc::new(RunState::new("t"));
        run_blocking(state.clone(), None, |_| Ok(())).await.unwrap();
        assert!(!state.is_cancelled());
    }
}
