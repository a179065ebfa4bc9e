// Shared entry point for the CLI and the HTTP surface: owns the splicer and
// the model settings, and runs one pipeline per call on the blocking pool.

use crate::cli::EngineArgs;
use crate::error::PipelineError;
use crate::pipeline::detection::{FrameClassifier, RtDetrClassifier};
use crate::pipeline::orchestrator::{run_blocking, Pipeline, PipelineResult};
use crate::pipeline::sampler::SamplerConfig;
use crate::pipeline::splicer::{FfmpegSplicer, Splicer};
use crate::pipeline::types::RunState;
use crate::run_context::RunContext;
use indicatif::ProgressBar;
use std::path::PathBuf;
use std::sync::Arc;

type ClassifierFactory =
    dyn Fn() -> Result<Box<dyn FrameClassifier>, PipelineError> + Send + Sync;

#[derive(Clone)]
pub struct Engine {
    args: EngineArgs,
    splicer: Arc<dyn Splicer>,
    classifiers: Arc<ClassifierFactory>,
}

impl Engine {
    pub fn new(args: EngineArgs) -> Result<Self, PipelineError> {
        let splicer = FfmpegSplicer::from_path(args.ffmpeg_timeout())?;
        let model = args.model.clone();
        let min_confidence = args.min_confidence;
        let classifiers = move || -> Result<Box<dyn FrameClassifier>, PipelineError> {
            let classifier = RtDetrClassifier::new(&model, min_confidence)
                .map_err(|e| PipelineError::Model(format!("{}: {}", model, e)))?;
            Ok(Box::new(classifier))
        };
        Ok(Self::with_parts(args, Arc::new(splicer), Arc::new(classifiers)))
    }

    pub fn with_parts(
        args: EngineArgs,
        splicer: Arc<dyn Splicer>,
        classifiers: Arc<ClassifierFactory>,
    ) -> Self {
        Self {
            args,
            splicer,
            classifiers,
        }
    }

    pub fn args(&self) -> &EngineArgs {
        &self.args
    }

    /// Allocate the run's working area and state. The progress bar is hidden
    /// unless one is given.
    pub fn prepare(
        &self,
        progress: Option<ProgressBar>,
    ) -> Result<(RunContext, Arc<RunState>), PipelineError> {
        let ctx = RunContext::create(&self.args.results_root)?;
        let state = match progress {
            Some(pb) => RunState::with_progress_bar(ctx.run_id.clone(), pb),
            None => RunState::new(ctx.run_id.clone()),
        };
        Ok((ctx, Arc::new(state)))
    }

    /// Run the pipeline on `input`, bounded by the configured run timeout.
    /// The working directory is released before this returns.
    pub async fn process(
        &self,
        ctx: RunContext,
        state: Arc<RunState>,
        input: PathBuf,
        config: SamplerConfig,
    ) -> Result<PipelineResult, PipelineError> {
        let backend = self.args.backend;
        let splicer = self.splicer.clone();
        let classifiers = self.classifiers.clone();

        run_blocking(state, self.args.run_timeout(), move |state| {
            let mut classifier = classifiers()?;
            let mut pipeline =
                Pipeline::new(&config, backend, &mut *classifier, splicer.as_ref())?;
            pipeline.run(&input, &ctx, &state)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::detection::tests::ScriptedClassifier;
    use crate::video::Backend;

    fn engine(results_root: PathBuf) -> Engine {
        let args = EngineArgs {
            model: "unused.onnx".to_string(),
            backend: Backend::Opencv,
            min_confidence: 0.25,
            timeout_secs: None,
            ffmpeg_timeout_secs: 0,
            results_root,
        };
        Engine::with_parts(
            args,
            Arc::new(FfmpegSplicer::with_binary("false", None)),
            Arc::new(|| -> Result<Box<dyn FrameClassifier>, PipelineError> {
                Ok(Box::new(ScriptedClassifier::default()))
            }),
        )
    }

    #[tokio::test]
    async fn test_missing_input_releases_workdir() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path().join("results"));

        let (ctx, state) = engine.prepare(None).unwrap();
        assert!(ctx.workdir().exists());
        let err = engine
            .process(
                ctx,
                state,
                root.path().join("missing.mp4"),
                SamplerConfig::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(
            std::fs::read_dir(root.path().join("results")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_model_failure_is_detection_error() {
        let root = tempfile::tempdir().unwrap();
        let base = engine(root.path().join("results"));
        let engine = Engine::with_parts(
            base.args().clone(),
            base.splicer.clone(),
            Arc::new(|| -> Result<Box<dyn FrameClassifier>, PipelineError> {
                Err(PipelineError::Model("missing weights".to_string()))
            }),
        );

        let (ctx, state) = engine.prepare(None).unwrap();
        let err = engine
            .process(ctx, state, root.path().join("in.mp4"), SamplerConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Detection);
    }
}
