mod cli;
mod engine;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::{Args, Command, ProcessArgs};
use engine::Engine;
use indicatif::{ProgressBar, ProgressStyle};
use run_artifacts::write_presence_report;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Serve(serve) => run_server(serve).await?,
        Command::Process(process) => run_process(process).await?,
    }

    Ok(())
}

async fn run_process(args: ProcessArgs) -> Result<()> {
    // Reject bad sampling options before locating ffmpeg or touching the model
    let config = args.sampler_config();
    config.validate()?;

    let engine = Engine::new(args.engine.clone()).context("failed to set up the pipeline")?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({per_sec:.1.yellow}, {eta})")?
            .progress_chars("#>-"),
    );

    let (ctx, state) = engine.prepare(Some(pb))?;
    let run_id = ctx.run_id.clone();

    let interrupt = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run {}", interrupt.run_id);
            interrupt.cancel();
        }
    });

    let result = engine
        .process(ctx, state.clone(), args.input.clone(), config)
        .await;
    tracing::debug!("Run progress: {}", state.to_progress_json());
    if let Some(sample) = state.stage("sample") {
        tracing::info!(
            "Classified up to frame {} of {} ({:.1} ms/frame)",
            sample.current,
            sample.total,
            sample.ms_per_frame
        );
    }
    let result = result.with_context(|| format!("failed to process {}", args.input.display()))?;

    if let Some(dir) = &args.report_dir {
        write_presence_report(dir, &run_id, &result)
            .with_context(|| format!("failed to write report to {}", dir.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
