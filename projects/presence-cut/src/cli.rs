use crate::pipeline::sampler::{
    SamplerConfig, DEFAULT_MAX_AREA_RATIO, DEFAULT_MIN_AREA_RATIO, DEFAULT_STRIDE,
};
use crate::video::Backend;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the upload/download HTTP API
    Serve(ServeArgs),
    /// Cut a single video file and print the result as JSON
    Process(ProcessArgs),
}

/// Options shared by every subcommand that runs the pipeline.
#[derive(ClapArgs, Debug, Clone)]
pub struct EngineArgs {
    /// RT-DETR ONNX model file
    #[arg(long, env = "PRESENCE_CUT_MODEL")]
    pub model: String,

    /// Decoder used to read frames
    #[arg(long, value_enum, default_value_t = Backend::Opencv)]
    pub backend: Backend,

    /// Detections below this confidence are ignored
    #[arg(long, default_value_t = 0.25)]
    pub min_confidence: f32,

    /// Abort a run after this many seconds
    #[arg(long, env = "PRESENCE_CUT_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Kill a single ffmpeg invocation after this many seconds
    #[arg(long, default_value_t = 600)]
    pub ffmpeg_timeout_secs: u64,

    /// Root directory for published results
    #[arg(long, env = "PRESENCE_CUT_RESULTS_ROOT", default_value = "results")]
    pub results_root: PathBuf,
}

impl EngineArgs {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn ffmpeg_timeout(&self) -> Option<Duration> {
        (self.ffmpeg_timeout_secs > 0).then(|| Duration::from_secs(self.ffmpeg_timeout_secs))
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// Directory for uploaded files while they are processed
    #[arg(long, env = "PRESENCE_CUT_UPLOAD_ROOT", default_value = "uploads")]
    pub upload_root: PathBuf,

    /// Origin allowed to call the API from a browser
    #[arg(long, default_value = "http://localhost:3000")]
    pub cors_origin: String,

    /// Largest accepted upload
    #[arg(long, default_value_t = 2048)]
    pub max_upload_mb: usize,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProcessArgs {
    /// Video file to cut
    pub input: PathBuf,

    /// Classify every Nth frame
    #[arg(long, default_value_t = DEFAULT_STRIDE, allow_negative_numbers = true)]
    pub stride: i64,

    #[arg(long, default_value_t = DEFAULT_MIN_AREA_RATIO)]
    pub min_area_ratio: f64,

    #[arg(long, default_value_t = DEFAULT_MAX_AREA_RATIO)]
    pub max_area_ratio: f64,

    /// Also write presence.csv and summary.json here
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

impl ProcessArgs {
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            stride: self.stride,
            min_area_ratio: self.min_area_ratio,
            max_area_ratio: self.max_area_ratio,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
