pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod source;

use anyhow::Result;
use opencv::core::Mat;
use serde::Serialize;

/// Forward-only decoder producing BGR frames.
pub trait VideoReader: Send {
    /// Frame count as reported by the container; may be an estimate.
    fn frame_count(&self) -> Result<usize>;
    /// Frame rate as reported by the container, without any fallback applied.
    fn source_fps(&self) -> Result<f64>;
    /// Next decoded frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

#[derive(clap::ValueEnum, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Opencv,
    Ffmpeg,
}

pub fn open_reader(path: &str, backend: Backend) -> Result<Box<dyn VideoReader>> {
    let reader: Box<dyn VideoReader> = match backend {
        Backend::Opencv => Box::new(opencv_reader::OpencvReader::new(path)?),
        Backend::Ffmpeg => Box::new(ffmpeg_reader::FfmpegReader::new(path)?),
    };
    Ok(reader)
}
