use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use usls::models::RTDETR;
use usls::{Config, Image};

/// COCO-80 index of the "person" class.
pub const PERSON_CLASS_ID: usize = 0;

/// Per-frame object classification. Box coordinates are expressed in the
/// pixel space of the frame that was passed in.
pub trait FrameClassifier {
    fn classify(&mut self, frame: &Mat) -> Result<Vec<Detection>>;
}

impl<C: FrameClassifier + ?Sized> FrameClassifier for Box<C> {
    fn classify(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        (**self).classify(frame)
    }
}

/// RT-DETR (COCO-80) via usls. Handles BGR-to-RGB conversion and corrects
/// for the aspect-ratio padding bug in the underlying model library.
pub struct RtDetrClassifier {
    model: RTDETR,
    min_confidence: f32,
}

impl RtDetrClassifier {
    pub fn new(model_path: &str, min_confidence: f32) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        tracing::info!("Loaded RT-DETR model from {}", model_path);

        Ok(Self {
            model,
            min_confidence,
        })
    }
}

impl FrameClassifier for RtDetrClassifier {
    fn classify(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let size = frame.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;
        let (x_corr, y_corr) = aspect_correction(img_w, img_h);

        let image = Image::from(mat_to_dynamic_image(frame)?);
        let results = self.model.forward(std::slice::from_ref(&image))?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        let detections = y
            .hbbs
            .into_iter()
            .filter(|hbb| hbb.confidence().unwrap_or(0.0) >= self.min_confidence)
            .map(|hbb| {
                let x1 = hbb.xmin() * x_corr;
                let y1 = hbb.ymin() * y_corr;
                Detection {
                    class_id: hbb.id().unwrap_or(usize::MAX),
                    class_name: hbb.name().map(|s| s.to_string()),
                    confidence: hbb.confidence().unwrap_or(0.0),
                    bbox: BBox::new(
                        x1,
                        y1,
                        x1 + hbb.width() * x_corr,
                        y1 + hbb.height() * y_corr,
                    ),
                }
            })
            .collect();

        Ok(detections)
    }
}

/// Scale factors undoing the square-padding distortion of RT-DETR outputs.
fn aspect_correction(img_w: f32, img_h: f32) -> (f32, f32) {
    if img_w > img_h {
        (img_w / img_h, 1.0)
    } else if img_h > img_w {
        (1.0, img_h / img_w)
    } else {
        (1.0, 1.0)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer =
        ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}
