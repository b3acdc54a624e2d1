//! Background removal with the RMBG-1.4 ONNX model.

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use log::{info, warn};
use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::Mutex;

/// Square input resolution the model was trained on.
const INPUT_SIZE: u32 = 1024;

/// Turns an image into the same image with its background made transparent.
///
/// Implementations are shared between requests and may be called from several
/// blocking threads at once.
pub trait Segmenter: Send + Sync {
    fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

pub struct Rmbg {
    session: Mutex<Session>,
    input_name: String,
    model_id: String,
}

impl Rmbg {
    /// Loads the model, preferring CUDA and falling back to CPU.
    pub fn new<P: AsRef<Path>>(model_id: impl Into<String>, model_path: P) -> Result<Self> {
        let model_id = model_id.into();
        let model_path = model_path.as_ref();

        if !model_path.exists() {
            bail!("model file not found: {}", model_path.display());
        }

        info!("loading {} from {}", model_id, model_path.display());

        let cuda = Session::builder()
            .context("failed to create session builder")?
            .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
            .context("failed to set CUDA execution provider")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set optimization level")?
            .commit_from_file(model_path);

        let session = match cuda {
            Ok(session) => {
                info!("{} running on GPU (CUDA)", model_id);
                session
            }
            Err(e) => {
                warn!("CUDA unavailable ({}), using CPU", e);
                Session::builder()
                    .context("failed to create session builder")?
                    .with_execution_providers([CPUExecutionProvider::default().build()])
                    .context("failed to set CPU execution provider")?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .context("failed to set optimization level")?
                    .commit_from_file(model_path)
                    .with_context(|| format!("failed to load model from {}", model_path.display()))?
            }
        };

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_string());

        Ok(Rmbg {
            session: Mutex::new(session),
            input_name,
            model_id,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Runs the model and returns the raw mask as `(width, height, values)`.
    fn infer(&self, tensor: Array4<f32>) -> Result<(u32, u32, Vec<f32>)> {
        let input = Value::from_array(tensor).context("failed to create input tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("model session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![&self.input_name => input])
            .context("inference failed")?;

        let mask = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract output tensor")?;

        let (height, width) = match mask.shape() {
            [1, 1, h, w] => (*h, *w),
            [1, h, w] => (*h, *w),
            other => bail!("unexpected mask shape {:?}", other),
        };

        Ok((width as u32, height as u32, mask.iter().copied().collect()))
    }
}

impl Segmenter for Rmbg {
    fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let tensor = preprocess(image);
        let (width, height, values) = self.infer(tensor)?;
        let mask = normalize_mask(&values, width, height)
            .ok_or_else(|| anyhow!("mask has {} values for {}x{}", values.len(), width, height))?;
        Ok(apply_mask(image, &mask))
    }
}

/// RGB, resized to the model input, scaled to [0, 1] and centred on 0.5.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let rgb = imageops::resize(&image.to_rgb8(), INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0 - 0.5
    })
}

/// Min-max normalises raw model output into an 8-bit mask.
fn normalize_mask(values: &[f32], width: u32, height: u32) -> Option<GrayImage> {
    if values.len() != width as usize * height as usize {
        return None;
    }

    let (min, max) = values
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let pixels = values
        .iter()
        .map(|&v| {
            let unit = if range > f32::EPSILON {
                (v - min) / range
            } else {
                v.clamp(0.0, 1.0)
            };
            (unit * 255.0).round() as u8
        })
        .collect();

    GrayImage::from_raw(width, height, pixels)
}

/// Uses `mask`, stretched to the image size, as the alpha channel.
fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    let mask = if mask.dimensions() == rgba.dimensions() {
        mask.clone()
    } else {
        imageops::resize(mask, rgba.width(), rgba.height(), FilterType::Triangle)
    };

    for (pixel, &Luma([alpha])) in rgba.pixels_mut().zip(mask.pixels()) {
        pixel[3] = ((u16::from(pixel[3]) * u16::from(alpha) + 127) / 255) as u8;
    }

    DynamicImage::ImageRgba8(rgba)
}
