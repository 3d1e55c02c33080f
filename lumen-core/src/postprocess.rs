use image::DynamicImage;
use tracing::warn;

use crate::error::GenerateError;

/// Pixel standard deviation below which a frame counts as near-blank.
pub const LOW_VARIANCE_THRESHOLD: f64 = 1.0;

/// Raw pixel buffer handed back by the diffusion collaborator, in nominal
/// [0, 255] scale but before any clamping or quantization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl RawImage {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

/// Outcome of validating and repairing a raw generation.
#[derive(Debug)]
pub struct ProcessedImage {
    pub image: DynamicImage,
    /// True when NaN or infinite channel values had to be replaced.
    pub repaired: bool,
    /// True for all-black or near-blank frames.
    pub degenerate: bool,
    pub std_dev: f64,
}

/// Validates a raw generation: rejects empty output, replaces NaN and
/// infinite values (NaN -> 0, +inf -> 255, -inf -> 0), clamps into the u8
/// pixel range, and flags degenerate (black or near-blank) content.
pub fn process(raw: &RawImage) -> Result<ProcessedImage, GenerateError> {
    if raw.is_empty() {
        return Err(GenerateError::EmptyGeneration);
    }
    if raw.channels != 3 {
        return Err(GenerateError::GenerationFailed(format!(
            "expected a 3-channel image, got {}",
            raw.channels
        )));
    }
    let expected = raw.width * raw.height * raw.channels;
    if raw.data.len() != expected {
        return Err(GenerateError::GenerationFailed(format!(
            "pixel buffer holds {} values, expected {expected}",
            raw.data.len()
        )));
    }

    let mut repaired = false;
    let mut pixels = Vec::with_capacity(raw.data.len());
    for &value in &raw.data {
        let byte = if value.is_nan() {
            repaired = true;
            0
        } else if value == f32::INFINITY {
            repaired = true;
            255
        } else if value == f32::NEG_INFINITY {
            repaired = true;
            0
        } else {
            value.clamp(0.0, 255.0) as u8
        };
        pixels.push(byte);
    }
    if repaired {
        warn!("image contained NaN or infinite values, repaired");
    }

    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64;
    let variance = pixels
        .iter()
        .map(|&p| (p as f64 - mean).powi(2))
        .sum::<f64>()
        / pixels.len() as f64;
    let std_dev = variance.sqrt();
    let all_black = pixels.iter().all(|&p| p == 0);
    let degenerate = all_black || std_dev < LOW_VARIANCE_THRESHOLD;
    if all_black {
        warn!("generated image is completely black");
    } else if degenerate {
        warn!(std_dev, "generated image has very low variance");
    }

    let buffer = image::ImageBuffer::from_raw(raw.width as u32, raw.height as u32, pixels)
        .ok_or_else(|| {
            GenerateError::GenerationFailed("error converting pixel buffer to image".to_string())
        })?;
    Ok(ProcessedImage {
        image: DynamicImage::ImageRgb8(buffer),
        repaired,
        degenerate,
        std_dev,
    })
}
