use serde::{Deserialize, Serialize};

pub const MIN_DIMENSION: usize = 64;
pub const MAX_DIMENSION: usize = 1024;
pub const MAX_STEPS: usize = 50;
pub const MIN_GUIDANCE: f64 = 1.0;
pub const MAX_GUIDANCE: f64 = 20.0;

pub const DEFAULT_PROMPT: &str = "a beautiful landscape";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, deformed, disfigured, poor details, \
    bad anatomy, wrong anatomy, extra limb, missing limb, floating limbs, \
    mutated hands and fingers, disconnected limbs, mutation, mutated, disgusting, \
    blurry, amputation";

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
}

/// Fully-defaulted, range-clamped inference inputs. The pipeline is never
/// invoked with out-of-range values.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl GenerationParams {
    /// Builds parameters from a raw request, filling defaults and silently
    /// clamping every numeric field into range.
    pub fn from_request(req: &GenerationRequest) -> Self {
        Self {
            prompt: req
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            negative_prompt: req
                .negative_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string()),
            width: clamp_dimension(req.width.unwrap_or(512)),
            height: clamp_dimension(req.height.unwrap_or(512)),
            steps: clamp_steps(req.num_inference_steps.unwrap_or(20)),
            guidance_scale: clamp_guidance(req.guidance_scale.unwrap_or(7.5)),
            seed: req.seed,
        }
    }

    /// Minimal single-pass generation used to warm up a freshly loaded
    /// pipeline.
    pub fn warmup() -> Self {
        Self {
            prompt: "warmup test".to_string(),
            negative_prompt: String::new(),
            width: 64,
            height: 64,
            steps: 1,
            guidance_scale: 1.0,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Clamps to [MIN_DIMENSION, MAX_DIMENSION] and rounds down to a multiple
/// of 8, the spatial granularity the latent space requires.
pub fn clamp_dimension(px: usize) -> usize {
    let px = px.clamp(MIN_DIMENSION, MAX_DIMENSION);
    px - px % 8
}

pub fn clamp_steps(steps: usize) -> usize {
    steps.clamp(1, MAX_STEPS)
}

pub fn clamp_guidance(scale: f64) -> f64 {
    scale.clamp(MIN_GUIDANCE, MAX_GUIDANCE)
}
