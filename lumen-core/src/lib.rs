pub mod device_map;
pub mod encode;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod postprocess;
pub mod sd;

pub use device_map::*;
pub use error::GenerateError;
pub use params::{GenerationParams, GenerationRequest};
pub use pipeline::{PipelineHandle, PipelineLoader, PipelineState, TextToImage};
pub use postprocess::{ProcessedImage, RawImage};
pub use sd::{SdLoader, StableDiffusionVersion, AVAILABLE_MODELS};
