use thiserror::Error;

/// Failure taxonomy surfaced to HTTP clients. Everything the collaborator
/// raises during inference is folded into `GenerationFailed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("generated image is empty")]
    EmptyGeneration,

    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl GenerateError {
    pub fn status_code(&self) -> u16 {
        match self {
            GenerateError::InvalidRequest(_) => 400,
            GenerateError::ModelUnavailable(_)
            | GenerateError::EmptyGeneration
            | GenerateError::GenerationFailed(_) => 500,
        }
    }
}
