use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use lumen_core::{
    encode, postprocess, GenerateError, GenerationParams, GenerationRequest, PipelineHandle,
    ProcessedImage, AVAILABLE_MODELS,
};
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineHandle>,
    pub model_id: String,
    pub device: &'static str,
    pub cuda_available: bool,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/warmup", post(warmup))
        .route("/unload", post(unload))
        .route("/reload", post(reload))
        .route("/models", get(models))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    device: &'static str,
    model_loaded: bool,
    model_loading: bool,
    cuda_available: bool,
}

#[derive(Serialize)]
struct GenerateResponse {
    success: bool,
    image: String,
    prompt: String,
    seed: u64,
    device: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: &'static str,
}

#[derive(Serialize)]
struct WarmupResponse {
    status: &'static str,
    device: &'static str,
}

#[derive(Serialize)]
struct WarmupFailure {
    status: &'static str,
    error: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    current_model: String,
    available_models: Vec<&'static str>,
}

/// Adapter mapping the core error taxonomy onto structured JSON failures.
pub struct ApiFailure(pub GenerateError);

impl From<GenerateError> for ApiFailure {
    fn from(e: GenerateError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        device: state.device,
        model_loaded: state.pipeline.is_loaded(),
        model_loading: state.pipeline.is_loading(),
        cuda_available: state.cuda_available,
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiFailure> {
    let Json(request) = payload.map_err(|e| GenerateError::InvalidRequest(e.body_text()))?;
    let params = GenerationParams::from_request(&request);
    let seed = params.seed.unwrap_or_else(random_seed);
    let params = params.with_seed(seed);
    let prompt = params.prompt.clone();
    info!(
        width = params.width,
        height = params.height,
        steps = params.steps,
        "generating image for prompt {:?}",
        truncated(&prompt, 50)
    );

    let (processed, seed) = generate_with_retry(&state, params, seed).await?;
    let image = encode::to_data_uri(&processed.image)
        .map_err(|e| GenerateError::GenerationFailed(format!("{e:#}")))?;
    info!(encoded_len = image.len(), "image generated successfully");

    Ok(Json(GenerateResponse {
        success: true,
        image,
        prompt,
        seed,
        device: state.device,
    }))
}

/// Bounded degenerate-image policy: one retry with a fresh random seed, then
/// return whatever the retry produced.
async fn generate_with_retry(
    state: &AppState,
    params: GenerationParams,
    seed: u64,
) -> Result<(ProcessedImage, u64), GenerateError> {
    let raw = state.pipeline.infer(&params).await?;
    let processed = postprocess::process(&raw)?;
    if !processed.degenerate {
        return Ok((processed, seed));
    }

    let retry_seed = random_seed();
    warn!(
        std_dev = processed.std_dev,
        retry_seed, "degenerate image, retrying once with a fresh seed"
    );
    let raw = state.pipeline.infer(&params.with_seed(retry_seed)).await?;
    let processed = postprocess::process(&raw)?;
    if processed.degenerate {
        warn!(
            std_dev = processed.std_dev,
            "retry still degenerate, returning low-confidence image"
        );
    }
    Ok((processed, retry_seed))
}

async fn warmup(State(state): State<AppState>) -> Response {
    info!("warming up model");
    match state.pipeline.infer(&GenerationParams::warmup()).await {
        Ok(_) => Json(WarmupResponse {
            status: "warmed_up",
            device: state.device,
        })
        .into_response(),
        Err(e) => {
            error!("model warmup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WarmupFailure {
                    status: "warmup_failed",
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn unload(State(state): State<AppState>) -> Json<ActionResponse> {
    state.pipeline.unload().await;
    Json(ActionResponse {
        success: true,
        message: "Model unloaded",
    })
}

async fn reload(State(state): State<AppState>) -> Result<Json<ActionResponse>, ApiFailure> {
    info!("force reloading model");
    state.pipeline.reload().await?;
    Ok(Json(ActionResponse {
        success: true,
        message: "Model reloaded successfully",
    }))
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        current_model: state.model_id.clone(),
        available_models: AVAILABLE_MODELS.to_vec(),
    })
}

fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..1_000_000)
}

fn truncated(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
