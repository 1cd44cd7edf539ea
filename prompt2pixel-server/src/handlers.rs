use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::header,
    response::IntoResponse,
};
use prompt2pixel_core::{Error, GenerationRequest, ModelVariant};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::{error::ApiError, AppState, ENDPOINTS};

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct GenerateResponse {
    pub success: bool,
    pub filename: String,
    pub seed: u64,
    pub model: ModelVariant,
}

#[derive(Serialize, Debug)]
pub struct ModelsResponse {
    pub models: Vec<ModelVariant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_model: Option<ModelVariant>,
}

#[derive(Serialize, Debug)]
pub struct SwitchModelResponse {
    pub success: bool,
    pub message: String,
    pub current_model: ModelVariant,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub device: String,
    pub model: String,
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let generator = state.generator()?;
    let Json(request) = payload?;
    let params = request.validate().inspect_err(|err| {
        warn!(error = %err, "rejected generation request");
    })?;

    let generated = generator.generate_image(params).await?;
    Ok(Json(GenerateResponse {
        success: true,
        filename: generated.filename,
        seed: generated.seed,
        model: generated.model,
    }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let response = match state.generator() {
        Ok(generator) => ModelsResponse {
            models: generator.available_models(),
            current_model: Some(generator.current_model()),
        },
        Err(_) => ModelsResponse {
            models: Vec::new(),
            current_model: None,
        },
    };
    Json(response)
}

pub async fn switch_model(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
) -> Result<Json<SwitchModelResponse>, ApiError> {
    let generator = state.generator()?;
    let variant = generator.switch_model(&model_type).await?;
    Ok(Json(SwitchModelResponse {
        success: true,
        message: format!("Switched to {variant}"),
        current_model: variant,
    }))
}

pub async fn serve_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (bytes, content_type) = state.store().read(&filename).await.inspect_err(|err| {
        if matches!(err, Error::InvalidFilename(_)) {
            warn!(%filename, "rejected image path");
        }
    })?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let response = match state.generator() {
        Ok(generator) => HealthResponse {
            status: "healthy",
            device: generator.device().to_string(),
            model: generator.current_model().to_string(),
        },
        Err(_) => HealthResponse {
            status: "unhealthy",
            device: "unknown".to_string(),
            model: "unknown".to_string(),
        },
    };
    Json(response)
}

pub async fn index() -> Json<Value> {
    let endpoints: Map<String, Value> = ENDPOINTS
        .iter()
        .map(|(name, route)| (name.to_string(), Value::from(*route)))
        .collect();
    Json(json!({
        "message": "Local Image Generator API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}
