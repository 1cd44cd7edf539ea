use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use prompt2pixel_core::{Error, ImageStore, LocalImageGenerator};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;

use crate::error::ApiError;

/// Endpoint names and routes, as advertised by `GET /` and at startup.
pub const ENDPOINTS: &[(&str, &str)] = &[
    ("generate", "POST /api/v1/generate"),
    ("models", "GET /api/v1/models"),
    ("switch_model", "POST /api/v1/models/{model_type}"),
    ("health", "GET /api/v1/health"),
    ("images", "GET /generated_images/{filename}"),
];

// Application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    generator: Option<Arc<LocalImageGenerator>>,
    store: ImageStore,
}

impl AppState {
    pub fn ready(generator: Arc<LocalImageGenerator>) -> Self {
        let store = generator.store().clone();
        Self {
            generator: Some(generator),
            store,
        }
    }

    /// State for a service whose generator failed to initialize. Previously
    /// generated images in `store` are still served.
    pub fn degraded(store: ImageStore) -> Self {
        Self {
            generator: None,
            store,
        }
    }

    pub fn generator(&self) -> Result<&LocalImageGenerator, ApiError> {
        self.generator
            .as_deref()
            .ok_or(ApiError(Error::Unavailable))
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/v1/generate", post(handlers::generate))
        .route("/api/v1/models", get(handlers::list_models))
        .route("/api/v1/models/{model_type}", post(handlers::switch_model))
        .route("/api/v1/health", get(handlers::health))
        .route("/generated_images/{filename}", get(handlers::serve_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
