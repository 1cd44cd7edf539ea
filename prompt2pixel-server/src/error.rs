use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prompt2pixel_core::Error;

use crate::handlers::ErrorResponse;

/// Maps generator errors onto status codes and the `{success: false, error}` body.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(format!(
            "Invalid JSON body: {}",
            rejection.body_text()
        )))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unavailable
            | Error::UnknownModel { .. }
            | Error::ModelLoad { .. }
            | Error::Device(_)
            | Error::Generation(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self.0 {
            Error::Io(err) => {
                tracing::error!(error = %err, "internal error");
                "Internal server error".to_string()
            }
            err => err.to_string(),
        };
        (status, Json(ErrorResponse::new(error))).into_response()
    }
}
