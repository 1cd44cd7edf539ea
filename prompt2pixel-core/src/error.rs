use thiserror::Error;

use crate::ModelVariant;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the generator wrapper and the asset store.
///
/// Everything that crosses the crate boundary is one of these; internal
/// plumbing uses `anyhow` and is flattened into a message here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Image generator not available")]
    Unavailable,

    #[error("Unknown model type: {name} (available: {available})")]
    UnknownModel { name: String, available: String },

    #[error("Failed to load model {variant}: {reason}")]
    ModelLoad {
        variant: ModelVariant,
        reason: String,
    },

    #[error("No usable compute device: {0}")]
    Device(String),

    #[error("{0}")]
    Generation(String),

    #[error("Invalid image filename: {0}")]
    InvalidFilename(String),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn unknown_model(name: &str) -> Self {
        let available = ModelVariant::ALL
            .iter()
            .map(ModelVariant::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self::UnknownModel {
            name: name.to_string(),
            available,
        }
    }
}
