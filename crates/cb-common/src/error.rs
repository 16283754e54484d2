//! Shared error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallBridgeError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Invalid URL: {message}")]
    InvalidUrl { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallBridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }
}
