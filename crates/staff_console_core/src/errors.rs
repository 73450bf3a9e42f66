use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FALLBACK_MESSAGE: &str = "An unexpected error occurred";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("upload response did not contain a url")]
    MissingUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeError {
    pub code: String,
    pub message: String,
}

impl InvokeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub fn invalid_payload(error: serde_json::Error) -> InvokeError {
    InvokeError::new("invalid_payload", error.to_string())
}

/// Turns any collaborator failure into text fit for the UI.
///
/// A server-provided message anywhere in the chain wins over transport
/// context added on the way up.
pub fn extract_message(error: &anyhow::Error) -> String {
    if let Some(api_error) = error.chain().find_map(|cause| cause.downcast_ref::<ApiError>()) {
        let message = api_error.to_string();
        if !message.trim().is_empty() {
            return message;
        }
    }

    let message = error.to_string();
    if message.trim().is_empty() {
        FALLBACK_MESSAGE.to_string()
    } else {
        message
    }
}
