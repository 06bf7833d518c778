use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Map a configuration key to the environment variable that sets it.
///
/// A bare field name is taken to belong to the provider section, the only
/// section with required fields.
pub fn to_env_var(field_path: &str) -> String {
    let path = if field_path.contains('.') {
        field_path.to_string()
    } else {
        format!("provider.{}", field_path)
    };

    let key = path
        .split('.')
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join("__");
    format!("AUDENTIX_{}", key)
}

/// Failures of a chat request that happen before streaming starts
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    InvalidBody(#[from] serde_json::Error),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        tracing::error!("Chat request failed: {}", self);
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
