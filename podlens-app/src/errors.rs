use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use podlens_core::errors::PodlensError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct AppError(Box<ErrorKind>);

#[derive(Error, Debug)]
#[error(transparent)]
pub enum ErrorKind {
    #[error("PodlensError: {0}")]
    Podlens(#[from] PodlensError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("ConfigError: {0}")]
    Config(#[from] toml::de::Error),
    #[error("MutationInFlight: {0}")]
    InFlight(String),
    #[error("MutationFailed: {0}")]
    MutationFailed(String),
    #[error("MutationTimedOut: {0}")]
    MutationTimedOut(String),
    #[error("AssistantError: {0}")]
    Assistant(String),
    #[error("AssistantDisabled: set LLM_BASE_URL and LLM_MODEL to enable the assistant")]
    AssistantDisabled,
}

impl<E> From<E> for AppError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        AppError(Box::new(ErrorKind::from(err)))
    }
}

impl AppError {
    pub fn in_flight(message: impl Into<String>) -> Self {
        AppError(Box::new(ErrorKind::InFlight(message.into())))
    }

    pub fn mutation_failed(message: impl Into<String>) -> Self {
        AppError(Box::new(ErrorKind::MutationFailed(message.into())))
    }

    pub fn mutation_timed_out(message: impl Into<String>) -> Self {
        AppError(Box::new(ErrorKind::MutationTimedOut(message.into())))
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        AppError(Box::new(ErrorKind::Assistant(message.into())))
    }

    pub fn assistant_disabled() -> Self {
        AppError(Box::new(ErrorKind::AssistantDisabled))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    fn get_codes(&self) -> (StatusCode, u16) {
        match &*self.0 {
            ErrorKind::Podlens(err) if err.is_validation() => (StatusCode::BAD_REQUEST, 40001),
            ErrorKind::Podlens(_) => (StatusCode::BAD_GATEWAY, 50201),
            ErrorKind::InFlight(_) => (StatusCode::CONFLICT, 40901),
            ErrorKind::MutationFailed(_) => (StatusCode::BAD_GATEWAY, 50202),
            ErrorKind::Assistant(_) => (StatusCode::BAD_GATEWAY, 50203),
            ErrorKind::MutationTimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, 50401),
            ErrorKind::AssistantDisabled => (StatusCode::SERVICE_UNAVAILABLE, 50301),
            ErrorKind::Io(_) | ErrorKind::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, 50001),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: u16,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status_code, code) = self.get_codes();
        let message = self.to_string();
        let body = Json(ErrorCode { code, message });
        (status_code, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_error_kind() {
        let validation: AppError = PodlensError::validation("bad level").into();
        assert_eq!(validation.get_codes(), (StatusCode::BAD_REQUEST, 40001));
        let upstream: AppError = PodlensError::upstream("prometheus down").into();
        assert_eq!(upstream.get_codes(), (StatusCode::BAD_GATEWAY, 50201));
        assert_eq!(
            AppError::mutation_timed_out("x").get_codes(),
            (StatusCode::GATEWAY_TIMEOUT, 50401)
        );
        assert_eq!(AppError::in_flight("x").get_codes(), (StatusCode::CONFLICT, 40901));
    }
}
