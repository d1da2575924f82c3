use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allowlist::Operation;
use crate::runtime::RuntimeError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("missing or invalid bearer token")]
    Authentication,

    #[error("operation {op} on container {name} is not allowlisted")]
    AllowlistViolation { name: String, op: Operation },

    #[error("container runtime call failed: {0}")]
    RuntimeCall(#[from] RuntimeError),
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            BrokerError::Authentication => StatusCode::UNAUTHORIZED,
            BrokerError::AllowlistViolation { .. } => StatusCode::FORBIDDEN,
            BrokerError::RuntimeCall(RuntimeError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::RuntimeCall(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Non-2xx responses carry the error as a JSON field.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub container: String,
    pub op: Operation,
}
