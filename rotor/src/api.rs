use audit::ReportRejected;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::broker_client::BrokerCallError;
use crate::pool::PoolError;

#[derive(Error, Debug)]
pub enum RotorError {
    #[error("a rotation cycle is already in progress")]
    ConcurrentRotation { in_flight: Uuid },

    #[error("container {name} is not managed by this controller")]
    UnknownContainer { name: String },

    #[error("no rotation slot has an active container to replace")]
    NothingToRotate,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("lifecycle broker call failed: {0}")]
    BrokerCall(#[from] BrokerCallError),

    #[error(transparent)]
    ReportRejected(#[from] ReportRejected),

    #[error("report body is not valid JSON: {0}")]
    ReportInvalid(String),
}

impl IntoResponse for RotorError {
    fn into_response(self) -> Response {
        match &self {
            RotorError::ConcurrentRotation { in_flight } => (
                StatusCode::CONFLICT,
                Json(ConflictBody {
                    error: self.to_string(),
                    cycle_id: *in_flight,
                }),
            )
                .into_response(),

            RotorError::UnknownContainer { .. } => {
                (StatusCode::NOT_FOUND, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::Pool(PoolError::InvariantViolation { .. }) => {
                (StatusCode::CONFLICT, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::Pool(PoolError::Reload(_)) | RotorError::BrokerCall(_) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::ReportRejected(ReportRejected::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::ReportRejected(ReportRejected::RateLimited) => {
                (StatusCode::TOO_MANY_REQUESTS, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::ReportInvalid(_) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody::from(&self))).into_response()
            }

            RotorError::NothingToRotate => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::from(&self)),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl From<&RotorError> for ErrorBody {
    fn from(err: &RotorError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

/// 409 body for triggers arriving while a cycle is non-terminal; carries
/// the in-flight cycle id so callers can follow it.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictBody {
    pub error: String,
    pub cycle_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RotateResponse {
    pub cycle_id: Uuid,
}
