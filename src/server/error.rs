//! Client-facing error responses.

use axum::{
    Json,
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::pipeline::PredictError;

#[derive(Debug)]
pub enum AppError {
    Predict(PredictError),
    Multipart { status: StatusCode, message: String },
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Predict(err) => match err {
                PredictError::MissingFile => StatusCode::BAD_REQUEST,
                PredictError::Decode(_)
                | PredictError::NoHandDetected
                | PredictError::UnusableLandmarkCount { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                PredictError::Detection(_) | PredictError::Classification(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                PredictError::Overloaded | PredictError::WorkerUnavailable => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PredictError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            },
            AppError::Multipart { status, .. } => *status,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Predict(err) => match err {
                PredictError::MissingFile => "missing_file",
                PredictError::Decode(_) => "decode_error",
                PredictError::NoHandDetected => "no_hand_detected",
                PredictError::UnusableLandmarkCount { .. } => "unusable_landmark_count",
                PredictError::Detection(_) => "detection_error",
                PredictError::Classification(_) => "classification_error",
                PredictError::Overloaded => "overloaded",
                PredictError::WorkerUnavailable => "worker_unavailable",
                PredictError::Timeout => "timeout",
            },
            AppError::Multipart { status, .. } if *status == StatusCode::PAYLOAD_TOO_LARGE => {
                "payload_too_large"
            }
            AppError::Multipart { .. } => "invalid_multipart",
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::Predict(err) => err.to_string(),
            AppError::Multipart { message, .. } => message.clone(),
        }
    }
}

impl From<PredictError> for AppError {
    fn from(e: PredictError) -> Self {
        AppError::Predict(e)
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::Multipart {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl From<MultipartRejection> for AppError {
    fn from(e: MultipartRejection) -> Self {
        AppError::Multipart {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    detail: String,
    code: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            detail: self.detail(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}
