//! Common types and utilities for API endpoints.

use std::error::Error;

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use edgecache_service::range::unsatisfied_range;
use edgecache_service::{Delivery, DeliveryBody, DeliveryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for API operations.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] DeliveryError);

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// A JSON error response returned by the API.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiErrorResponse {
    /// The error message.
    #[serde(default)]
    pub detail: Option<String>,
}

impl ApiErrorResponse {
    /// Creates an error response with the given message.
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }

    /// The response for unexpected failures. Never contains internal details.
    pub fn internal() -> Self {
        Self::new("internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            DeliveryError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, ApiErrorResponse::new(*reason))
            }
            DeliveryError::NotFound => {
                (StatusCode::NOT_FOUND, ApiErrorResponse::new("file not found"))
            }
            DeliveryError::Forbidden => {
                (StatusCode::FORBIDDEN, ApiErrorResponse::new("access denied"))
            }
            DeliveryError::RangeNotSatisfiable { size } => {
                let mut response =
                    (StatusCode::RANGE_NOT_SATISFIABLE, Body::empty()).into_response();
                if let Ok(value) = HeaderValue::from_str(&unsatisfied_range(*size)) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                return response;
            }
            DeliveryError::UpstreamTooLarge { .. } => (
                StatusCode::NOT_FOUND,
                ApiErrorResponse::new("file not found or too large"),
            ),
            DeliveryError::Internal { .. } => {
                tracing::error!(error = &self.0 as &dyn Error, "error handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, ApiErrorResponse::internal())
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Converts a successful delivery into an HTTP response.
pub fn delivery_response(delivery: Delivery) -> Response {
    let Delivery {
        status,
        headers,
        body,
        ..
    } = delivery;

    let body = match body {
        DeliveryBody::Empty => Body::empty(),
        DeliveryBody::Full(bytes) => Body::from(bytes),
        DeliveryBody::Stream(stream) => Body::from_stream(stream),
    };

    (status, headers, body).into_response()
}
