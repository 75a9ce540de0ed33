//! API errors
//!
//! Every failure renders as `{"error": {"code", "message"}}`. Payment
//! failures also carry the challenge headers a client needs to retry.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use podgate_billing::{ChargeError, PaymentChallenge};
use podgate_common::{ManifestError, PodManagerError, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// HTTP-facing error taxonomy
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{}", .0.reason)]
    PaymentRequired(Box<PaymentChallenge>),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    GatewayTimeout(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    BadInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Internal(String),
}

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorResponse,
}

/// Error detail
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::ResourceExhausted(_) | ApiError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::BadInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::PaymentRequired(_) => "PAYMENT_REQUIRED",
            ApiError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            ApiError::Unavailable(_) => "UNAVAILABLE",
            ApiError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            ApiError::BadGateway(_) => "BAD_GATEWAY",
            ApiError::BadInput(_) => "BAD_INPUT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(message) = &self {
            error!(message = %message, "internal error");
        }

        let status = self.status();
        let body = ErrorBody {
            error: ErrorResponse {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();

        if let ApiError::PaymentRequired(challenge) = &self {
            let headers = response.headers_mut();
            for (name, value) in challenge.headers() {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(HeaderName::from_static(name), value);
                }
            }
        }
        response
    }
}

impl From<ChargeError> for ApiError {
    fn from(err: ChargeError) -> Self {
        match err {
            ChargeError::PaymentRequired(challenge) => ApiError::PaymentRequired(challenge),
            ChargeError::Pricing(e) => ApiError::Unavailable(format!("pricing unavailable: {}", e)),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<ManifestError> for ApiError {
    fn from(err: ManifestError) -> Self {
        ApiError::BadInput(err.to_string())
    }
}

impl From<PodManagerError> for ApiError {
    fn from(err: PodManagerError) -> Self {
        match err {
            PodManagerError::NotFound(id) => ApiError::NotFound(format!("no pod found with this id. id={}", id)),
            PodManagerError::Start(reason) => ApiError::Unavailable(format!("pod failed to start: {}", reason)),
            PodManagerError::Logs(reason) => ApiError::Internal(reason),
            PodManagerError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgate_billing::PaymentMethod;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::ResourceExhausted("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::GatewayTimeout("x".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::BadGateway("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::BadInput("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_payment_required_carries_headers() {
        let challenge = PaymentChallenge::new(PaymentMethod::Pull, "declined").with_pull_interval(300);
        let response = ApiError::PaymentRequired(Box::new(challenge)).into_response();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(response.headers()["pay"], "interledger-pull");
        assert_eq!(response.headers()["interledger-pull-interval"], "300");
    }

    #[test]
    fn test_pod_manager_errors() {
        let err: ApiError = PodManagerError::NotFound("abc".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = PodManagerError::Store(StoreError::Storage("down".into())).into();
        assert!(matches!(err, ApiError::Internal(_)));
    }
}
