//! Request context for charged routes
//!
//! Payment headers and pod query parameters are read and validated once, at
//! the extractor, and handed to handlers as typed values.

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use podgate_billing::{headers, ChargeRequest};
use serde::Deserialize;

use crate::error::ApiError;

/// `/pods` query parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodQuery {
    pub manifest_hash: Option<String>,
    pub duration: Option<String>,
}

impl PodQuery {
    /// Non-empty `manifestHash`
    pub fn manifest_hash(&self) -> Option<&str> {
        self.manifest_hash.as_deref().filter(|h| !h.is_empty())
    }

    pub fn require_manifest_hash(&self) -> Result<&str, ApiError> {
        self.manifest_hash()
            .ok_or_else(|| ApiError::BadInput("manifestHash must be specified".into()))
    }

    /// `duration` in seconds, if supplied
    pub fn duration_secs(&self) -> Result<Option<u64>, ApiError> {
        match self.duration.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
                ApiError::BadInput(format!("duration must be a whole number of seconds, got {:?}", raw))
            }),
        }
    }
}

/// Validated payment context of a charged request
#[derive(Debug, Clone, Default)]
pub struct PaymentContext {
    pub query: PodQuery,
    pub charge: ChargeRequest,
}

impl PaymentContext {
    pub fn from_parts(headers: &HeaderMap, query: PodQuery) -> Result<Self, ApiError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let charge = ChargeRequest {
            pay_accept: header(headers::PAY_ACCEPT),
            pay_token: header(headers::PAY_TOKEN),
            duration_secs: query.duration_secs()?,
        };
        Ok(Self { query, charge })
    }

    pub fn require_manifest_hash(&self) -> Result<&str, ApiError> {
        self.query.require_manifest_hash()
    }

    pub fn require_duration(&self) -> Result<u64, ApiError> {
        self.charge
            .duration_secs
            .ok_or_else(|| ApiError::BadInput("duration must be specified".into()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for PaymentContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<PodQuery>::try_from_uri(&parts.uri)
            .map_err(|e| ApiError::BadInput(format!("invalid query: {}", e)))?;
        Self::from_parts(&parts.headers, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(hash: Option<&str>, duration: Option<&str>) -> PodQuery {
        PodQuery {
            manifest_hash: hash.map(String::from),
            duration: duration.map(String::from),
        }
    }

    #[test]
    fn test_reads_payment_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("pay-accept", HeaderValue::from_static("interledger-pull"));
        headers.insert("pay-token", HeaderValue::from_static("$wallet.example/alice"));

        let ctx = PaymentContext::from_parts(&headers, query(Some("abc"), Some("120"))).unwrap();
        assert_eq!(ctx.charge.pay_accept.as_deref(), Some("interledger-pull"));
        assert_eq!(ctx.charge.pay_token.as_deref(), Some("$wallet.example/alice"));
        assert_eq!(ctx.charge.duration_secs, Some(120));
        assert_eq!(ctx.require_manifest_hash().unwrap(), "abc");
    }

    #[test]
    fn test_missing_parameters() {
        let ctx = PaymentContext::from_parts(&HeaderMap::new(), query(Some(""), None)).unwrap();
        assert!(ctx.charge.pay_accept.is_none());
        assert!(matches!(ctx.require_manifest_hash(), Err(ApiError::BadInput(_))));
        assert!(matches!(ctx.require_duration(), Err(ApiError::BadInput(_))));
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(matches!(
            PaymentContext::from_parts(&HeaderMap::new(), query(None, Some("soon"))),
            Err(ApiError::BadInput(_))
        ));
    }
}
