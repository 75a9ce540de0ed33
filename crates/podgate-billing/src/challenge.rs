//! Payment challenges
//!
//! A failed charge answers with 402 and enough headers for the payer to retry
//! without asking for the price again.

use std::fmt;

use crate::pricing::PriceQuote;
use crate::transport::StreamCredentials;

/// Header names, lowercase as emitted on the wire
pub mod headers {
    pub const PAY: &str = "pay";
    pub const PAY_ACCEPT: &str = "pay-accept";
    pub const PAY_TOKEN: &str = "pay-token";

    pub const STREAM_DESTINATION_ACCOUNT: &str = "interledger-stream-destination-account";
    pub const STREAM_SHARED_SECRET: &str = "interledger-stream-shared-secret";
    pub const STREAM_PRICE: &str = "interledger-stream-price";
    pub const STREAM_ASSET_CODE: &str = "interledger-stream-asset-code";
    pub const STREAM_ASSET_SCALE: &str = "interledger-stream-asset-scale";

    pub const PULL_PRICE: &str = "interledger-pull-price";
    pub const PULL_ASSET_CODE: &str = "interledger-pull-asset-code";
    pub const PULL_ASSET_SCALE: &str = "interledger-pull-asset-scale";
    pub const PULL_INTERVAL: &str = "interledger-pull-interval";
}

/// Payment methods a payer can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    Stream,
    Pull,
}

impl PaymentMethod {
    /// Method token used in `pay` and `pay-accept`
    pub const fn token(self) -> &'static str {
        match self {
            PaymentMethod::Stream => "interledger-stream",
            PaymentMethod::Pull => "interledger-pull",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("interledger-stream") {
            Some(PaymentMethod::Stream)
        } else if token.eq_ignore_ascii_case("interledger-pull") {
            Some(PaymentMethod::Pull)
        } else {
            None
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Methods listed in a `pay-accept` header. Unknown tokens and `;` parameters
/// are ignored.
pub fn parse_pay_accept(header: &str) -> Vec<PaymentMethod> {
    let mut methods = Vec::new();
    for item in header.split(|c: char| c == ',' || c.is_whitespace()) {
        let token = item.split(';').next().unwrap_or_default().trim();
        if let Some(method) = PaymentMethod::from_token(token) {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
    }
    methods
}

/// Retry instructions returned with a 402
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChallenge {
    pub method: PaymentMethod,
    pub quote: Option<PriceQuote>,
    pub stream_credentials: Option<StreamCredentials>,
    /// Recurring pull interval (seconds)
    pub pull_interval_secs: Option<u64>,
    pub reason: String,
}

impl PaymentChallenge {
    pub fn new(method: PaymentMethod, reason: impl Into<String>) -> Self {
        Self {
            method,
            quote: None,
            stream_credentials: None,
            pull_interval_secs: None,
            reason: reason.into(),
        }
    }

    pub fn with_quote(mut self, quote: PriceQuote) -> Self {
        self.quote = Some(quote);
        self
    }

    pub fn with_credentials(mut self, credentials: Option<StreamCredentials>) -> Self {
        self.stream_credentials = credentials;
        self
    }

    pub fn with_pull_interval(mut self, secs: u64) -> Self {
        self.pull_interval_secs = Some(secs);
        self
    }

    /// Response headers for this challenge
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(6);

        match (self.method, &self.stream_credentials) {
            (PaymentMethod::Stream, Some(creds)) => {
                out.push((
                    headers::PAY,
                    format!(
                        "{} {} {}",
                        self.method.token(),
                        creds.destination_account,
                        creds.shared_secret
                    ),
                ));
                out.push((
                    headers::STREAM_DESTINATION_ACCOUNT,
                    creds.destination_account.clone(),
                ));
                out.push((headers::STREAM_SHARED_SECRET, creds.shared_secret.clone()));
            }
            (method, _) => out.push((headers::PAY, method.token().to_string())),
        }

        if let Some(quote) = &self.quote {
            let (price, code, scale) = match self.method {
                PaymentMethod::Stream => (
                    headers::STREAM_PRICE,
                    headers::STREAM_ASSET_CODE,
                    headers::STREAM_ASSET_SCALE,
                ),
                PaymentMethod::Pull => (
                    headers::PULL_PRICE,
                    headers::PULL_ASSET_CODE,
                    headers::PULL_ASSET_SCALE,
                ),
            };
            out.push((price, quote.amount.to_string()));
            out.push((code, quote.asset_code.clone()));
            out.push((scale, quote.asset_scale.to_string()));
        }

        if let (PaymentMethod::Pull, Some(interval)) = (self.method, self.pull_interval_secs) {
            out.push((headers::PULL_INTERVAL, interval.to_string()));
        }

        out
    }
}
