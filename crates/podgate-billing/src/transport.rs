//! Payment transports
//!
//! Interledger STREAM receiving and pull payments are external
//! collaborators. These traits are the seam the negotiator drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Destination a payer streams money to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCredentials {
    pub destination_account: String,
    /// Base64 shared secret
    pub shared_secret: String,
}

/// Stream setup or receive failure
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct StreamFailure {
    pub reason: String,
    /// Credentials the payer can retry against, if the transport issued any
    pub credentials: Option<StreamCredentials>,
}

impl StreamFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: StreamCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Incoming STREAM payment
#[async_trait]
pub trait PaymentStream: Send {
    /// Wait until `amount` has been received or `timeout` elapses
    async fn receive_total(&mut self, amount: u64, timeout: Duration) -> Result<(), StreamFailure>;

    /// Amount received so far, including partial payment after a failure
    fn total_received(&self) -> u64;

    /// Return funds that will not buy any hosting. Returns the amount
    /// refunded, which is deducted from the credited profit.
    async fn refund_unused(&mut self, _received: u64) -> Result<u64, StreamFailure> {
        Ok(0)
    }
}

/// Opens STREAM payments for a pay token
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, pay_token: &str) -> Result<Box<dyn PaymentStream>, StreamFailure>;
}

/// Pull payment failure
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct PullFailure {
    pub reason: String,
    /// Amount collected before the failure
    pub total_received: u64,
}

impl PullFailure {
    pub fn new(reason: impl Into<String>, total_received: u64) -> Self {
        Self {
            reason: reason.into(),
            total_received,
        }
    }
}

/// Pulls money from a payer's payment pointer
#[async_trait]
pub trait PullTransport: Send + Sync {
    /// Pull `amount` from `pointer`. Returns the total received on success.
    async fn pull(&self, pointer: &str, amount: u64, timeout: Duration) -> Result<u64, PullFailure>;
}
