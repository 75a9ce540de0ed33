//! Simulated payment transports
//!
//! Collect the requested amount immediately for any non-empty token. For
//! local development only; no money moves.

use async_trait::async_trait;
use std::time::Duration;

use crate::transport::{
    PaymentStream, PullFailure, PullTransport, StreamFailure, StreamTransport,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedStreamTransport;

struct SimulatedStream {
    received: u64,
}

#[async_trait]
impl PaymentStream for SimulatedStream {
    async fn receive_total(&mut self, amount: u64, _timeout: Duration) -> Result<(), StreamFailure> {
        // In production: wait on the STREAM connection's receive total
        self.received = amount;
        Ok(())
    }

    fn total_received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl StreamTransport for SimulatedStreamTransport {
    async fn open(&self, pay_token: &str) -> Result<Box<dyn PaymentStream>, StreamFailure> {
        if pay_token.trim().is_empty() {
            return Err(StreamFailure::new("empty pay token"));
        }
        Ok(Box::new(SimulatedStream { received: 0 }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedPullTransport;

#[async_trait]
impl PullTransport for SimulatedPullTransport {
    async fn pull(&self, pointer: &str, amount: u64, _timeout: Duration) -> Result<u64, PullFailure> {
        if pointer.trim().is_empty() {
            return Err(PullFailure::new("empty payment pointer", 0));
        }
        // In production: pull from the payer's payment pointer
        Ok(amount)
    }
}
