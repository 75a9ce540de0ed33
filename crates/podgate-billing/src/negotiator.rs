//! Charge Negotiator
//!
//! Picks a payment flow from the payer's advertised capabilities, prices the
//! hosting duration and blocks until the money arrives. Every flow credits
//! whatever was actually received before it returns, paid in full or not.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::challenge::{parse_pay_accept, PaymentChallenge, PaymentMethod};
use crate::ledger::{credit_profit, ProfitLedger};
use crate::pricing::{self, PriceError, PriceFeed, PriceQuote, SettlementAsset};
use crate::recurring::{RecurringPull, RecurringPullEngine};
use crate::transport::{PullTransport, StreamTransport};

/// Duration and timeout policy
#[derive(Debug, Clone)]
pub struct ChargePolicy {
    pub min_duration_secs: u64,
    pub default_duration_secs: u64,
    pub payment_timeout: Duration,
}

impl Default for ChargePolicy {
    fn default() -> Self {
        Self {
            min_duration_secs: 300,
            default_duration_secs: 600,
            payment_timeout: Duration::from_secs(30),
        }
    }
}

/// Payment headers and requested duration of one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Raw `pay-accept` header
    pub pay_accept: Option<String>,
    /// Raw `pay-token` header
    pub pay_token: Option<String>,
    /// Requested duration (seconds)
    pub duration_secs: Option<u64>,
}

impl ChargeRequest {
    fn token(&self) -> Option<&str> {
        self.pay_token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Flow chosen for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Stream { duration_secs: u64 },
    OneOffPull { duration_secs: u64 },
    RecurringPull { duration_secs: u64 },
    Unsupported,
}

/// Charge errors
#[derive(Debug, Error)]
pub enum ChargeError {
    #[error("payment required: {}", .0.reason)]
    PaymentRequired(Box<PaymentChallenge>),
    #[error(transparent)]
    Pricing(#[from] PriceError),
}

impl From<PaymentChallenge> for ChargeError {
    fn from(challenge: PaymentChallenge) -> Self {
        ChargeError::PaymentRequired(Box::new(challenge))
    }
}

/// Requested durations are capped at the minimum.
pub fn clamp_duration(requested: u64, min_duration_secs: u64) -> u64 {
    requested.min(min_duration_secs)
}

/// Select the payment flow for `request`
pub fn select_flow(request: &ChargeRequest, policy: &ChargePolicy) -> Flow {
    let methods = request.pay_accept.as_deref().map(parse_pay_accept);
    let stream = match &methods {
        None => true,
        Some(m) => m.contains(&PaymentMethod::Stream),
    };
    let pull = methods
        .as_ref()
        .is_some_and(|m| m.contains(&PaymentMethod::Pull));

    if stream {
        Flow::Stream {
            duration_secs: request
                .duration_secs
                .map(|d| clamp_duration(d, policy.min_duration_secs))
                .unwrap_or(policy.default_duration_secs),
        }
    } else if pull {
        match request.duration_secs {
            Some(d) => Flow::OneOffPull {
                duration_secs: clamp_duration(d, policy.min_duration_secs),
            },
            None => Flow::RecurringPull {
                duration_secs: policy.min_duration_secs,
            },
        }
    } else {
        Flow::Unsupported
    }
}

/// Payment negotiation for pod hosting
pub struct ChargeNegotiator {
    policy: ChargePolicy,
    asset: SettlementAsset,
    prices: Arc<dyn PriceFeed>,
    ledger: Arc<dyn ProfitLedger>,
    streams: Arc<dyn StreamTransport>,
    pulls: Arc<dyn PullTransport>,
    recurring: Arc<dyn RecurringPullEngine>,
}

impl ChargeNegotiator {
    pub fn new(
        policy: ChargePolicy,
        asset: SettlementAsset,
        prices: Arc<dyn PriceFeed>,
        ledger: Arc<dyn ProfitLedger>,
        streams: Arc<dyn StreamTransport>,
        pulls: Arc<dyn PullTransport>,
        recurring: Arc<dyn RecurringPullEngine>,
    ) -> Self {
        Self {
            policy,
            asset,
            prices,
            ledger,
            streams,
            pulls,
            recurring,
        }
    }

    pub fn policy(&self) -> &ChargePolicy {
        &self.policy
    }

    pub fn asset(&self) -> &SettlementAsset {
        &self.asset
    }

    /// Charge for hosting `manifest_hash`. Returns the paid-for duration in
    /// seconds.
    pub async fn charge_for_duration(
        &self,
        request: &ChargeRequest,
        manifest_hash: &str,
    ) -> Result<u64, ChargeError> {
        match select_flow(request, &self.policy) {
            Flow::Stream { duration_secs } => {
                let quote = self.quote(duration_secs).await?;
                debug!(manifest_hash, price = quote.amount, duration_secs, "streaming payment");
                self.stream_payment(request, &quote, manifest_hash).await?;
                Ok(duration_secs)
            }
            Flow::OneOffPull { duration_secs } => {
                let quote = self.quote(duration_secs).await?;
                debug!(manifest_hash, price = quote.amount, duration_secs, "pulling payment");
                self.pull_payment(request, &quote, manifest_hash).await?;
                Ok(duration_secs)
            }
            Flow::RecurringPull { duration_secs } => {
                let quote = self.quote(duration_secs).await?;
                debug!(
                    manifest_hash,
                    price = quote.amount,
                    interval_secs = duration_secs,
                    "starting recurring pull"
                );
                self.recurring_payment(request, &quote, manifest_hash).await?;
                Ok(duration_secs)
            }
            Flow::Unsupported => {
                info!(manifest_hash, "no supported payment method offered");
                Err(PaymentChallenge::new(
                    PaymentMethod::Stream,
                    "no supported payment method offered",
                )
                .into())
            }
        }
    }

    async fn quote(&self, duration_secs: u64) -> Result<PriceQuote, PriceError> {
        let rate = self.prices.rate_per_second(&self.asset).await?;
        pricing::quote(rate, duration_secs, &self.asset)
    }

    async fn stream_payment(
        &self,
        request: &ChargeRequest,
        quote: &PriceQuote,
        manifest_hash: &str,
    ) -> Result<(), ChargeError> {
        let challenge = |reason: String| {
            PaymentChallenge::new(PaymentMethod::Stream, reason).with_quote(quote.clone())
        };

        let Some(token) = request.token() else {
            return Err(challenge("pay-token header required for streaming payment".into()).into());
        };

        let mut stream = match self.streams.open(token).await {
            Ok(stream) => stream,
            Err(failure) => {
                warn!(manifest_hash, reason = %failure.reason, "could not open payment stream");
                return Err(challenge(failure.reason)
                    .with_credentials(failure.credentials)
                    .into());
            }
        };

        let outcome = stream
            .receive_total(quote.amount, self.policy.payment_timeout)
            .await;
        let received = stream.total_received();

        let refunded = if outcome.is_err() && received > 0 {
            match stream.refund_unused(received).await {
                Ok(refunded) => refunded.min(received),
                Err(e) => {
                    warn!(manifest_hash, received, error = %e, "refund failed");
                    0
                }
            }
        } else {
            0
        };

        credit_profit(self.ledger.as_ref(), &self.asset, received - refunded, manifest_hash).await;

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => {
                error!(
                    manifest_hash,
                    received,
                    price = quote.amount,
                    reason = %failure.reason,
                    "error receiving payment"
                );
                Err(challenge(format!(
                    "failed to get payment before timeout: {}",
                    failure.reason
                ))
                .with_credentials(failure.credentials)
                .into())
            }
        }
    }

    async fn pull_payment(
        &self,
        request: &ChargeRequest,
        quote: &PriceQuote,
        manifest_hash: &str,
    ) -> Result<(), ChargeError> {
        let challenge = |reason: String| {
            PaymentChallenge::new(PaymentMethod::Pull, reason).with_quote(quote.clone())
        };

        let Some(pointer) = request.token() else {
            return Err(challenge("pay-token header with a payment pointer required".into()).into());
        };

        match self
            .pulls
            .pull(pointer, quote.amount, self.policy.payment_timeout)
            .await
        {
            Ok(received) => {
                credit_profit(self.ledger.as_ref(), &self.asset, received, manifest_hash).await;
                Ok(())
            }
            Err(failure) => {
                credit_profit(
                    self.ledger.as_ref(),
                    &self.asset,
                    failure.total_received,
                    manifest_hash,
                )
                .await;
                error!(
                    manifest_hash,
                    received = failure.total_received,
                    price = quote.amount,
                    reason = %failure.reason,
                    "error pulling payment"
                );
                Err(challenge(format!("pull payment failed: {}", failure.reason)).into())
            }
        }
    }

    async fn recurring_payment(
        &self,
        request: &ChargeRequest,
        quote: &PriceQuote,
        manifest_hash: &str,
    ) -> Result<(), ChargeError> {
        let interval_secs = self.policy.min_duration_secs;
        let challenge = |reason: String| {
            PaymentChallenge::new(PaymentMethod::Pull, reason)
                .with_quote(quote.clone())
                .with_pull_interval(interval_secs)
        };

        let Some(pointer) = request.token() else {
            return Err(challenge("pay-token header with a payment pointer required".into()).into());
        };

        let subscription = RecurringPull {
            pointer: pointer.to_string(),
            amount: quote.amount,
            interval: Duration::from_secs(interval_secs),
            timeout: self.policy.payment_timeout,
        };

        match self.recurring.start(manifest_hash, subscription).await {
            Ok(received) => {
                credit_profit(self.ledger.as_ref(), &self.asset, received, manifest_hash).await;
                Ok(())
            }
            Err(failure) => {
                credit_profit(
                    self.ledger.as_ref(),
                    &self.asset,
                    failure.total_received,
                    manifest_hash,
                )
                .await;
                error!(
                    manifest_hash,
                    received = failure.total_received,
                    price = quote.amount,
                    reason = %failure.reason,
                    "error starting recurring pull"
                );
                Err(challenge(format!("recurring pull failed: {}", failure.reason)).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::headers;
    use crate::ledger::{InMemoryProfitLedger, LedgerError};
    use crate::pricing::FixedRateFeed;
    use crate::transport::{PaymentStream, PullFailure, StreamCredentials, StreamFailure};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    const HASH: &str = "hash";

    /// Stream that receives `deliver` units then either succeeds or fails
    struct ScriptedStream {
        deliver: u64,
        received: u64,
        fail: Option<StreamFailure>,
        refund: u64,
    }

    #[async_trait]
    impl PaymentStream for ScriptedStream {
        async fn receive_total(&mut self, _amount: u64, _timeout: Duration) -> Result<(), StreamFailure> {
            self.received = self.deliver;
            match self.fail.take() {
                Some(f) => Err(f),
                None => Ok(()),
            }
        }

        fn total_received(&self) -> u64 {
            self.received
        }

        async fn refund_unused(&mut self, received: u64) -> Result<u64, StreamFailure> {
            Ok(self.refund.min(received))
        }
    }

    #[derive(Default)]
    struct FakeStreams {
        deliver: Option<u64>,
        fail: Option<StreamFailure>,
        open_error: Option<StreamFailure>,
        refund: u64,
        tokens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamTransport for FakeStreams {
        async fn open(&self, pay_token: &str) -> Result<Box<dyn PaymentStream>, StreamFailure> {
            self.tokens.lock().push(pay_token.to_string());
            if let Some(e) = &self.open_error {
                return Err(e.clone());
            }
            Ok(Box::new(ScriptedStream {
                deliver: self.deliver.unwrap_or(0),
                received: 0,
                fail: self.fail.clone(),
                refund: self.refund,
            }))
        }
    }

    #[derive(Default)]
    struct FakePulls {
        outcome: Option<Result<u64, PullFailure>>,
        calls: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl PullTransport for FakePulls {
        async fn pull(&self, pointer: &str, amount: u64, _timeout: Duration) -> Result<u64, PullFailure> {
            self.calls.lock().push((pointer.to_string(), amount));
            self.outcome.clone().unwrap_or(Ok(amount))
        }
    }

    #[derive(Default)]
    struct FakeRecurring {
        outcome: Option<Result<u64, PullFailure>>,
        started: Mutex<Vec<(String, RecurringPull)>>,
    }

    #[async_trait]
    impl RecurringPullEngine for FakeRecurring {
        async fn start(&self, manifest_hash: &str, pull: RecurringPull) -> Result<u64, PullFailure> {
            let amount = pull.amount;
            self.started.lock().push((manifest_hash.to_string(), pull));
            self.outcome.clone().unwrap_or(Ok(amount))
        }

        fn stop(&self, _manifest_hash: &str) -> bool {
            false
        }

        fn is_active(&self, _manifest_hash: &str) -> bool {
            false
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl ProfitLedger for BrokenLedger {
        async fn add_profit(&self, _: &SettlementAsset, _: u64) -> Result<(), LedgerError> {
            Err(LedgerError::Unavailable("down".into()))
        }
    }

    struct Harness {
        negotiator: ChargeNegotiator,
        ledger: Arc<InMemoryProfitLedger>,
        streams: Arc<FakeStreams>,
        pulls: Arc<FakePulls>,
        recurring: Arc<FakeRecurring>,
    }

    fn asset() -> SettlementAsset {
        SettlementAsset::new("XRP", 9)
    }

    // 2 units per second: 300s costs 600, 600s costs 1200
    fn harness(streams: FakeStreams, pulls: FakePulls, recurring: FakeRecurring) -> Harness {
        let ledger = Arc::new(InMemoryProfitLedger::new());
        let streams = Arc::new(streams);
        let pulls = Arc::new(pulls);
        let recurring = Arc::new(recurring);
        let negotiator = ChargeNegotiator::new(
            ChargePolicy::default(),
            asset(),
            Arc::new(FixedRateFeed::new(dec!(2))),
            ledger.clone(),
            streams.clone(),
            pulls.clone(),
            recurring.clone(),
        );
        Harness {
            negotiator,
            ledger,
            streams,
            pulls,
            recurring,
        }
    }

    fn request(accept: Option<&str>, token: Option<&str>, duration: Option<u64>) -> ChargeRequest {
        ChargeRequest {
            pay_accept: accept.map(String::from),
            pay_token: token.map(String::from),
            duration_secs: duration,
        }
    }

    fn challenge(err: ChargeError) -> PaymentChallenge {
        match err {
            ChargeError::PaymentRequired(c) => *c,
            other => panic!("expected a payment challenge, got {:?}", other),
        }
    }

    #[test]
    fn test_duration_clamp_is_a_ceiling() {
        assert_eq!(clamp_duration(100, 300), 100);
        assert_eq!(clamp_duration(300, 300), 300);
        assert_eq!(clamp_duration(3600, 300), 300);
    }

    #[test]
    fn test_flow_selection() {
        let policy = ChargePolicy::default();
        assert_eq!(
            select_flow(&request(None, None, None), &policy),
            Flow::Stream { duration_secs: 600 }
        );
        assert_eq!(
            select_flow(&request(None, None, Some(3600)), &policy),
            Flow::Stream { duration_secs: 300 }
        );
        assert_eq!(
            select_flow(&request(Some("interledger-pull, interledger-stream"), None, Some(60)), &policy),
            Flow::Stream { duration_secs: 60 }
        );
        assert_eq!(
            select_flow(&request(Some("interledger-pull"), None, Some(120)), &policy),
            Flow::OneOffPull { duration_secs: 120 }
        );
        assert_eq!(
            select_flow(&request(Some("interledger-pull"), None, None), &policy),
            Flow::RecurringPull { duration_secs: 300 }
        );
        assert_eq!(
            select_flow(&request(Some("bitcoin"), None, None), &policy),
            Flow::Unsupported
        );
    }

    #[tokio::test]
    async fn test_no_headers_challenges_stream_with_price() {
        let h = harness(FakeStreams::default(), FakePulls::default(), FakeRecurring::default());
        let err = h
            .negotiator
            .charge_for_duration(&request(None, None, None), HASH)
            .await
            .unwrap_err();

        let c = challenge(err);
        assert_eq!(c.method, PaymentMethod::Stream);
        assert_eq!(c.quote.as_ref().map(|q| q.amount), Some(1200));
        assert_eq!(c.headers()[0], (headers::PAY, "interledger-stream".to_string()));
        assert!(h.streams.tokens.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_challenges_stream() {
        let h = harness(FakeStreams::default(), FakePulls::default(), FakeRecurring::default());
        let err = h
            .negotiator
            .charge_for_duration(&request(Some("card"), Some("tok"), None), HASH)
            .await
            .unwrap_err();

        let c = challenge(err);
        assert_eq!(c.method, PaymentMethod::Stream);
        assert!(c.quote.is_none());
    }

    #[tokio::test]
    async fn test_stream_success_credits_received() {
        let h = harness(
            FakeStreams {
                deliver: Some(1200),
                ..Default::default()
            },
            FakePulls::default(),
            FakeRecurring::default(),
        );
        let duration = h
            .negotiator
            .charge_for_duration(&request(None, Some("tok"), None), HASH)
            .await
            .unwrap();

        assert_eq!(duration, 600);
        assert_eq!(h.ledger.total(&asset()), 1200);
        assert_eq!(h.streams.tokens.lock().as_slice(), ["tok".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_timeout_credits_partial_and_propagates_credentials() {
        let creds = StreamCredentials {
            destination_account: "g.host.pod".into(),
            shared_secret: "c2VjcmV0".into(),
        };
        let h = harness(
            FakeStreams {
                deliver: Some(400),
                fail: Some(StreamFailure::new("timed out").with_credentials(creds.clone())),
                ..Default::default()
            },
            FakePulls::default(),
            FakeRecurring::default(),
        );
        let err = h
            .negotiator
            .charge_for_duration(&request(Some("interledger-stream"), Some("tok"), Some(300)), HASH)
            .await
            .unwrap_err();

        let c = challenge(err);
        assert_eq!(c.method, PaymentMethod::Stream);
        assert_eq!(c.stream_credentials, Some(creds));
        assert_eq!(c.quote.map(|q| q.amount), Some(600));
        assert_eq!(h.ledger.total(&asset()), 400);
    }

    #[tokio::test]
    async fn test_stream_refund_is_deducted() {
        let h = harness(
            FakeStreams {
                deliver: Some(400),
                fail: Some(StreamFailure::new("closed")),
                refund: 150,
                ..Default::default()
            },
            FakePulls::default(),
            FakeRecurring::default(),
        );
        h.negotiator
            .charge_for_duration(&request(None, Some("tok"), None), HASH)
            .await
            .unwrap_err();

        assert_eq!(h.ledger.total(&asset()), 250);
    }

    #[tokio::test]
    async fn test_stream_open_failure_carries_credentials() {
        let creds = StreamCredentials {
            destination_account: "g.host.retry".into(),
            shared_secret: "YWJj".into(),
        };
        let h = harness(
            FakeStreams {
                open_error: Some(StreamFailure::new("no connection").with_credentials(creds.clone())),
                ..Default::default()
            },
            FakePulls::default(),
            FakeRecurring::default(),
        );
        let c = challenge(
            h.negotiator
                .charge_for_duration(&request(None, Some("tok"), None), HASH)
                .await
                .unwrap_err(),
        );

        assert_eq!(c.stream_credentials, Some(creds));
        assert_eq!(h.ledger.total(&asset()), 0);
    }

    #[tokio::test]
    async fn test_one_off_pull_success() {
        let h = harness(FakeStreams::default(), FakePulls::default(), FakeRecurring::default());
        let duration = h
            .negotiator
            .charge_for_duration(&request(Some("interledger-pull"), Some("$wallet.example/alice"), Some(60)), HASH)
            .await
            .unwrap();

        assert_eq!(duration, 60);
        assert_eq!(
            h.pulls.calls.lock().as_slice(),
            [("$wallet.example/alice".to_string(), 120)]
        );
        assert_eq!(h.ledger.total(&asset()), 120);
    }

    #[tokio::test]
    async fn test_one_off_pull_partial_is_credited() {
        let h = harness(
            FakeStreams::default(),
            FakePulls {
                outcome: Some(Err(PullFailure::new("insufficient funds", 50))),
                ..Default::default()
            },
            FakeRecurring::default(),
        );
        let c = challenge(
            h.negotiator
                .charge_for_duration(&request(Some("interledger-pull"), Some("$p"), Some(60)), HASH)
                .await
                .unwrap_err(),
        );

        assert_eq!(c.method, PaymentMethod::Pull);
        assert_eq!(c.pull_interval_secs, None);
        assert_eq!(h.ledger.total(&asset()), 50);
    }

    #[tokio::test]
    async fn test_pull_without_pointer_is_challenged() {
        let h = harness(FakeStreams::default(), FakePulls::default(), FakeRecurring::default());
        let c = challenge(
            h.negotiator
                .charge_for_duration(&request(Some("interledger-pull"), None, Some(60)), HASH)
                .await
                .unwrap_err(),
        );

        assert_eq!(c.method, PaymentMethod::Pull);
        assert!(h.pulls.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_pull_starts_subscription() {
        let h = harness(FakeStreams::default(), FakePulls::default(), FakeRecurring::default());
        let duration = h
            .negotiator
            .charge_for_duration(&request(Some("interledger-pull"), Some("$p"), None), HASH)
            .await
            .unwrap();

        assert_eq!(duration, 300);
        let started = h.recurring.started.lock();
        assert_eq!(started.len(), 1);
        let (hash, pull) = &started[0];
        assert_eq!(hash, HASH);
        assert_eq!(pull.amount, 600);
        assert_eq!(pull.interval, Duration::from_secs(300));
        assert_eq!(pull.timeout, Duration::from_secs(30));
        assert_eq!(h.ledger.total(&asset()), 600);
    }

    #[tokio::test]
    async fn test_recurring_pull_failure_carries_interval() {
        let h = harness(
            FakeStreams::default(),
            FakePulls::default(),
            FakeRecurring {
                outcome: Some(Err(PullFailure::new("declined", 0))),
                ..Default::default()
            },
        );
        let c = challenge(
            h.negotiator
                .charge_for_duration(&request(Some("interledger-pull"), Some("$p"), None), HASH)
                .await
                .unwrap_err(),
        );

        let sent = c.headers();
        assert!(sent.contains(&(headers::PULL_INTERVAL, "300".to_string())));
        assert!(sent.contains(&(headers::PULL_PRICE, "600".to_string())));
        assert_eq!(h.ledger.total(&asset()), 0);
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_fail_charge() {
        let negotiator = ChargeNegotiator::new(
            ChargePolicy::default(),
            asset(),
            Arc::new(FixedRateFeed::new(dec!(2))),
            Arc::new(BrokenLedger),
            Arc::new(FakeStreams {
                deliver: Some(1200),
                ..Default::default()
            }),
            Arc::new(FakePulls::default()),
            Arc::new(FakeRecurring::default()),
        );

        let duration = negotiator
            .charge_for_duration(&request(None, Some("tok"), None), HASH)
            .await
            .unwrap();
        assert_eq!(duration, 600);
    }

    #[tokio::test]
    async fn test_negative_rate_is_pricing_error() {
        let negotiator = ChargeNegotiator::new(
            ChargePolicy::default(),
            asset(),
            Arc::new(FixedRateFeed::new(dec!(-1))),
            Arc::new(InMemoryProfitLedger::new()),
            Arc::new(FakeStreams::default()),
            Arc::new(FakePulls::default()),
            Arc::new(FakeRecurring::default()),
        );

        let err = negotiator
            .charge_for_duration(&request(None, Some("tok"), None), HASH)
            .await
            .unwrap_err();
        assert!(matches!(err, ChargeError::Pricing(_)));
    }
}
