//! Recurring pull payments
//!
//! A subscription pulls a fixed amount from the payer once per interval.
//! Every completed cycle is published as a [`PullEvent`] on the channel
//! handed out by [`ScheduledPullEngine::new`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::{PullFailure, PullTransport};

/// Subscription descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringPull {
    /// Payment pointer pulled from
    pub pointer: String,
    /// Amount per cycle, smallest asset units
    pub amount: u64,
    pub interval: Duration,
    /// Per-pull timeout
    pub timeout: Duration,
}

/// Outcome of one subscription cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullEvent {
    pub manifest_hash: String,
    pub subscription: RecurringPull,
    pub total_received: u64,
}

/// Receiving end of the pull event channel
pub type PullEvents = mpsc::UnboundedReceiver<PullEvent>;

/// Recurring pull engine
#[async_trait]
pub trait RecurringPullEngine: Send + Sync {
    /// Collect the first payment and keep collecting once per interval.
    /// Returns the amount collected by the first pull.
    async fn start(&self, manifest_hash: &str, pull: RecurringPull) -> Result<u64, PullFailure>;

    /// Cancel the subscription for `manifest_hash`. Returns whether one was active.
    fn stop(&self, manifest_hash: &str) -> bool;

    fn is_active(&self, manifest_hash: &str) -> bool;
}

struct Subscription {
    id: u64,
    task: JoinHandle<()>,
}

/// Timer-driven engine over a [`PullTransport`]
///
/// At most one subscription is active per manifest hash. Starting a second
/// one supersedes the first once its initial pull has paid.
///
/// Each cycle fires [`cycle_lead`] ahead of the time the previous one paid
/// up to, so a pull that runs into its timeout still lands before expiry.
pub struct ScheduledPullEngine {
    transport: Arc<dyn PullTransport>,
    subscriptions: Arc<DashMap<String, Subscription>>,
    events: mpsc::UnboundedSender<PullEvent>,
    next_id: AtomicU64,
}

impl ScheduledPullEngine {
    pub fn new(transport: Arc<dyn PullTransport>) -> (Self, PullEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            transport,
            subscriptions: Arc::new(DashMap::new()),
            events: tx,
            next_id: AtomicU64::new(1),
        };
        (engine, rx)
    }

    /// Number of active subscriptions
    pub fn active(&self) -> usize {
        self.subscriptions.len()
    }
}

#[async_trait]
impl RecurringPullEngine for ScheduledPullEngine {
    async fn start(&self, manifest_hash: &str, pull: RecurringPull) -> Result<u64, PullFailure> {
        if pull.interval.is_zero() {
            return Err(PullFailure::new("pull interval must be non-zero", 0));
        }

        // a failed restart leaves the running subscription alone
        let received = self
            .transport
            .pull(&pull.pointer, pull.amount, pull.timeout)
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_subscription(
            id,
            manifest_hash.to_string(),
            pull,
            self.transport.clone(),
            self.events.clone(),
            self.subscriptions.clone(),
        ));

        if let Some(old) = self
            .subscriptions
            .insert(manifest_hash.to_string(), Subscription { id, task })
        {
            old.task.abort();
            info!(manifest_hash, "superseding recurring pull");
        }

        Ok(received)
    }

    fn stop(&self, manifest_hash: &str) -> bool {
        match self.subscriptions.remove(manifest_hash) {
            Some((_, sub)) => {
                sub.task.abort();
                info!(manifest_hash, "recurring pull stopped");
                true
            }
            None => false,
        }
    }

    fn is_active(&self, manifest_hash: &str) -> bool {
        self.subscriptions.contains_key(manifest_hash)
    }
}

impl Drop for ScheduledPullEngine {
    fn drop(&mut self) {
        for sub in self.subscriptions.iter() {
            sub.task.abort();
        }
    }
}

/// How far ahead of the paid-up time a cycle starts: one pull timeout,
/// capped at half an interval
pub fn cycle_lead(pull: &RecurringPull) -> Duration {
    pull.timeout.min(pull.interval / 2)
}

async fn run_subscription(
    id: u64,
    manifest_hash: String,
    pull: RecurringPull,
    transport: Arc<dyn PullTransport>,
    events: mpsc::UnboundedSender<PullEvent>,
    subscriptions: Arc<DashMap<String, Subscription>>,
) {
    let first = Instant::now() + pull.interval - cycle_lead(&pull);
    let mut ticker = interval_at(first, pull.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let total_received = match transport.pull(&pull.pointer, pull.amount, pull.timeout).await {
            Ok(received) => {
                debug!(manifest_hash = %manifest_hash, received, "recurring pull paid");
                received
            }
            Err(failure) => {
                warn!(
                    manifest_hash = %manifest_hash,
                    received = failure.total_received,
                    reason = %failure.reason,
                    "recurring pull failed"
                );
                failure.total_received
            }
        };

        let event = PullEvent {
            manifest_hash: manifest_hash.clone(),
            subscription: pull.clone(),
            total_received,
        };
        if events.send(event).is_err() {
            debug!(manifest_hash = %manifest_hash, "pull event receiver closed");
            break;
        }

        if total_received == 0 {
            info!(manifest_hash = %manifest_hash, "recurring pull collected nothing, ending subscription");
            break;
        }
    }

    subscriptions.remove_if(&manifest_hash, |_, sub| sub.id == id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Returns scripted outcomes in order, then full payment
    #[derive(Default)]
    struct ScriptedPulls {
        script: Mutex<VecDeque<Result<u64, PullFailure>>>,
    }

    impl ScriptedPulls {
        fn with(outcomes: Vec<Result<u64, PullFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl PullTransport for ScriptedPulls {
        async fn pull(&self, _pointer: &str, amount: u64, _timeout: Duration) -> Result<u64, PullFailure> {
            self.script.lock().pop_front().unwrap_or(Ok(amount))
        }
    }

    fn subscription(interval_secs: u64) -> RecurringPull {
        RecurringPull {
            pointer: "$wallet.example/alice".into(),
            amount: 100,
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_publish_events() {
        let (engine, mut events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![
            Ok(100),
            Ok(100),
            Err(PullFailure::new("partial", 40)),
        ]));

        assert_eq!(engine.start("hash", subscription(60)).await.unwrap(), 100);
        assert!(engine.is_active("hash"));

        let first = events.recv().await.unwrap();
        assert_eq!(first.manifest_hash, "hash");
        assert_eq!(first.total_received, 100);
        assert_eq!(first.subscription, subscription(60));

        let second = events.recv().await.unwrap();
        assert_eq!(second.total_received, 40);

        assert!(engine.stop("hash"));
        assert!(!engine.is_active("hash"));
    }

    #[tokio::test]
    async fn test_first_pull_failure_starts_nothing() {
        let (engine, _events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![Err(
            PullFailure::new("declined", 10),
        )]));

        let failure = engine.start("hash", subscription(60)).await.unwrap_err();
        assert_eq!(failure.total_received, 10);
        assert!(!engine.is_active("hash"));
        assert_eq!(engine.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cycle_ends_subscription() {
        let (engine, mut events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![
            Ok(100),
            Err(PullFailure::new("wallet empty", 0)),
        ]));

        engine.start("hash", subscription(60)).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.total_received, 0);

        for _ in 0..10 {
            if !engine.is_active("hash") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!engine.is_active("hash"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_supersedes() {
        let (engine, mut events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![]));

        engine.start("hash", subscription(60)).await.unwrap();
        let mut replacement = subscription(60);
        replacement.amount = 250;
        engine.start("hash", replacement.clone()).await.unwrap();
        assert_eq!(engine.active(), 1);

        // only the replacement keeps pulling
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.subscription, replacement);
            assert_eq!(event.total_received, 250);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_keeps_subscription() {
        let (engine, mut events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![
            Ok(100),
            Err(PullFailure::new("declined", 0)),
        ]));

        engine.start("hash", subscription(60)).await.unwrap();
        let mut replacement = subscription(60);
        replacement.amount = 250;
        assert!(engine.start("hash", replacement).await.is_err());

        assert!(engine.is_active("hash"));
        assert_eq!(engine.active(), 1);
        let event = events.recv().await.unwrap();
        assert_eq!(event.subscription, subscription(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_run_ahead_of_expiry() {
        let (engine, mut events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![]));
        let started = Instant::now();

        engine.start("hash", subscription(60)).await.unwrap();

        // five seconds, one pull timeout, before the first interval is used up
        events.recv().await.unwrap();
        let first = started.elapsed();
        assert!(first >= Duration::from_secs(55) && first < Duration::from_secs(56));

        events.recv().await.unwrap();
        let second = started.elapsed();
        assert!(second >= Duration::from_secs(115) && second < Duration::from_secs(116));
    }

    #[test]
    fn test_cycle_lead() {
        assert_eq!(cycle_lead(&subscription(60)), Duration::from_secs(5));
        // timeouts longer than the interval still leave half of it
        let mut short = subscription(6);
        short.timeout = Duration::from_secs(30);
        assert_eq!(cycle_lead(&short), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (engine, _events) = ScheduledPullEngine::new(ScriptedPulls::with(vec![]));
        assert!(engine.start("hash", subscription(0)).await.is_err());
        assert_eq!(engine.active(), 0);
    }
}
