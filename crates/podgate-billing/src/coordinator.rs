//! Recurring Pull Coordinator
//!
//! Turns subscription cycles into pod lifetime. A cycle that collected half
//! its amount buys half an interval.

use podgate_common::{PodRecord, PodRegistry};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ledger::{credit_profit, ProfitLedger};
use crate::pricing::SettlementAsset;
use crate::recurring::{PullEvent, PullEvents, RecurringPull, RecurringPullEngine};

/// Extension bought by `total_received` of a cycle, truncated to
/// milliseconds. `None` for zero-amount subscriptions or out-of-range results.
pub fn adjusted_duration(total_received: u64, subscription: &RecurringPull) -> Option<chrono::Duration> {
    if subscription.amount == 0 {
        return None;
    }
    let interval_ms = u64::try_from(subscription.interval.as_millis()).ok()?;

    let ms = Decimal::from(total_received)
        .checked_mul(Decimal::from(interval_ms))?
        .checked_div(Decimal::from(subscription.amount))?
        .trunc()
        .to_i64()?;
    Some(chrono::Duration::milliseconds(ms))
}

/// Applies [`PullEvent`]s to the ledger and the pod registry.
/// Subscriptions whose pod is gone are stopped on `engine`.
pub struct RecurringPullCoordinator {
    ledger: Arc<dyn ProfitLedger>,
    registry: Arc<dyn PodRegistry>,
    engine: Arc<dyn RecurringPullEngine>,
    asset: SettlementAsset,
}

impl RecurringPullCoordinator {
    pub fn new(
        ledger: Arc<dyn ProfitLedger>,
        registry: Arc<dyn PodRegistry>,
        engine: Arc<dyn RecurringPullEngine>,
        asset: SettlementAsset,
    ) -> Self {
        Self {
            ledger,
            registry,
            engine,
            asset,
        }
    }

    /// Credit one cycle and extend the pod. Returns the updated record.
    pub async fn handle(&self, event: &PullEvent) -> Option<PodRecord> {
        let hash = event.manifest_hash.as_str();
        credit_profit(self.ledger.as_ref(), &self.asset, event.total_received, hash).await;

        let Some(extra) = adjusted_duration(event.total_received, &event.subscription) else {
            warn!(
                manifest_hash = hash,
                received = event.total_received,
                amount = event.subscription.amount,
                "no extension for pull cycle"
            );
            return None;
        };

        match self.registry.add_duration(hash, extra).await {
            Ok(Some(pod)) => {
                info!(
                    manifest_hash = hash,
                    received = event.total_received,
                    extension_ms = extra.num_milliseconds(),
                    expiry = %pod.expiry,
                    "pod extended by recurring pull"
                );
                Some(pod)
            }
            Ok(None) => {
                let stopped = self.engine.stop(hash);
                warn!(manifest_hash = hash, stopped, "recurring pull for unregistered pod");
                None
            }
            Err(e) => {
                error!(manifest_hash = hash, error = %e, "failed to extend pod");
                None
            }
        }
    }

    /// Consume events until every sender is gone
    pub fn spawn(self, mut events: PullEvents) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(&event).await;
            }
            info!("pull event channel closed");
        })
    }
}
