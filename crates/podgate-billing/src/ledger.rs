//! Profit Ledger

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error};

use crate::pricing::SettlementAsset;

/// Ledger errors
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Records revenue per settlement asset
#[async_trait]
pub trait ProfitLedger: Send + Sync {
    async fn add_profit(&self, asset: &SettlementAsset, amount: u64) -> Result<(), LedgerError>;
}

/// In-memory ledger
#[derive(Default)]
pub struct InMemoryProfitLedger {
    totals: RwLock<HashMap<SettlementAsset, u128>>,
}

impl InMemoryProfitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total profit recorded for `asset`
    pub fn total(&self, asset: &SettlementAsset) -> u128 {
        self.totals.read().get(asset).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProfitLedger for InMemoryProfitLedger {
    async fn add_profit(&self, asset: &SettlementAsset, amount: u64) -> Result<(), LedgerError> {
        *self.totals.write().entry(asset.clone()).or_insert(0) += u128::from(amount);
        Ok(())
    }
}

/// Credit `amount` to the ledger without failing the caller.
///
/// Zero amounts are skipped. Ledger failures are logged and swallowed.
pub async fn credit_profit(
    ledger: &dyn ProfitLedger,
    asset: &SettlementAsset,
    amount: u64,
    manifest_hash: &str,
) {
    if amount == 0 {
        return;
    }
    match ledger.add_profit(asset, amount).await {
        Ok(()) => debug!(
            manifest_hash,
            amount,
            asset_code = %asset.code,
            "profit recorded"
        ),
        Err(e) => error!(
            manifest_hash,
            amount,
            asset_code = %asset.code,
            error = %e,
            "error adding profit"
        ),
    }
}
