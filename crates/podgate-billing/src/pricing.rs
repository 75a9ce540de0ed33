//! Pricing Engine
//!
//! Hosting is sold by the second. A quote is always a whole number of the
//! settlement asset's smallest unit, rounded up.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds in a 30-day billing month
pub const SECONDS_PER_MONTH: u64 = 30 * 24 * 60 * 60;

/// Currency of the local settlement account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementAsset {
    /// Asset code, e.g. `XRP`
    pub code: String,
    /// Decimal places of the smallest unit
    pub scale: u8,
}

impl SettlementAsset {
    pub fn new(code: impl Into<String>, scale: u8) -> Self {
        Self {
            code: code.into(),
            scale,
        }
    }
}

/// Price for a duration of hosting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub duration_secs: u64,
    /// Smallest asset units
    pub amount: u64,
    pub asset_code: String,
    pub asset_scale: u8,
}

/// Pricing errors
#[derive(Debug, Clone, Error)]
pub enum PriceError {
    #[error("negative rate: {0}")]
    NegativeRate(Decimal),
    #[error("price overflow for {duration_secs}s at {rate}/s")]
    Overflow { rate: Decimal, duration_secs: u64 },
    #[error("price feed unavailable: {0}")]
    Feed(String),
}

/// Source of the per-second hosting rate
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Rate in smallest units of `asset` per second of hosting
    async fn rate_per_second(&self, asset: &SettlementAsset) -> Result<Decimal, PriceError>;
}

/// `ceil(rate × duration)` as an integer amount
pub fn price_for(rate: Decimal, duration_secs: u64) -> Result<u64, PriceError> {
    if rate < Decimal::ZERO {
        return Err(PriceError::NegativeRate(rate));
    }
    rate.checked_mul(Decimal::from(duration_secs))
        .map(|total| total.ceil())
        .and_then(|total| total.to_u64())
        .ok_or(PriceError::Overflow {
            rate,
            duration_secs,
        })
}

/// Quote `duration_secs` of hosting at `rate`
pub fn quote(
    rate: Decimal,
    duration_secs: u64,
    asset: &SettlementAsset,
) -> Result<PriceQuote, PriceError> {
    Ok(PriceQuote {
        duration_secs,
        amount: price_for(rate, duration_secs)?,
        asset_code: asset.code.clone(),
        asset_scale: asset.scale,
    })
}

/// Feed returning a constant rate
#[derive(Debug, Clone)]
pub struct FixedRateFeed {
    rate: Decimal,
}

impl FixedRateFeed {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl PriceFeed for FixedRateFeed {
    async fn rate_per_second(&self, _asset: &SettlementAsset) -> Result<Decimal, PriceError> {
        Ok(self.rate)
    }
}

/// Feed derived from a monthly hosting cost in whole asset units
#[derive(Debug, Clone)]
pub struct MonthlyCostFeed {
    cost_per_month: Decimal,
}

impl MonthlyCostFeed {
    pub fn new(cost_per_month: Decimal) -> Self {
        Self { cost_per_month }
    }
}

#[async_trait]
impl PriceFeed for MonthlyCostFeed {
    async fn rate_per_second(&self, asset: &SettlementAsset) -> Result<Decimal, PriceError> {
        let unit = 10i128
            .checked_pow(u32::from(asset.scale))
            .and_then(|u| Decimal::try_from_i128_with_scale(u, 0).ok())
            .ok_or_else(|| PriceError::Feed(format!("unsupported asset scale {}", asset.scale)))?;

        self.cost_per_month
            .checked_mul(unit)
            .and_then(|per_month| per_month.checked_div(Decimal::from(SECONDS_PER_MONTH)))
            .ok_or_else(|| PriceError::Feed("monthly cost out of range".into()))
    }
}
