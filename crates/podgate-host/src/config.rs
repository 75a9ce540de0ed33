//! Host configuration
//!
//! Defaults, then an optional config file, then `PODGATE__*` environment
//! variables (nested keys joined with `__`, e.g. `PODGATE__PROXY__MAX_BODY_BYTES`).

use podgate_billing::{ChargePolicy, SettlementAsset};
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Public base URI; pod URLs prepend the manifest hash to its host
    pub public_uri: String,
    pub min_duration_secs: u64,
    pub default_duration_secs: u64,
    pub payment_timeout_secs: u64,
    /// Share of host memory pods may reserve
    pub max_memory_fraction: f64,
    /// Host memory in bytes. Read from the OS when unset.
    pub host_memory_bytes: Option<u64>,
    pub asset_code: String,
    pub asset_scale: u8,
    /// Hosting cost per 30-day month, whole asset units
    pub cost_per_month: Decimal,
    /// Address local pods are reachable on
    pub pod_host: IpAddr,
    pub proxy: ProxyConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000),
            public_uri: "http://localhost:3000".into(),
            min_duration_secs: 300,
            default_duration_secs: 600,
            payment_timeout_secs: 30,
            max_memory_fraction: 0.75,
            host_memory_bytes: None,
            asset_code: "XRP".into(),
            asset_scale: 9,
            cost_per_month: Decimal::from(10),
            pod_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy: ProxyConfig::default(),
        }
    }
}

/// Reverse proxy limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Largest request body forwarded to a pod
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 600,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HostConfig {
    /// Load defaults, `path` (format by extension) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: HostConfig = builder
            .add_source(config::Environment::with_prefix("PODGATE").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.public_url()?;
        if !(self.max_memory_fraction > 0.0 && self.max_memory_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "max_memory_fraction must be in (0, 1], got {}",
                self.max_memory_fraction
            )));
        }
        if self.min_duration_secs == 0 {
            return Err(ConfigError::Invalid("min_duration_secs must be positive".into()));
        }
        if self.cost_per_month.is_sign_negative() {
            return Err(ConfigError::Invalid("cost_per_month must not be negative".into()));
        }
        Ok(())
    }

    /// Parsed `public_uri`
    pub fn public_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.public_uri)
            .map_err(|e| ConfigError::Invalid(format!("public_uri {:?}: {}", self.public_uri, e)))?;
        if url.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "public_uri {:?} has no host",
                self.public_uri
            )));
        }
        Ok(url)
    }

    pub fn charge_policy(&self) -> ChargePolicy {
        ChargePolicy {
            min_duration_secs: self.min_duration_secs,
            default_duration_secs: self.default_duration_secs,
            payment_timeout: Duration::from_secs(self.payment_timeout_secs),
        }
    }

    pub fn asset(&self) -> SettlementAsset {
        SettlementAsset::new(self.asset_code.clone(), self.asset_scale)
    }
}
