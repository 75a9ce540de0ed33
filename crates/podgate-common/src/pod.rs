//! Pods - specs, live records and lifecycle collaborators

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::error::{StoreError, StoreResult};
use crate::label::PodLabel;

/// Provisioning request derived from a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Manifest hash
    pub id: PodLabel,
    /// Memory requirement in MiB
    pub memory_mib: u64,
    /// Port the pod listens on
    pub port: Option<u16>,
    /// Whether the manifest allows debug log access
    pub debug: bool,
    /// Private variables supplied alongside the manifest
    pub private: serde_json::Map<String, serde_json::Value>,
}

/// Live registry view of a running pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub expiry: DateTime<Utc>,
    pub memory_mib: u64,
}

impl PodRecord {
    /// Backend address traffic for this pod is forwarded to
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Pod registry
///
/// Expiry has more than one writer (direct extension and recurring
/// payments), so implementations must apply [`PodRegistry::add_duration`]
/// atomically rather than as a read followed by a write.
#[async_trait]
pub trait PodRegistry: Send + Sync {
    /// Look up a pod by label
    async fn get(&self, id: &str) -> StoreResult<Option<PodRecord>>;

    /// Register a new pod. Fails with [`StoreError::Conflict`] if the id is taken.
    async fn insert(&self, record: PodRecord) -> StoreResult<()>;

    /// Remove a pod, returning its last record
    async fn remove(&self, id: &str) -> StoreResult<Option<PodRecord>>;

    /// Push the expiry of `id` back by `extra`. Returns the updated record,
    /// or `None` when no such pod is registered.
    async fn add_duration(&self, id: &str, extra: Duration) -> StoreResult<Option<PodRecord>>;
}

/// In-memory pod registry
#[derive(Default)]
pub struct InMemoryPodRegistry {
    pods: DashMap<String, PodRecord>,
}

impl InMemoryPodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// True if no pods are registered
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

#[async_trait]
impl PodRegistry for InMemoryPodRegistry {
    async fn get(&self, id: &str) -> StoreResult<Option<PodRecord>> {
        Ok(self.pods.get(id).map(|p| p.clone()))
    }

    async fn insert(&self, record: PodRecord) -> StoreResult<()> {
        match self.pods.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "pod already registered. id={}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn remove(&self, id: &str) -> StoreResult<Option<PodRecord>> {
        Ok(self.pods.remove(id).map(|(_, p)| p))
    }

    async fn add_duration(&self, id: &str, extra: Duration) -> StoreResult<Option<PodRecord>> {
        // get_mut holds the shard lock for the whole update
        let Some(mut pod) = self.pods.get_mut(id) else {
            return Ok(None);
        };
        pod.expiry = pod
            .expiry
            .checked_add_signed(extra)
            .ok_or_else(|| StoreError::Storage(format!("expiry overflow. id={}", id)))?;
        Ok(Some(pod.clone()))
    }
}

/// Result of asking the pod manager to run a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new pod was started
    Started,
    /// The pod was already running; its lifetime was extended instead
    Extended,
}

/// Pod lifecycle errors
#[derive(Debug, Error)]
pub enum PodManagerError {
    #[error("pod not found: {0}")]
    NotFound(String),
    #[error("pod start failed: {0}")]
    Start(String),
    #[error("log stream unavailable: {0}")]
    Logs(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw pod log output
pub type LogStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Pod lifecycle collaborator (container runtime)
#[async_trait]
pub trait PodManager: Send + Sync {
    /// Run `spec` for `duration_secs`, registering it with the pod registry
    async fn start_pod(
        &self,
        spec: &PodSpec,
        duration_secs: u64,
    ) -> Result<StartOutcome, PodManagerError>;

    /// Stream the pod's log output, optionally following new output
    async fn log_stream(&self, id: &str, follow: bool) -> Result<LogStream, PodManagerError>;

    /// Stop pods whose expiry is at or before `now` and remove them from the
    /// registry. Returns their final records.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<PodRecord>, PodManagerError>;
}
