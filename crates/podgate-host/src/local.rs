//! Local pod manager
//!
//! Development stand-in for a container runtime. Pods are registered at a
//! fixed host address on the port their manifest names; nothing is actually
//! executed. Each pod keeps a lifecycle log that can be followed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use podgate_common::{
    LogStream, PodManager, PodManagerError, PodRecord, PodRegistry, PodSpec, StartOutcome,
    StoreError,
};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Port used when a manifest does not name one
pub const DEFAULT_POD_PORT: u16 = 8080;

const LOG_CHANNEL_CAPACITY: usize = 64;

struct PodLog {
    lines: Vec<String>,
    live: broadcast::Sender<String>,
}

impl PodLog {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            lines: Vec::new(),
            live,
        }
    }

    fn push(&mut self, line: String) {
        // no subscribers is fine
        let _ = self.live.send(line.clone());
        self.lines.push(line);
    }
}

/// In-process pod manager
pub struct LocalPodManager {
    registry: Arc<dyn PodRegistry>,
    host: IpAddr,
    logs: DashMap<String, PodLog>,
}

impl LocalPodManager {
    pub fn new(registry: Arc<dyn PodRegistry>, host: IpAddr) -> Self {
        Self {
            registry,
            host,
            logs: DashMap::new(),
        }
    }

    fn log(&self, id: &str, message: String) {
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
        self.logs
            .entry(id.to_string())
            .or_insert_with(PodLog::new)
            .push(line);
    }

    async fn extend(&self, id: &str, extra: Duration) -> Result<StartOutcome, PodManagerError> {
        let pod = self
            .registry
            .add_duration(id, extra)
            .await?
            .ok_or_else(|| PodManagerError::NotFound(id.to_string()))?;
        self.log(id, format!("pod extended. expiry={}", pod.expiry.to_rfc3339()));
        Ok(StartOutcome::Extended)
    }
}

#[async_trait]
impl PodManager for LocalPodManager {
    async fn start_pod(&self, spec: &PodSpec, duration_secs: u64) -> Result<StartOutcome, PodManagerError> {
        let id = spec.id.as_str();
        let lifetime = i64::try_from(duration_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| PodManagerError::Start(format!("duration out of range: {}s", duration_secs)))?;

        if self.registry.get(id).await?.is_some() {
            return self.extend(id, lifetime).await;
        }

        let record = PodRecord {
            id: id.to_string(),
            ip: self.host,
            port: spec.port.unwrap_or(DEFAULT_POD_PORT),
            expiry: Utc::now()
                .checked_add_signed(lifetime)
                .ok_or_else(|| PodManagerError::Start("expiry out of range".into()))?,
            memory_mib: spec.memory_mib,
        };
        let (port, expiry) = (record.port, record.expiry);

        match self.registry.insert(record).await {
            Ok(()) => {
                info!(manifest_hash = id, port, %expiry, "pod started");
                self.log(
                    id,
                    format!(
                        "pod started. memory={}MiB port={} expiry={}",
                        spec.memory_mib,
                        port,
                        expiry.to_rfc3339()
                    ),
                );
                Ok(StartOutcome::Started)
            }
            // lost a race with a concurrent start of the same manifest
            Err(StoreError::Conflict(_)) => self.extend(id, lifetime).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn log_stream(&self, id: &str, follow: bool) -> Result<LogStream, PodManagerError> {
        let (history, live) = {
            let log = self
                .logs
                .get(id)
                .ok_or_else(|| PodManagerError::NotFound(id.to_string()))?;
            (log.lines.clone(), follow.then(|| log.live.subscribe()))
        };

        let history = stream::iter(
            history
                .into_iter()
                .map(|line| Ok::<_, std::io::Error>(Bytes::from(line))),
        );
        let Some(rx) = live else {
            return Ok(history.boxed());
        };

        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(line) => return Some((Ok::<_, std::io::Error>(Bytes::from(line)), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(history.chain(live).boxed())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<PodRecord>, PodManagerError> {
        let ids: Vec<String> = self.logs.iter().map(|entry| entry.key().clone()).collect();
        let mut reaped = Vec::new();

        for id in ids {
            match self.registry.get(&id).await? {
                Some(pod) if pod.expiry <= now => {
                    if let Some(pod) = self.registry.remove(&id).await? {
                        info!(manifest_hash = %id, "pod expired");
                        reaped.push(pod);
                    }
                    // dropping the sender ends any follower
                    self.logs.remove(&id);
                }
                Some(_) => {}
                None => {
                    self.logs.remove(&id);
                }
            }
        }
        Ok(reaped)
    }
}
