//! Pod routes
//!
//! `POST /pods` admits, charges and starts a pod. `PUT /pods` charges for
//! more time on a running pod. `GET /pods` describes one, and
//! `GET /pods/:id/logs` streams its debug log.

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use podgate_billing::{select_flow, ChargeRequest, Flow};
use podgate_common::{Manifest, PodRecord, PodSpec, StartOutcome};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::admission::MemoryReservation;
use crate::context::{PaymentContext, PodQuery};
use crate::error::ApiError;
use crate::AppState;

/// Content type of pod log streams. Never compressed.
pub const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.podgate.raw-stream";

/// `POST /pods` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRequest {
    pub manifest: Manifest,
    /// Private variables handed to the pod, never stored with the manifest
    #[serde(default)]
    pub private: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResponse {
    pub url: String,
    pub manifest_hash: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfoResponse {
    #[serde(flatten)]
    pub pod: PodResponse,
    pub manifest: Option<Manifest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub follow: Option<String>,
}

/// Public URL of a pod: `base` with the manifest hash prepended to its host
pub fn pod_url(base: &Url, manifest_hash: &str) -> Result<String, ApiError> {
    let host = base
        .host_str()
        .ok_or_else(|| ApiError::Internal("public uri has no host".into()))?;
    let mut url = base.clone();
    url.set_host(Some(&format!("{}.{}", manifest_hash, host)))
        .map_err(|e| ApiError::Internal(format!("cannot build pod url. manifestHash={}: {}", manifest_hash, e)))?;
    Ok(url.to_string())
}

fn pod_response(state: &AppState, pod: &PodRecord) -> Result<PodResponse, ApiError> {
    Ok(PodResponse {
        url: pod_url(&state.public_url, &pod.id)?,
        manifest_hash: pod.id.clone(),
        expiry: pod.expiry,
    })
}

/// Run the charge on its own task. A client disconnect drops the handler
/// future, but the negotiation still finishes and credits what was received.
async fn charge(state: &AppState, request: &ChargeRequest, manifest_hash: &str) -> Result<u64, ApiError> {
    let negotiator = state.negotiator.clone();
    let request = request.clone();
    let hash = manifest_hash.to_string();

    tokio::spawn(async move { negotiator.charge_for_duration(&request, &hash).await })
        .await
        .map_err(|e| ApiError::Internal(format!("charge task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// Start or extend the pod and store its manifest once payment is in
async fn provision(
    state: &AppState,
    spec: &PodSpec,
    manifest: &Manifest,
    reservation: MemoryReservation,
    duration_secs: u64,
) -> Result<PodRecord, ApiError> {
    let hash = spec.id.as_str();
    match state.pods.start_pod(spec, duration_secs).await? {
        StartOutcome::Started => reservation.commit(),
        // the running pod already holds its memory
        StartOutcome::Extended => drop(reservation),
    }
    state.manifests.save(hash, manifest).await?;

    state
        .registry
        .get(hash)
        .await?
        .ok_or_else(|| ApiError::Unavailable(format!("pod has stopped. manifestHash={}", hash)))
}

/// Stop the subscription a recurring charge started for a request that
/// failed afterwards
fn cancel_recurring(state: &AppState, request: &ChargeRequest, manifest_hash: &str, err: ApiError) -> ApiError {
    let recurring = matches!(
        select_flow(request, state.negotiator.policy()),
        Flow::RecurringPull { .. }
    );
    if recurring && state.recurring.stop(manifest_hash) {
        warn!(manifest_hash, error = %err, "stopped recurring pull of failed pod request");
    }
    err
}

/// Create a pod, or extend it if the same manifest is already running
pub async fn create(
    State(state): State<Arc<AppState>>,
    ctx: PaymentContext,
    payload: Result<Json<PodRequest>, JsonRejection>,
) -> Result<Json<PodResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| {
        debug!(error = %e, "rejected pod request body");
        ApiError::BadInput("Invalid request payload input".into())
    })?;

    let spec = state.parser.to_pod_spec(&request.manifest, &request.private)?;
    let hash = spec.id.as_str();

    let reservation = state.gate.try_reserve(spec.memory_mib).ok_or_else(|| {
        warn!(
            manifest_hash = hash,
            memory_mib = spec.memory_mib,
            used_mib = state.gate.used_mib(),
            "memory limit reached"
        );
        ApiError::ResourceExhausted("Memory usage exceeded. Send pod request later.".into())
    })?;

    // an unpaid request drops the reservation on the way out
    let duration_secs = charge(&state, &ctx.charge, hash).await?;

    let pod = provision(&state, &spec, &request.manifest, reservation, duration_secs)
        .await
        .map_err(|e| cancel_recurring(&state, &ctx.charge, hash, e))?;

    info!(manifest_hash = hash, duration_secs, expiry = %pod.expiry, "pod created");
    Ok(Json(pod_response(&state, &pod)?))
}

/// Pay for more time on a running pod
pub async fn extend(
    State(state): State<Arc<AppState>>,
    ctx: PaymentContext,
) -> Result<Json<PodResponse>, ApiError> {
    let hash = ctx.require_manifest_hash()?;
    ctx.require_duration()?;

    let duration_secs = charge(&state, &ctx.charge, hash).await?;
    let extra = i64::try_from(duration_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ApiError::BadInput(format!("duration out of range: {}", duration_secs)))?;

    let pod = state
        .registry
        .add_duration(hash, extra)
        .await?
        .ok_or_else(|| ApiError::Unavailable(format!("pod not found. manifestHash={}", hash)))?;

    info!(manifest_hash = hash, duration_secs, expiry = %pod.expiry, "pod extended");
    Ok(Json(pod_response(&state, &pod)?))
}

/// Describe a pod and its manifest
pub async fn info(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PodQuery>, QueryRejection>,
) -> Result<Json<PodInfoResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadInput(format!("invalid query: {}", e)))?;
    let hash = query.require_manifest_hash()?;

    let manifest = state.manifests.get(hash).await?;
    let Some(pod) = state.registry.get(hash).await? else {
        if state.manifests.delete(hash).await? {
            info!(manifest_hash = hash, "removed manifest of stopped pod");
        }
        return Err(ApiError::Unavailable(format!("pod not found. manifestHash={}", hash)));
    };

    Ok(Json(PodInfoResponse {
        pod: pod_response(&state, &pod)?,
        manifest,
    }))
}

/// Stream a pod's log. Only manifests with `debug: true` allow this.
pub async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let follow = query.follow.as_deref() == Some("true");

    if state.registry.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("no pod found with this id. id={}", id)));
    }
    let manifest = state
        .manifests
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no manifest found for this pod. id={}", id)))?;
    if !manifest.allows_debug() {
        return Err(ApiError::Forbidden(format!(
            "pod manifest does not allow debugging. id={}",
            id
        )));
    }

    let stream = state.pods.log_stream(&id, follow).await?;
    debug!(id = %id, follow, "streaming pod log");

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(RAW_STREAM_CONTENT_TYPE)),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
