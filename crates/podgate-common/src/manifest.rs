//! Manifests
//!
//! Manifest schema validation lives outside this layer. What is read here is
//! the handful of fields provisioning and admission need, plus the content
//! hash that becomes the pod label.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::error::StoreResult;
use crate::label::PodLabel;
use crate::pod::PodSpec;

/// Memory granted to a pod whose manifest does not ask for any (MiB)
pub const DEFAULT_POD_MEMORY_MIB: u64 = 512;

/// Manifest parse errors
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest must be a JSON object")]
    NotAnObject,
    #[error("invalid manifest field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("manifest serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Pod manifest as uploaded by the renter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Whether the renter opted in to debug log access
    pub fn allows_debug(&self) -> bool {
        self.0.get("debug").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Turns manifests into pod specs
pub trait ManifestParser: Send + Sync {
    fn to_pod_spec(&self, manifest: &Manifest, private: &Value) -> Result<PodSpec, ManifestError>;
}

/// Parser that labels pods by the SHA-256 of their canonical manifest
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingManifestParser;

impl HashingManifestParser {
    /// Content hash label of a manifest
    pub fn hash(manifest: &Manifest) -> Result<PodLabel, ManifestError> {
        let bytes = serde_json::to_vec(&canonical(manifest.as_value()))?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        Ok(PodLabel::from_digest(&digest))
    }
}

impl ManifestParser for HashingManifestParser {
    fn to_pod_spec(&self, manifest: &Manifest, private: &Value) -> Result<PodSpec, ManifestError> {
        let fields = manifest.as_value().as_object().ok_or(ManifestError::NotAnObject)?;

        let memory_mib = match fields.get("resources").and_then(|r| r.get("memory")) {
            None | Some(Value::Null) => DEFAULT_POD_MEMORY_MIB,
            Some(v) => v.as_u64().filter(|m| *m > 0).ok_or_else(|| ManifestError::InvalidField {
                field: "resources.memory",
                reason: format!("expected a positive integer (MiB), got {}", v),
            })?,
        };

        let port = match fields.get("port") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| ManifestError::InvalidField {
                        field: "port",
                        reason: format!("expected a port number, got {}", v),
                    })?,
            ),
        };

        let debug = match fields.get("debug") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(v) => {
                return Err(ManifestError::InvalidField {
                    field: "debug",
                    reason: format!("expected a boolean, got {}", v),
                })
            }
        };

        let private = match private {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(ManifestError::InvalidField {
                    field: "private",
                    reason: format!("expected an object, got {}", other),
                })
            }
        };

        Ok(PodSpec {
            id: Self::hash(manifest)?,
            memory_mib,
            port,
            debug,
            private,
        })
    }
}

/// Copy of `value` with every object's keys in sorted order
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Manifest storage keyed by manifest hash
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn save(&self, hash: &str, manifest: &Manifest) -> StoreResult<()>;

    async fn get(&self, hash: &str) -> StoreResult<Option<Manifest>>;

    /// Delete a manifest. Returns whether one was stored.
    async fn delete(&self, hash: &str) -> StoreResult<bool>;
}

/// In-memory manifest store
#[derive(Default)]
pub struct InMemoryManifestStore {
    manifests: RwLock<HashMap<String, Manifest>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn save(&self, hash: &str, manifest: &Manifest) -> StoreResult<()> {
        self.manifests
            .write()
            .insert(hash.to_string(), manifest.clone());
        Ok(())
    }

    async fn get(&self, hash: &str) -> StoreResult<Option<Manifest>> {
        Ok(self.manifests.read().get(hash).cloned())
    }

    async fn delete(&self, hash: &str) -> StoreResult<bool> {
        Ok(self.manifests.write().remove(hash).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::is_label;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = Manifest::new(json!({ "name": "web", "port": 8080, "resources": { "memory": 128 } }));
        let b = Manifest::new(json!({ "resources": { "memory": 128 }, "port": 8080, "name": "web" }));

        let ha = HashingManifestParser::hash(&a).unwrap();
        let hb = HashingManifestParser::hash(&b).unwrap();
        assert_eq!(ha, hb);
        assert!(is_label(ha.as_str()));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = Manifest::new(json!({ "name": "web" }));
        let b = Manifest::new(json!({ "name": "api" }));
        assert_ne!(
            HashingManifestParser::hash(&a).unwrap(),
            HashingManifestParser::hash(&b).unwrap()
        );
    }

    #[test]
    fn test_pod_spec_fields() {
        let manifest = Manifest::new(json!({
            "name": "web",
            "port": 8080,
            "debug": true,
            "resources": { "memory": 256 }
        }));
        let spec = HashingManifestParser
            .to_pod_spec(&manifest, &json!({ "TOKEN": "s3cret" }))
            .unwrap();

        assert_eq!(spec.memory_mib, 256);
        assert_eq!(spec.port, Some(8080));
        assert!(spec.debug);
        assert_eq!(spec.private["TOKEN"], "s3cret");
    }

    #[test]
    fn test_pod_spec_defaults() {
        let manifest = Manifest::new(json!({ "name": "web" }));
        let spec = HashingManifestParser.to_pod_spec(&manifest, &Value::Null).unwrap();

        assert_eq!(spec.memory_mib, DEFAULT_POD_MEMORY_MIB);
        assert_eq!(spec.port, None);
        assert!(!spec.debug);
        assert!(!manifest.allows_debug());
    }

    #[test]
    fn test_pod_spec_rejects_bad_fields() {
        let parser = HashingManifestParser;
        assert!(matches!(
            parser.to_pod_spec(&Manifest::new(json!([1, 2])), &Value::Null),
            Err(ManifestError::NotAnObject)
        ));
        assert!(matches!(
            parser.to_pod_spec(&Manifest::new(json!({ "port": 70000 })), &Value::Null),
            Err(ManifestError::InvalidField { field: "port", .. })
        ));
        assert!(matches!(
            parser.to_pod_spec(&Manifest::new(json!({ "resources": { "memory": "lots" } })), &Value::Null),
            Err(ManifestError::InvalidField { field: "resources.memory", .. })
        ));
        assert!(matches!(
            parser.to_pod_spec(&Manifest::new(json!({})), &json!("oops")),
            Err(ManifestError::InvalidField { field: "private", .. })
        ));
    }

    #[tokio::test]
    async fn test_manifest_store() {
        let store = InMemoryManifestStore::new();
        let manifest = Manifest::new(json!({ "name": "web" }));

        store.save("hash", &manifest).await.unwrap();
        assert_eq!(store.get("hash").await.unwrap(), Some(manifest));

        assert!(store.delete("hash").await.unwrap());
        assert!(!store.delete("hash").await.unwrap());
        assert!(store.get("hash").await.unwrap().is_none());
    }
}
