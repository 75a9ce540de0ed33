//! podgate Common - Shared pod domain types
//!
//! This crate provides the vocabulary every other podgate crate speaks:
//! - Pod labels (52-character manifest hashes)
//! - Pod specs and live pod records
//! - Manifests, manifest hashing and manifest storage
//! - Collaborator traits for the pod registry and pod lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         podgate-common                          │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  PodLabel    │  │   PodSpec    │  │  Manifest / Parser   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │   Collaborators: PodRegistry | ManifestStore | PodManager │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry and manifest store are owned by the embedding host; the
//! in-memory implementations here back tests and the development binary.

pub mod error;
pub mod label;
pub mod manifest;
pub mod pod;

pub use error::{StoreError, StoreResult};
pub use label::{is_label, LabelError, PodLabel, LABEL_LEN};
pub use manifest::{
    HashingManifestParser, InMemoryManifestStore, Manifest, ManifestError, ManifestParser,
    ManifestStore,
};
pub use pod::{
    InMemoryPodRegistry, LogStream, PodManager, PodManagerError, PodRecord, PodRegistry, PodSpec,
    StartOutcome,
};
