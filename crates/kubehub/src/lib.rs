//! Magnitude kubehub: the cluster API boundary and the watchers that mirror it.
//!
//! [`ClusterApi`] is the only way the engine talks to a cluster. [`KubeCluster`]
//! implements it with kube-rs against a live API server; [`MemoryCluster`] is an
//! authoritative in-memory cluster used by tests and offline runs.

#![forbid(unsafe_code)]

mod backoff;
mod kube_cluster;
mod memory;
pub mod watcher;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use magnitude_core::{ConcurrencyToken, Document, KindScope, ResourceIdentity, ResourceRecord};

pub use backoff::Backoff;
pub use kube_cluster::KubeCluster;
pub use memory::MemoryCluster;
pub use watcher::{KindWatcher, WatchPhase, WatchStatus, WatcherSet};

/// Failures reported by a cluster API implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Optimistic-concurrency precondition failed or the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Watch token is too old to resume from; the caller must re-list.
    #[error("watch token expired: {0}")]
    Gone(String),
    /// The server rejected the request as invalid.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Transport or server failure; retryable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Result of a list call: every object of a scope plus the token to resume watching from.
#[derive(Debug, Clone)]
pub struct ObjectList {
    pub items: Vec<ResourceRecord>,
    pub token: ConcurrencyToken,
}

/// Typed event delivered by a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(ResourceRecord),
    Modified(ResourceRecord),
    /// Final state of the deleted object, carrying the deletion token.
    Deleted(ResourceRecord),
    /// Progress marker: the stream is consistent up to this token.
    Bookmark(ConcurrencyToken),
    Error(ClusterError),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// A served Kubernetes resource kind (incl. CRDs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// List/watch/get/create/replace/delete per resource kind, each speaking in
/// opaque concurrency tokens.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Served kinds.
    async fn kinds(&self) -> Result<Vec<DiscoveredResource>, ClusterError>;

    async fn list(&self, scope: &KindScope) -> Result<ObjectList, ClusterError>;

    /// Stream changes strictly after `from`. Fails with `Gone` when `from` is too old.
    async fn watch(&self, scope: &KindScope, from: &ConcurrencyToken) -> Result<WatchStream, ClusterError>;

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>, ClusterError>;

    async fn create(&self, doc: Document) -> Result<ResourceRecord, ClusterError>;

    /// Replace an existing object. `metadata.resourceVersion` in `doc` is the
    /// precondition; a mismatch yields `Conflict`.
    async fn replace(&self, doc: Document) -> Result<ResourceRecord, ClusterError>;

    async fn delete(&self, identity: &ResourceIdentity, precondition: Option<&ConcurrencyToken>) -> Result<(), ClusterError>;
}

/// Kinds that are never namespaced; watch scopes for them ignore a namespace filter.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PriorityClass",
    "IngressClass",
];

/// Watch scopes for a configuration: one per kind, narrowed to the configured
/// namespace unless the kind is cluster-scoped.
pub fn scopes_for(cfg: &magnitude_core::EngineConfig) -> Vec<KindScope> {
    cfg.watch_kinds
        .iter()
        .map(|k| {
            let ns = if CLUSTER_SCOPED_KINDS.contains(&k.kind.as_str()) { None } else { cfg.namespace.as_deref() };
            KindScope::new(k.clone(), ns)
        })
        .collect()
}
