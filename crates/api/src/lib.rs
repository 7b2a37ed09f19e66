//! Magnitude public API façade (in-process).
//!
//! This crate defines the stable traits and types frontends (CLI/UI) depend on.
//! [`Engine`] is the in-process implementation: it owns the resource cache, the
//! per-kind watchers, the mutation coordinator and the graph builder.

#![forbid(unsafe_code)]

pub mod registry;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use arc_swap::ArcSwapOption;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use magnitude_apply::{ApplyOptions, DiffSummary, MutationCoordinator};
use magnitude_core::{ConcurrencyToken, EditProposal, EngineConfig, ResourceIdentity, ResourceRecord, SyncError};
use magnitude_graph::{Graph, GraphBuilder};
use magnitude_kubehub::{scopes_for, ClusterApi, KubeCluster, WatchStatus, WatcherSet};
use magnitude_store::{CacheChange, ResourceCache};

pub use registry::{ImageSummary, Page, RegistryApi, Repository, StaticRegistry};

/// A served Kubernetes resource kind (incl. CRDs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl From<magnitude_kubehub::DiscoveredResource> for ResourceKind {
    fn from(v: magnitude_kubehub::DiscoveredResource) -> Self {
        Self { group: v.group, version: v.version, kind: v.kind, namespaced: v.namespaced }
    }
}

/// Canonical YAML of one cached resource plus the token an edit of it must carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceYaml {
    pub identity: ResourceIdentity,
    pub token: ConcurrencyToken,
    pub yaml: String,
}

/// Result of an edit proposal. User-correctable failures are outcomes, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum ProposeOutcome {
    Success(Arc<ResourceRecord>),
    /// The base token was stale; carries the current state to re-diff against.
    Conflict(Arc<ResourceRecord>),
    Malformed(String),
    NotFound(ResourceIdentity),
}

/// Change notification for UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineEvent {
    /// `token` is `None` when the resource was removed.
    Changed { identity: ResourceIdentity, token: Option<ConcurrencyToken>, epoch: u64 },
    /// Events were dropped; re-read the graph at or after `epoch`.
    Resync { epoch: u64 },
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("cancelled")]
    Cancelled,
    #[error("indeterminate: {0}")]
    Indeterminate(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::MalformedDocument(m) => ApiError::Validation(m),
            SyncError::ResourceNotFound(id) => ApiError::NotFound(id.to_string()),
            e @ SyncError::EditConflict { .. } => ApiError::Conflict(e.to_string()),
            SyncError::ClusterUnavailable(m) => ApiError::Unavailable(m),
            SyncError::Cancelled => ApiError::Cancelled,
            SyncError::Indeterminate(id) => ApiError::Indeterminate(id.to_string()),
        }
    }
}

/// Presentation-facing surface of the engine.
#[async_trait::async_trait]
pub trait MagnitudeApi: Send + Sync {
    /// Kinds served by the cluster.
    async fn kinds(&self) -> ApiResult<Vec<ResourceKind>>;

    /// Graph of the current cache snapshot.
    async fn get_graph(&self) -> ApiResult<Arc<Graph>>;

    /// Subgraph within `depth` hops of `identity`.
    async fn neighbourhood(&self, identity: &ResourceIdentity, depth: usize) -> ApiResult<Graph>;

    /// Canonical YAML of a cached resource. Without status, server-managed
    /// fields are stripped so the text is ready to edit.
    async fn get_resource_yaml(&self, identity: &ResourceIdentity, include_status: bool) -> ApiResult<ResourceYaml>;

    /// Apply an edited document. `base_token = None` creates.
    async fn propose_edit(
        &self,
        identity: &ResourceIdentity,
        yaml: &str,
        base_token: Option<ConcurrencyToken>,
    ) -> ApiResult<ProposeOutcome>;

    /// Check an edit and summarize its changes without writing anything.
    async fn preview_edit(
        &self,
        identity: &ResourceIdentity,
        yaml: &str,
        base_token: Option<ConcurrencyToken>,
    ) -> ApiResult<DiffSummary>;

    async fn delete_resource(&self, identity: &ResourceIdentity, base_token: Option<ConcurrencyToken>) -> ApiResult<()>;

    /// Per-kind watcher health.
    async fn watch_status(&self) -> ApiResult<Vec<WatchStatus>>;

    /// Stream cache changes until the handle is cancelled or dropped.
    async fn subscribe(&self) -> ApiResult<StreamHandle<EngineEvent>>;
}

// ----------------- In-process implementation -----------------

/// In-process engine: watchers feed the cache, edits go through the coordinator,
/// graphs are built from cache snapshots on demand.
pub struct Engine {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<ResourceCache>,
    coordinator: MutationCoordinator,
    builder: GraphBuilder,
    cfg: EngineConfig,
    statuses: Vec<watch::Receiver<WatchStatus>>,
    watchers: Mutex<Option<WatcherSet>>,
    last_graph: ArcSwapOption<Graph>,
}

impl Engine {
    /// Start watching every configured kind against `cluster`. Must be called
    /// from within a tokio runtime.
    pub fn start(cluster: Arc<dyn ClusterApi>, cfg: EngineConfig) -> Arc<Self> {
        Self::start_with(cluster, cfg, GraphBuilder::new())
    }

    /// Like [`Engine::start`] with a custom graph builder (extra extractors).
    pub fn start_with(cluster: Arc<dyn ClusterApi>, cfg: EngineConfig, builder: GraphBuilder) -> Arc<Self> {
        let cache = Arc::new(ResourceCache::new(cfg.event_cap));
        let scopes = scopes_for(&cfg);
        info!(kinds = scopes.len(), ns = %cfg.namespace.as_deref().unwrap_or("(all)"), "engine: starting");
        let watchers = WatcherSet::spawn(cluster.clone(), cache.clone(), scopes, &cfg);
        let coordinator = MutationCoordinator::new(cluster.clone(), cache.clone(), &cfg);
        Arc::new(Self {
            cluster,
            cache,
            coordinator,
            builder,
            statuses: watchers.status_receivers(),
            watchers: Mutex::new(Some(watchers)),
            cfg,
            last_graph: ArcSwapOption::empty(),
        })
    }

    /// Connect to the cluster from the ambient kubeconfig and start.
    pub async fn connect(cfg: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let t0 = Instant::now();
        let cluster = KubeCluster::try_default().await.context("building kube client")?.with_watch_timeout(cfg.watch_timeout_secs);
        info!(took_ms = %t0.elapsed().as_millis(), "engine: kube client ready");
        Ok(Self::start(Arc::new(cluster), cfg))
    }

    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    /// Wait until every kind has completed its first list.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        magnitude_kubehub::watcher::wait_synced(self.statuses.clone(), timeout).await
    }

    /// Stop all watchers. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(w) = watchers {
            let t0 = Instant::now();
            w.shutdown().await;
            info!(took_ms = %t0.elapsed().as_millis(), "engine: watchers stopped");
        }
    }

    fn graph(&self) -> Arc<Graph> {
        let snap = self.cache.snapshot();
        if let Some(g) = self.last_graph.load_full() {
            if g.epoch == snap.epoch() {
                return g;
            }
        }
        let g = Arc::new(self.builder.build(&snap));
        self.last_graph.store(Some(g.clone()));
        g
    }

    fn proposal(identity: &ResourceIdentity, yaml: &str, base_token: Option<ConcurrencyToken>) -> EditProposal {
        EditProposal { identity: identity.clone(), proposed_yaml: yaml.to_string(), base_token }
    }
}

#[async_trait::async_trait]
impl MagnitudeApi for Engine {
    async fn kinds(&self) -> ApiResult<Vec<ResourceKind>> {
        let t0 = Instant::now();
        let kinds: Vec<ResourceKind> = self
            .cluster
            .kinds()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?
            .into_iter()
            .map(ResourceKind::from)
            .collect();
        info!(count = kinds.len(), took_ms = %t0.elapsed().as_millis(), "api: kinds ok");
        Ok(kinds)
    }

    async fn get_graph(&self) -> ApiResult<Arc<Graph>> {
        let t0 = Instant::now();
        let g = self.graph();
        info!(epoch = g.epoch, nodes = g.nodes.len(), edges = g.edges.len(), took_ms = %t0.elapsed().as_millis(), "api: graph ok");
        Ok(g)
    }

    async fn neighbourhood(&self, identity: &ResourceIdentity, depth: usize) -> ApiResult<Graph> {
        let g = self.graph();
        if g.node(identity).is_none() {
            return Err(ApiError::NotFound(identity.to_string()));
        }
        Ok(g.neighbourhood(identity, depth))
    }

    async fn get_resource_yaml(&self, identity: &ResourceIdentity, include_status: bool) -> ApiResult<ResourceYaml> {
        let rec = self.cache.get(identity).ok_or_else(|| ApiError::NotFound(identity.to_string()))?;
        let yaml = magnitude_codec::encode_record(&rec, include_status).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(ResourceYaml { identity: identity.clone(), token: rec.token.clone(), yaml })
    }

    async fn propose_edit(
        &self,
        identity: &ResourceIdentity,
        yaml: &str,
        base_token: Option<ConcurrencyToken>,
    ) -> ApiResult<ProposeOutcome> {
        let t0 = Instant::now();
        info!(id = %identity, base = ?base_token.as_ref().map(|t| t.as_str()), "api: propose_edit start");
        let res = self.coordinator.apply(Self::proposal(identity, yaml, base_token), ApplyOptions::default()).await;
        let outcome = match res {
            Ok(out) => match out.record {
                Some(rec) => ProposeOutcome::Success(rec),
                None => return Err(ApiError::Internal("apply returned no record".into())),
            },
            Err(SyncError::EditConflict { current }) => ProposeOutcome::Conflict(current),
            Err(SyncError::MalformedDocument(m)) => ProposeOutcome::Malformed(m),
            Err(SyncError::ResourceNotFound(id)) => ProposeOutcome::NotFound(id),
            Err(e) => {
                warn!(id = %identity, error = %e, took_ms = %t0.elapsed().as_millis(), "api: propose_edit failed");
                return Err(e.into());
            }
        };
        let label = match &outcome {
            ProposeOutcome::Success(_) => "success",
            ProposeOutcome::Conflict(_) => "conflict",
            ProposeOutcome::Malformed(_) => "malformed",
            ProposeOutcome::NotFound(_) => "not_found",
        };
        counter!("api_propose_total", 1u64, "outcome" => label);
        info!(id = %identity, outcome = label, took_ms = %t0.elapsed().as_millis(), "api: propose_edit done");
        Ok(outcome)
    }

    async fn preview_edit(
        &self,
        identity: &ResourceIdentity,
        yaml: &str,
        base_token: Option<ConcurrencyToken>,
    ) -> ApiResult<DiffSummary> {
        let out = self.coordinator.apply(Self::proposal(identity, yaml, base_token), ApplyOptions::dry_run()).await?;
        Ok(out.summary)
    }

    async fn delete_resource(&self, identity: &ResourceIdentity, base_token: Option<ConcurrencyToken>) -> ApiResult<()> {
        let t0 = Instant::now();
        self.coordinator.delete(identity, base_token.as_ref(), ApplyOptions::default()).await?;
        info!(id = %identity, took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(())
    }

    async fn watch_status(&self) -> ApiResult<Vec<WatchStatus>> {
        Ok(self.statuses.iter().map(|rx| rx.borrow().clone()).collect())
    }

    async fn subscribe(&self) -> ApiResult<StreamHandle<EngineEvent>> {
        let (tx, rx) = mpsc::channel::<EngineEvent>(self.cfg.event_cap.max(1));
        let mut events = self.cache.subscribe();
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            let t0 = Instant::now();
            let mut sent = 0usize;
            loop {
                let evt = match events.recv().await {
                    Ok(e) => EngineEvent::Changed {
                        token: match e.change {
                            CacheChange::Upserted { token } => Some(token),
                            CacheChange::Removed => None,
                        },
                        identity: e.identity,
                        epoch: e.epoch,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "api: subscriber lagged");
                        EngineEvent::Resync { epoch: cache.snapshot().epoch() }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(evt).await.is_err() {
                    break;
                }
                sent += 1;
            }
            info!(sent, ran_ms = %t0.elapsed().as_millis(), "api: subscriber ended");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { task: Some(task) } })
    }
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle { task: Option<tokio::task::JoinHandle<()>> }

impl CancelHandle { pub fn cancel(mut self) { if let Some(h) = self.task.take() { h.abort(); } } }

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> { pub rx: mpsc::Receiver<T>, pub cancel: CancelHandle }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_errors_map_to_api_errors() {
        let id = ResourceIdentity::new("", "Pod", Some("ns"), "p");
        assert!(matches!(ApiError::from(SyncError::ResourceNotFound(id.clone())), ApiError::NotFound(s) if s == id.to_string()));
        assert!(matches!(ApiError::from(SyncError::Cancelled), ApiError::Cancelled));
        assert!(matches!(ApiError::from(SyncError::Indeterminate(id)), ApiError::Indeterminate(_)));
        assert!(matches!(ApiError::from(SyncError::ClusterUnavailable("down".into())), ApiError::Unavailable(m) if m == "down"));
    }

    #[test]
    fn propose_outcome_serializes_tagged() {
        let id = ResourceIdentity::new("apps", "Deployment", Some("ns"), "web");
        let v = serde_json::to_value(ProposeOutcome::NotFound(id)).unwrap();
        assert_eq!(v["outcome"], "not_found");
        assert_eq!(v["data"]["kind"], "Deployment");
    }
}
