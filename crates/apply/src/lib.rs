//! Magnitude mutation coordinator.
//!
//! Every edit goes through [`MutationCoordinator::apply`]: decode, compare the
//! caller's base token with the cache under a per-identity lock, then issue a
//! precondition-guarded write. Stale proposals are rejected before the cluster is
//! contacted; the cluster re-checks the same token so races with other clients
//! surface as conflicts too.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value as Json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use magnitude_core::{
    ConcurrencyToken, Document, DocumentLimits, EditProposal, EngineConfig, ResourceIdentity, ResourceRecord, SyncError, SyncResult,
};
use magnitude_kubehub::{ClusterApi, ClusterError};
use magnitude_store::{IdentityLocks, ResourceCache};

/// Field-level change counts between a proposal and the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Overall budget including lock wait; the coordinator default applies when `None`.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Validate and diff only; the cluster is not contacted.
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn dry_run() -> Self { Self { dry_run: true, ..Self::default() } }
    pub fn with_timeout(timeout: Duration) -> Self { Self { timeout: Some(timeout), ..Self::default() } }
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Record returned by the cluster; for a dry run, the cached record the proposal was checked against.
    pub record: Option<Arc<ResourceRecord>>,
    pub created: bool,
    pub dry_run: bool,
    pub summary: DiffSummary,
}

enum Write {
    Create(Document),
    Replace(Document),
}

pub struct MutationCoordinator {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<ResourceCache>,
    locks: Arc<IdentityLocks>,
    limits: DocumentLimits,
    default_timeout: Duration,
}

impl MutationCoordinator {
    pub fn new(cluster: Arc<dyn ClusterApi>, cache: Arc<ResourceCache>, cfg: &EngineConfig) -> Self {
        Self { cluster, cache, locks: Arc::new(IdentityLocks::new()), limits: cfg.limits, default_timeout: cfg.apply_timeout }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }

    /// Apply a proposal. See the crate docs for the protocol.
    pub async fn apply(&self, proposal: EditProposal, opts: ApplyOptions) -> SyncResult<ApplyOutcome> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let identity = proposal.identity.clone();
        let res = self.apply_inner(proposal, opts).await;
        record_result(&res, t0);
        match &res {
            Ok(out) => info!(identity = %identity, created = out.created, dry_run = out.dry_run, took_ms = %t0.elapsed().as_millis(), "apply ok"),
            Err(e) => debug!(identity = %identity, error = %e, "apply rejected"),
        }
        res
    }

    async fn apply_inner(&self, proposal: EditProposal, opts: ApplyOptions) -> SyncResult<ApplyOutcome> {
        let mut doc = magnitude_codec::decode_with(&proposal.proposed_yaml, &self.limits)?;
        fill_namespace(&mut doc, &proposal.identity);
        let decoded = magnitude_codec::identity_of(&doc)?;
        if decoded != proposal.identity {
            return Err(SyncError::MalformedDocument(format!("document describes {} but the edit targets {}", decoded, proposal.identity)));
        }
        let identity = proposal.identity;
        let deadline = deadline_after(opts.timeout.unwrap_or(self.default_timeout));
        let cancel = opts.cancel.unwrap_or_default();

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(SyncError::Cancelled),
            g = self.locks.acquire(&identity) => g,
        };

        let cached = self.cache.get(&identity);
        let write = match (&cached, &proposal.base_token) {
            (None, None) => Write::Create(doc),
            (None, Some(_)) => return Err(SyncError::ResourceNotFound(identity)),
            (Some(cur), None) => return Err(SyncError::EditConflict { current: cur.clone() }),
            (Some(cur), Some(base)) if base != &cur.token => return Err(SyncError::EditConflict { current: cur.clone() }),
            (Some(_), Some(_)) => Write::Replace(doc),
        };

        let (mut doc, created) = match write {
            Write::Create(d) => (d, true),
            Write::Replace(d) => (d, false),
        };
        magnitude_codec::strip_server_fields(&mut doc);
        let base_doc = cached.as_ref().map(|c| {
            let mut b = c.spec.clone();
            magnitude_codec::strip_server_fields(&mut b);
            b
        });
        let summary = diff_summary(&doc, base_doc.as_ref().unwrap_or(&Json::Null));

        if opts.dry_run {
            counter!("apply_dry_ok", 1u64);
            return Ok(ApplyOutcome { record: cached, created, dry_run: true, summary });
        }
        if let Some(base) = &proposal.base_token {
            set_resource_version(&mut doc, base);
        }

        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(SyncError::Cancelled);
        }
        let cluster = self.cluster.clone();
        let issued = if created { cluster.create(doc) } else { cluster.replace(doc) };
        let res = match self.await_issued(&identity, issued, &cancel, deadline).await? {
            Ok(rec) => rec,
            Err(e) => return Err(self.map_cluster_error(&identity, e, &cancel, deadline).await),
        };
        self.cache.put(res.clone());
        Ok(ApplyOutcome { record: Some(Arc::new(res)), created, dry_run: false, summary })
    }

    /// Delete `identity`, guarded by `base_token` (or the cached token when `None`).
    pub async fn delete(&self, identity: &ResourceIdentity, base_token: Option<&ConcurrencyToken>, opts: ApplyOptions) -> SyncResult<()> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.delete_inner(identity, base_token, opts).await;
        record_result(&res, t0);
        if res.is_ok() {
            info!(identity = %identity, took_ms = %t0.elapsed().as_millis(), "delete ok");
        }
        res
    }

    async fn delete_inner(&self, identity: &ResourceIdentity, base_token: Option<&ConcurrencyToken>, opts: ApplyOptions) -> SyncResult<()> {
        let deadline = deadline_after(opts.timeout.unwrap_or(self.default_timeout));
        let cancel = opts.cancel.unwrap_or_default();
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(SyncError::Cancelled),
            g = self.locks.acquire(identity) => g,
        };
        let current = self.cache.get(identity).ok_or_else(|| SyncError::ResourceNotFound(identity.clone()))?;
        if let Some(base) = base_token {
            if base != &current.token {
                return Err(SyncError::EditConflict { current });
            }
        }
        if opts.dry_run {
            return Ok(());
        }
        if cancel.is_cancelled() || Instant::now() >= deadline {
            return Err(SyncError::Cancelled);
        }
        let cluster = self.cluster.clone();
        let precondition = current.token.clone();
        let issued = async move { cluster.delete(identity, Some(&precondition)).await };
        match self.await_issued(identity, Box::pin(issued), &cancel, deadline).await? {
            Ok(()) => {
                self.cache.delete_observed(identity, &current.token);
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                self.cache.delete_observed(identity, &current.token);
                Err(SyncError::ResourceNotFound(identity.clone()))
            }
            Err(e) => Err(self.map_cluster_error(identity, e, &cancel, deadline).await),
        }
    }

    /// Drive an issued cluster call to completion unless cancelled or out of time,
    /// in which case its outcome is unknown and a background reconcile is started.
    async fn await_issued<T>(
        &self,
        identity: &ResourceIdentity,
        issued: std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ClusterError>> + Send + '_>>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> SyncResult<Result<T, ClusterError>> {
        tokio::select! {
            r = issued => Ok(r),
            _ = cancel.cancelled() => Err(self.indeterminate(identity)),
            _ = tokio::time::sleep_until(deadline) => Err(self.indeterminate(identity)),
        }
    }

    /// The write was rejected but the refresh ran out of time. Report the cached
    /// record and let a background read catch the cache up.
    fn unrefreshed_conflict(&self, identity: &ResourceIdentity) -> SyncError {
        warn!(identity = %identity, "conflict refresh abandoned; reconciling in the background");
        tokio::spawn(reconcile(self.cluster.clone(), self.cache.clone(), self.locks.clone(), identity.clone()));
        match self.cache.get(identity) {
            Some(current) => SyncError::EditConflict { current },
            None => SyncError::ClusterUnavailable(format!("conflict on {} could not be refreshed in time", identity)),
        }
    }

    fn indeterminate(&self, identity: &ResourceIdentity) -> SyncError {
        counter!("apply_indeterminate_total", 1u64);
        warn!(identity = %identity, "mutation outcome unknown; reconciling from a fresh read");
        tokio::spawn(reconcile(self.cluster.clone(), self.cache.clone(), self.locks.clone(), identity.clone()));
        SyncError::Indeterminate(identity.clone())
    }

    async fn map_cluster_error(&self, identity: &ResourceIdentity, e: ClusterError, cancel: &CancellationToken, deadline: Instant) -> SyncError {
        match e {
            ClusterError::Conflict(msg) => {
                debug!(identity = %identity, reason = %msg, "cluster rejected precondition; refreshing");
                let fresh = tokio::select! {
                    r = self.cluster.get(identity) => r,
                    _ = cancel.cancelled() => return self.unrefreshed_conflict(identity),
                    _ = tokio::time::sleep_until(deadline) => return self.unrefreshed_conflict(identity),
                };
                match fresh {
                    Ok(Some(fresh)) => {
                        self.cache.put(fresh.clone());
                        let current = self.cache.get(identity).unwrap_or_else(|| Arc::new(fresh));
                        SyncError::EditConflict { current }
                    }
                    Ok(None) => {
                        self.cache.delete(identity);
                        SyncError::ResourceNotFound(identity.clone())
                    }
                    Err(e) => SyncError::ClusterUnavailable(e.to_string()),
                }
            }
            ClusterError::NotFound(_) => SyncError::ResourceNotFound(identity.clone()),
            ClusterError::Invalid(msg) => SyncError::MalformedDocument(format!("rejected by the cluster: {}", msg)),
            e @ (ClusterError::Gone(_) | ClusterError::Unavailable(_)) => SyncError::ClusterUnavailable(e.to_string()),
        }
    }
}

fn record_result<T>(res: &SyncResult<T>, t0: std::time::Instant) {
    match res {
        Ok(_) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
        }
        Err(SyncError::EditConflict { .. }) => counter!("apply_conflict_total", 1u64),
        Err(_) => counter!("apply_err", 1u64),
    }
}

const RECONCILE_ATTEMPTS: u32 = 5;

/// `now + budget`, saturating to a far-off instant for budgets like `Duration::MAX`.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Bring the cached record for `identity` in line with the cluster after a
/// mutation whose outcome is unknown.
async fn reconcile(cluster: Arc<dyn ClusterApi>, cache: Arc<ResourceCache>, locks: Arc<IdentityLocks>, identity: ResourceIdentity) {
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=RECONCILE_ATTEMPTS {
        let _guard = locks.acquire(&identity).await;
        match cluster.get(&identity).await {
            Ok(Some(rec)) => {
                let token = rec.token.clone();
                let outcome = cache.put(rec);
                info!(identity = %identity, token = %token, ?outcome, "reconciled after indeterminate mutation");
                return;
            }
            Ok(None) => {
                if let Some(cur) = cache.get(&identity) {
                    cache.delete_observed(&identity, &cur.token);
                }
                info!(identity = %identity, "reconciled: resource is gone");
                return;
            }
            Err(e) => warn!(identity = %identity, attempt, error = %e, "reconcile read failed"),
        }
        drop(_guard);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
}

/// Default a namespaced target's namespace into a document that omits it.
fn fill_namespace(doc: &mut Document, identity: &ResourceIdentity) {
    let Some(ns) = identity.namespace.as_deref() else { return };
    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.entry("namespace").or_insert_with(|| Json::String(ns.to_string()));
    }
}

fn set_resource_version(doc: &mut Document, token: &ConcurrencyToken) {
    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(token.as_str().to_string()));
    }
}

/// Count leaf-level adds, updates and removes turning `base` into `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, adds, ups, rems),
                        None => *adds += 1,
                    }
                }
                *rems += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (V::Array(aa), V::Array(bb)) => {
                *ups += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                *adds += aa.len().saturating_sub(bb.len());
                *rems += bb.len().saturating_sub(aa.len());
            }
            (V::Object(ao), V::Null) => *adds += ao.len(),
            (av, bv) => {
                if av != bv {
                    *ups += 1;
                }
            }
        }
    }
    let (mut adds, mut ups, mut rems) = (0usize, 0usize, 0usize);
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let target = serde_json::json!({
            "a": 2,
            "b": { "x": 1, "y": 2 },
            "c": [1, 9],
            "d": true
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn diff_against_nothing_counts_top_level_adds() {
        let target = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" } });
        assert_eq!(diff_summary(&target, &Json::Null).adds, 3);
    }

    #[test]
    fn unbounded_budget_saturates() {
        let d = deadline_after(Duration::MAX);
        assert!(d > Instant::now() + Duration::from_secs(86_400 * 365));
        assert!(deadline_after(Duration::from_millis(5)) <= Instant::now() + Duration::from_millis(5));
    }

    #[test]
    fn namespace_is_defaulted_from_the_target() {
        let mut doc = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" } });
        fill_namespace(&mut doc, &ResourceIdentity::new("", "ConfigMap", Some("ns"), "x"));
        assert_eq!(doc["metadata"]["namespace"], "ns");
        let mut explicit = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x", "namespace": "other" } });
        fill_namespace(&mut explicit, &ResourceIdentity::new("", "ConfigMap", Some("ns"), "x"));
        assert_eq!(explicit["metadata"]["namespace"], "other");
    }
}
