use std::sync::Arc;
use std::time::Duration;

use magnitude_apply::{ApplyOptions, MutationCoordinator};
use async_trait::async_trait;
use magnitude_core::{ConcurrencyToken, Document, EditProposal, EngineConfig, KindScope, ResourceIdentity, ResourceRecord, SyncError};
use magnitude_kubehub::{ClusterApi, ClusterError, DiscoveredResource, MemoryCluster, ObjectList, WatchStream};
use magnitude_store::ResourceCache;
use tokio_util::sync::CancellationToken;

struct Fixture {
    cluster: Arc<MemoryCluster>,
    cache: Arc<ResourceCache>,
    coord: Arc<MutationCoordinator>,
}

fn fixture() -> Fixture {
    let cluster = Arc::new(MemoryCluster::new());
    let cache = Arc::new(ResourceCache::default());
    let api: Arc<dyn ClusterApi> = cluster.clone();
    let coord = Arc::new(MutationCoordinator::new(api, cache.clone(), &EngineConfig::default()));
    Fixture { cluster, cache, coord }
}

fn cm_id() -> ResourceIdentity {
    ResourceIdentity::new("", "ConfigMap", Some("ns"), "cfg")
}

fn cm_yaml(value: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: ns\ndata:\n  key: {}\n", value)
}

/// Seed the cluster with cfg, advancing its token to `rv`, and mirror it into the cache.
fn seed(f: &Fixture, rv: u64) -> ConcurrencyToken {
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "cfg", "namespace": "ns" },
        "data": { "key": "seed" }
    });
    let mut last = None;
    for _ in 0..rv {
        last = Some(f.cluster.upsert(doc.clone()).unwrap());
    }
    let rec = last.unwrap();
    f.cache.put(rec.clone());
    rec.token
}

fn proposal(value: &str, base: Option<&str>) -> EditProposal {
    EditProposal { identity: cm_id(), proposed_yaml: cm_yaml(value), base_token: base.map(ConcurrencyToken::new) }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_base_token_is_rejected_without_touching_the_cluster() {
    let f = fixture();
    let current = seed(&f, 5);
    let err = f.coord.apply(proposal("new", Some("3")), ApplyOptions::default()).await.unwrap_err();
    match err {
        SyncError::EditConflict { current: rec } => assert_eq!(rec.token, current),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(f.cluster.api_writes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_proposals_on_the_same_token_yield_one_winner() {
    let f = fixture();
    let base = seed(&f, 5);
    assert_eq!(base.as_str(), "5");

    let a = {
        let coord = f.coord.clone();
        tokio::spawn(async move { coord.apply(proposal("from-a", Some("5")), ApplyOptions::default()).await })
    };
    let b = {
        let coord = f.coord.clone();
        tokio::spawn(async move { coord.apply(proposal("from-b", Some("5")), ApplyOptions::default()).await })
    };
    let results = vec![a.await.unwrap(), b.await.unwrap()];

    let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let conflicts: Vec<_> = results
        .iter()
        .filter_map(|r| match r {
            Err(SyncError::EditConflict { current }) => Some(current.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(wins.len(), 1, "results: {:?}", results);
    assert_eq!(conflicts.len(), 1, "results: {:?}", results);
    let won = wins[0].record.as_ref().unwrap();
    assert_eq!(won.token.as_str(), "6");
    assert_eq!(conflicts[0].token.as_str(), "6");
    assert_eq!(conflicts[0].spec["data"]["key"], won.spec["data"]["key"]);
    assert_eq!(f.cache.get(&cm_id()).unwrap().token.as_str(), "6");
    assert_eq!(f.cluster.api_writes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_edit_updates_cache_and_reports_diff() {
    let f = fixture();
    let base = seed(&f, 2);
    let out = f.coord.apply(proposal("changed", Some(base.as_str())), ApplyOptions::default()).await.unwrap();
    assert!(!out.created);
    assert_eq!(out.summary.updates, 1);
    let rec = out.record.unwrap();
    assert!(rec.token.is_newer_than(&base));
    assert_eq!(f.cache.get(&cm_id()).unwrap().token, rec.token);
    assert_eq!(f.cluster.object(&cm_id()).unwrap().spec["data"]["key"], "changed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_and_mismatched_documents_are_rejected() {
    let f = fixture();
    seed(&f, 1);
    let bad = EditProposal { identity: cm_id(), proposed_yaml: "kind: [".into(), base_token: Some("1".into()) };
    assert!(matches!(f.coord.apply(bad, ApplyOptions::default()).await, Err(SyncError::MalformedDocument(_))));

    let renamed = EditProposal {
        identity: cm_id(),
        proposed_yaml: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: other\n  namespace: ns\n".into(),
        base_token: Some("1".into()),
    };
    assert!(matches!(f.coord.apply(renamed, ApplyOptions::default()).await, Err(SyncError::MalformedDocument(_))));
    assert_eq!(f.cluster.api_writes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_target_with_base_token_is_not_found() {
    let f = fixture();
    let err = f.coord.apply(proposal("x", Some("4")), ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::ResourceNotFound(ref id) if *id == cm_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proposal_without_base_token_creates() {
    let f = fixture();
    let out = f.coord.apply(proposal("fresh", None), ApplyOptions::default()).await.unwrap();
    assert!(out.created);
    assert!(f.cluster.object(&cm_id()).is_some());
    assert_eq!(f.cache.get(&cm_id()).unwrap().token, out.record.unwrap().token);

    // Creating again over an existing object is a conflict.
    let err = f.coord.apply(proposal("again", None), ApplyOptions::default()).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cluster_side_conflict_refreshes_the_cache() {
    let f = fixture();
    let base = seed(&f, 3);
    // Another client writes; our cache has not seen it yet.
    let mut other = f.cluster.object(&cm_id()).unwrap().spec;
    other["data"]["key"] = "theirs".into();
    let theirs = f.cluster.upsert(other).unwrap();

    let err = f.coord.apply(proposal("ours", Some(base.as_str())), ApplyOptions::default()).await.unwrap_err();
    match err {
        SyncError::EditConflict { current } => {
            assert_eq!(current.token, theirs.token);
            assert_eq!(current.spec["data"]["key"], "theirs");
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(f.cache.get(&cm_id()).unwrap().token, theirs.token);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_after_issue_is_indeterminate_and_reconciles() {
    let f = fixture();
    let base = seed(&f, 1);
    f.cluster.set_latency(Duration::from_millis(500));
    let opts = ApplyOptions::with_timeout(Duration::from_millis(50));
    let err = f.coord.apply(proposal("slow", Some(base.as_str())), opts).await.unwrap_err();
    assert!(matches!(err, SyncError::Indeterminate(ref id) if *id == cm_id()), "err={:?}", err);

    let applied = f.cluster.object(&cm_id()).unwrap();
    assert_eq!(applied.spec["data"]["key"], "slow");
    for _ in 0..300 {
        if f.cache.get(&cm_id()).map(|r| r.token == applied.token).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache was not reconciled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_before_issue_is_cancelled() {
    let f = fixture();
    let base = seed(&f, 1);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = ApplyOptions { cancel: Some(cancel), ..ApplyOptions::default() };
    let err = f.coord.apply(proposal("never", Some(base.as_str())), opts).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(f.cluster.api_writes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_checks_and_diffs_without_writing() {
    let f = fixture();
    let base = seed(&f, 2);
    let out = f.coord.apply(proposal("preview", Some(base.as_str())), ApplyOptions::dry_run()).await.unwrap();
    assert!(out.dry_run);
    assert_eq!(out.summary.updates, 1);
    assert_eq!(out.record.unwrap().token, base);
    assert_eq!(f.cluster.api_writes(), 0);
    assert!(f.coord.apply(proposal("preview", Some("1")), ApplyOptions::dry_run()).await.unwrap_err().is_conflict());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_is_guarded_by_the_base_token() {
    let f = fixture();
    let base = seed(&f, 2);
    let stale = ConcurrencyToken::new("1");
    assert!(f.coord.delete(&cm_id(), Some(&stale), ApplyOptions::default()).await.unwrap_err().is_conflict());
    assert_eq!(f.cluster.api_writes(), 0);

    f.coord.delete(&cm_id(), Some(&base), ApplyOptions::default()).await.unwrap();
    assert!(f.cluster.object(&cm_id()).is_none());
    assert!(f.cache.get(&cm_id()).is_none());
    // A redelivered pre-delete event cannot resurrect it.
    let old = magnitude_core::ResourceRecord::from_document(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "cfg", "namespace": "ns", "resourceVersion": base.as_str() }
    }))
    .unwrap();
    assert_eq!(f.cache.put(old), magnitude_store::PutOutcome::Stale);
    assert!(matches!(f.coord.delete(&cm_id(), None, ApplyOptions::default()).await, Err(SyncError::ResourceNotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbounded_timeout_means_no_deadline() {
    let f = fixture();
    let base = seed(&f, 1);
    let coord = f.coord.clone();
    let out = tokio::spawn(async move { coord.apply(proposal("forever", Some(base.as_str())), ApplyOptions::with_timeout(Duration::MAX)).await })
        .await
        .expect("apply task panicked")
        .unwrap();
    let rec = out.record.unwrap();
    assert_eq!(rec.spec["data"]["key"], "forever");

    let coord = f.coord.clone();
    tokio::spawn(async move { coord.delete(&cm_id(), Some(&rec.token), ApplyOptions::with_timeout(Duration::MAX)).await })
        .await
        .expect("delete task panicked")
        .unwrap();
    assert!(f.cluster.object(&cm_id()).is_none());
}

/// Cluster whose reads are slow; writes go straight through.
struct SlowReads {
    inner: Arc<MemoryCluster>,
    delay: Duration,
}

#[async_trait]
impl ClusterApi for SlowReads {
    async fn kinds(&self) -> Result<Vec<DiscoveredResource>, ClusterError> { self.inner.kinds().await }
    async fn list(&self, scope: &KindScope) -> Result<ObjectList, ClusterError> { self.inner.list(scope).await }
    async fn watch(&self, scope: &KindScope, from: &ConcurrencyToken) -> Result<WatchStream, ClusterError> { self.inner.watch(scope, from).await }
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>, ClusterError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(identity).await
    }
    async fn create(&self, doc: Document) -> Result<ResourceRecord, ClusterError> { self.inner.create(doc).await }
    async fn replace(&self, doc: Document) -> Result<ResourceRecord, ClusterError> { self.inner.replace(doc).await }
    async fn delete(&self, identity: &ResourceIdentity, precondition: Option<&ConcurrencyToken>) -> Result<(), ClusterError> {
        self.inner.delete(identity, precondition).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflict_refresh_stays_within_the_caller_budget() {
    let f = fixture();
    let base = seed(&f, 2);
    let mut other = f.cluster.object(&cm_id()).unwrap().spec;
    other["data"]["key"] = "theirs".into();
    let theirs = f.cluster.upsert(other).unwrap();

    let slow: Arc<dyn ClusterApi> = Arc::new(SlowReads { inner: f.cluster.clone(), delay: Duration::from_millis(1500) });
    let coord = MutationCoordinator::new(slow, f.cache.clone(), &EngineConfig::default());

    let t0 = std::time::Instant::now();
    let err = coord.apply(proposal("ours", Some(base.as_str())), ApplyOptions::with_timeout(Duration::from_millis(200))).await.unwrap_err();
    assert!(t0.elapsed() < Duration::from_millis(1000), "took {:?}", t0.elapsed());
    match err {
        SyncError::EditConflict { current } => assert_eq!(current.token, base),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(f.cluster.object(&cm_id()).unwrap().spec["data"]["key"], "theirs");

    // The abandoned refresh finishes in the background.
    for _ in 0..500 {
        if f.cache.get(&cm_id()).map(|r| r.token == theirs.token).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache was not reconciled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_conflict_refresh_reports_the_cached_record() {
    let f = fixture();
    let base = seed(&f, 2);
    f.cluster.upsert(f.cluster.object(&cm_id()).unwrap().spec).unwrap();

    let slow: Arc<dyn ClusterApi> = Arc::new(SlowReads { inner: f.cluster.clone(), delay: Duration::from_secs(5) });
    let coord = MutationCoordinator::new(slow, f.cache.clone(), &EngineConfig::default());
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trip.cancel();
    });

    let t0 = std::time::Instant::now();
    let opts = ApplyOptions { cancel: Some(cancel), ..ApplyOptions::default() };
    let err = coord.delete(&cm_id(), Some(&base), opts).await.unwrap_err();
    assert!(t0.elapsed() < Duration::from_secs(2), "took {:?}", t0.elapsed());
    assert!(matches!(err, SyncError::EditConflict { ref current } if current.token == base), "err={:?}", err);
    assert!(f.cluster.object(&cm_id()).is_some());
}
