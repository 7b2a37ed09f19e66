use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::Value as Json;
use tracing::debug;

use magnitude_core::{ConcurrencyToken, Document, KindScope, ResourceIdentity, ResourceRecord};

use crate::{ClusterApi, ClusterError, DiscoveredResource, ObjectList, WatchEvent, WatchStream, CLUSTER_SCOPED_KINDS};

struct Subscriber {
    scope: KindScope,
    tx: UnboundedSender<Result<WatchEvent, ClusterError>>,
}

#[derive(Default)]
struct State {
    rv: u64,
    objects: BTreeMap<ResourceIdentity, ResourceRecord>,
    log: Vec<(u64, WatchEvent)>,
    compacted: u64,
    watchers: Vec<Subscriber>,
    failing_lists: u32,
    failing_watches: u32,
    api_writes: u64,
    latency: Duration,
}

impl State {
    fn next_rv(&mut self) -> u64 {
        self.rv += 1;
        self.rv
    }

    fn emit(&mut self, rv: u64, identity: &ResourceIdentity, ev: WatchEvent) {
        self.watchers.retain(|w| {
            if !w.scope.contains(identity) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(Ok(ev.clone())).is_ok()
        });
        self.log.push((rv, ev));
    }
}

/// Authoritative in-memory cluster. Assigns increasing decimal resource versions,
/// enforces optimistic-concurrency preconditions and fans events out to watchers.
///
/// Test hooks simulate outages, broken or expired watches and slow writes.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn set_meta(doc: &mut Document, key: &str, value: Json) {
    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert(key.to_string(), value);
    }
}

fn meta_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

fn invalid(e: impl std::fmt::Display) -> ClusterError { ClusterError::Invalid(e.to_string()) }

fn parse_token(t: &ConcurrencyToken) -> Result<u64, ClusterError> {
    t.as_str().parse::<u64>().map_err(|_| ClusterError::Invalid(format!("unparsable resourceVersion {:?}", t.as_str())))
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    async fn settle(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Create or overwrite an object out of band, as another client would.
    pub fn upsert(&self, mut doc: Document) -> Result<ResourceRecord, ClusterError> {
        let identity = ResourceIdentity::from_document(&doc).map_err(invalid)?;
        let mut st = self.lock();
        let rv = st.next_rv();
        let existing = st.objects.get(&identity).cloned();
        match &existing {
            Some(cur) => {
                if let Some(uid) = meta_str(&cur.spec, "uid").map(str::to_string) {
                    set_meta(&mut doc, "uid", Json::String(uid));
                }
            }
            None => {
                if meta_str(&doc, "uid").is_none() {
                    set_meta(&mut doc, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
                }
            }
        }
        set_meta(&mut doc, "resourceVersion", Json::String(rv.to_string()));
        let record = ResourceRecord::from_document(doc).map_err(invalid)?;
        st.objects.insert(identity.clone(), record.clone());
        let ev = if existing.is_some() { WatchEvent::Modified(record.clone()) } else { WatchEvent::Added(record.clone()) };
        st.emit(rv, &identity, ev);
        Ok(record)
    }

    /// Delete an object out of band.
    pub fn remove(&self, identity: &ResourceIdentity) -> Option<ResourceRecord> {
        let mut st = self.lock();
        let mut gone = st.objects.remove(identity)?;
        let rv = st.next_rv();
        gone.token = ConcurrencyToken::new(rv.to_string());
        set_meta(&mut gone.spec, "resourceVersion", Json::String(rv.to_string()));
        st.emit(rv, identity, WatchEvent::Deleted(gone.clone()));
        Some(gone)
    }

    /// Deliver an error to every open watch and close it.
    pub fn break_watches(&self, reason: &str) {
        let mut st = self.lock();
        for w in st.watchers.drain(..) {
            let _ = w.tx.unbounded_send(Ok(WatchEvent::Error(ClusterError::Unavailable(reason.to_string()))));
        }
    }

    /// Close every open watch cleanly, as a server-side watch timeout does.
    pub fn end_watches(&self) { self.lock().watchers.clear(); }

    pub fn fail_next_lists(&self, n: u32) { self.lock().failing_lists = n; }

    pub fn fail_next_watches(&self, n: u32) { self.lock().failing_watches = n; }

    /// Delay every write response by `latency`. The write itself is applied first.
    pub fn set_latency(&self, latency: Duration) { self.lock().latency = latency; }

    /// Forget the event history: watches resuming from an older token get `Gone`
    /// and open watches are told so.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.rv;
        st.log.clear();
        for w in st.watchers.drain(..) {
            let _ = w.tx.unbounded_send(Err(ClusterError::Gone("history compacted".into())));
        }
    }

    pub fn object(&self, identity: &ResourceIdentity) -> Option<ResourceRecord> { self.lock().objects.get(identity).cloned() }

    /// Current resource version.
    pub fn token(&self) -> ConcurrencyToken { ConcurrencyToken::new(self.lock().rv.to_string()) }

    pub fn watcher_count(&self) -> usize {
        let mut st = self.lock();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.len()
    }

    /// Writes received through [`ClusterApi`] (create, replace, delete).
    pub fn api_writes(&self) -> u64 { self.lock().api_writes }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn kinds(&self) -> Result<Vec<DiscoveredResource>, ClusterError> {
        let st = self.lock();
        let mut out: Vec<DiscoveredResource> = Vec::new();
        for rec in st.objects.values() {
            let (group, version) = magnitude_core::split_api_version(&rec.api_version);
            let d = DiscoveredResource {
                group: group.to_string(),
                version: version.to_string(),
                kind: rec.identity.kind.clone(),
                namespaced: !CLUSTER_SCOPED_KINDS.contains(&rec.identity.kind.as_str()),
            };
            if !out.contains(&d) {
                out.push(d);
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }

    async fn list(&self, scope: &KindScope) -> Result<ObjectList, ClusterError> {
        let mut st = self.lock();
        if st.failing_lists > 0 {
            st.failing_lists -= 1;
            return Err(ClusterError::Unavailable("injected list failure".into()));
        }
        let items: Vec<ResourceRecord> = st.objects.values().filter(|r| scope.contains(&r.identity)).cloned().collect();
        Ok(ObjectList { items, token: ConcurrencyToken::new(st.rv.to_string()) })
    }

    async fn watch(&self, scope: &KindScope, from: &ConcurrencyToken) -> Result<WatchStream, ClusterError> {
        let from = parse_token(from)?;
        let mut st = self.lock();
        if st.failing_watches > 0 {
            st.failing_watches -= 1;
            return Err(ClusterError::Unavailable("injected watch failure".into()));
        }
        if from < st.compacted {
            return Err(ClusterError::Gone(format!("too old resource version: {} ({})", from, st.compacted)));
        }
        let (tx, rx) = unbounded();
        for (rv, ev) in st.log.iter().filter(|(rv, _)| *rv > from) {
            let id = match ev {
                WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => &r.identity,
                _ => continue,
            };
            if scope.contains(id) {
                debug!(rv, identity = %id, "memory cluster: replaying event");
                let _ = tx.unbounded_send(Ok(ev.clone()));
            }
        }
        st.watchers.push(Subscriber { scope: scope.clone(), tx });
        Ok(rx.boxed())
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>, ClusterError> { Ok(self.object(identity)) }

    async fn create(&self, mut doc: Document) -> Result<ResourceRecord, ClusterError> {
        let identity = ResourceIdentity::from_document(&doc).map_err(invalid)?;
        let record = {
            let mut st = self.lock();
            st.api_writes += 1;
            if st.objects.contains_key(&identity) {
                return Err(ClusterError::Conflict(format!("{} already exists", identity)));
            }
            let rv = st.next_rv();
            set_meta(&mut doc, "resourceVersion", Json::String(rv.to_string()));
            set_meta(&mut doc, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
            set_meta(&mut doc, "creationTimestamp", Json::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()));
            if let Some(obj) = doc.as_object_mut() {
                obj.remove("status");
            }
            let record = ResourceRecord::from_document(doc).map_err(invalid)?;
            st.objects.insert(identity.clone(), record.clone());
            st.emit(rv, &identity, WatchEvent::Added(record.clone()));
            record
        };
        self.settle().await;
        Ok(record)
    }

    async fn replace(&self, mut doc: Document) -> Result<ResourceRecord, ClusterError> {
        let identity = ResourceIdentity::from_document(&doc).map_err(invalid)?;
        let record = {
            let mut st = self.lock();
            st.api_writes += 1;
            let current = st.objects.get(&identity).cloned().ok_or_else(|| ClusterError::NotFound(identity.to_string()))?;
            if let Some(pre) = meta_str(&doc, "resourceVersion") {
                if pre != current.token.as_str() {
                    return Err(ClusterError::Conflict(format!(
                        "the object has been modified; please apply your changes to the latest version (have {}, got {})",
                        current.token, pre
                    )));
                }
            }
            let rv = st.next_rv();
            for key in ["uid", "creationTimestamp"] {
                if let Some(v) = meta_str(&current.spec, key).map(str::to_string) {
                    set_meta(&mut doc, key, Json::String(v));
                }
            }
            set_meta(&mut doc, "resourceVersion", Json::String(rv.to_string()));
            let mut record = ResourceRecord::from_document(doc).map_err(invalid)?;
            record.status = current.status.clone();
            st.objects.insert(identity.clone(), record.clone());
            st.emit(rv, &identity, WatchEvent::Modified(record.clone()));
            record
        };
        self.settle().await;
        Ok(record)
    }

    async fn delete(&self, identity: &ResourceIdentity, precondition: Option<&ConcurrencyToken>) -> Result<(), ClusterError> {
        {
            let mut st = self.lock();
            st.api_writes += 1;
            let current = st.objects.get(identity).ok_or_else(|| ClusterError::NotFound(identity.to_string()))?;
            if let Some(pre) = precondition {
                if pre != &current.token {
                    return Err(ClusterError::Conflict(format!("precondition failed: have {}, got {}", current.token, pre)));
                }
            }
            let mut gone = st.objects.remove(identity).ok_or_else(|| ClusterError::NotFound(identity.to_string()))?;
            let rv = st.next_rv();
            gone.token = ConcurrencyToken::new(rv.to_string());
            set_meta(&mut gone.spec, "resourceVersion", Json::String(rv.to_string()));
            st.emit(rv, identity, WatchEvent::Deleted(gone));
        }
        self.settle().await;
        Ok(())
    }
}
