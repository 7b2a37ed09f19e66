//! Magnitude store: the in-memory Resource Cache.
//!
//! Writers serialize on a short, non-async mutex around a persistent ordered map
//! and publish every committed state through `ArcSwap`, so readers take
//! point-in-time snapshots without ever blocking writers. Token monotonicity per
//! identity is enforced here and is the only arbitration between the watcher and
//! the mutation path.

#![forbid(unsafe_code)]

mod locks;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use im::OrdMap;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use magnitude_core::{ConcurrencyToken, KindScope, ResourceIdentity, ResourceRecord};

pub use locks::IdentityLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// Older-or-equal token (or behind a delete tombstone); nothing changed.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Upserted { token: ConcurrencyToken },
    Removed,
}

/// Change notification. Events for one identity are emitted in commit order,
/// which is token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub identity: ResourceIdentity,
    pub change: CacheChange,
    pub epoch: u64,
}

/// Result of replacing one kind scope with a fresh listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Listed records skipped because the cache already held a newer token.
    pub kept_newer: usize,
}

/// Immutable, ordered view of the cache at one epoch.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    epoch: u64,
    records: OrdMap<ResourceIdentity, Arc<ResourceRecord>>,
}

impl CacheSnapshot {
    /// Build a snapshot directly from records (later duplicates win). Mostly useful for tests
    /// and offline graph rendering.
    pub fn from_records(records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let mut map = OrdMap::new();
        for r in records {
            map.insert(r.identity.clone(), Arc::new(r));
        }
        Self { epoch: 0, records: map }
    }

    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn get(&self, identity: &ResourceIdentity) -> Option<&Arc<ResourceRecord>> { self.records.get(identity) }
    pub fn contains(&self, identity: &ResourceIdentity) -> bool { self.records.contains_key(identity) }

    /// Records in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceRecord>> + '_ { self.records.values() }

    /// Records of one group/kind, in identity order.
    pub fn of_kind<'a>(&'a self, group: &'a str, kind: &'a str) -> impl Iterator<Item = &'a Arc<ResourceRecord>> + 'a {
        let start = ResourceIdentity::new(group, kind, None, "");
        self.records
            .range(start..)
            .take_while(move |(id, _)| id.api_group == group && id.kind == kind)
            .map(|(_, r)| r)
    }
}

/// Default bound on remembered deletes. Re-lists prune watched scopes; the cap
/// covers identities no watcher ever re-lists.
pub const TOMBSTONE_CAP: usize = 4096;

/// Delete tokens per identity, evicted oldest-first past `cap`.
struct Tombstones {
    by_id: FxHashMap<ResourceIdentity, (ConcurrencyToken, u64)>,
    order: BTreeMap<u64, ResourceIdentity>,
    seq: u64,
    cap: usize,
}

impl Tombstones {
    fn new(cap: usize) -> Self {
        Self { by_id: FxHashMap::default(), order: BTreeMap::new(), seq: 0, cap: cap.max(1) }
    }

    fn get(&self, id: &ResourceIdentity) -> Option<&ConcurrencyToken> { self.by_id.get(id).map(|(t, _)| t) }

    fn insert(&mut self, id: ResourceIdentity, token: ConcurrencyToken) {
        self.seq += 1;
        if let Some((_, old)) = self.by_id.insert(id.clone(), (token, self.seq)) {
            self.order.remove(&old);
        }
        self.order.insert(self.seq, id);
        while self.by_id.len() > self.cap {
            let Some((_, oldest)) = self.order.pop_first() else { break };
            self.by_id.remove(&oldest);
            counter!("cache_tombstones_evicted_total", 1u64);
        }
    }

    fn remove(&mut self, id: &ResourceIdentity) {
        if let Some((_, seq)) = self.by_id.remove(id) {
            self.order.remove(&seq);
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&ResourceIdentity, &ConcurrencyToken) -> bool) {
        let order = &mut self.order;
        self.by_id.retain(|id, (t, seq)| {
            let k = keep(id, t);
            if !k {
                order.remove(&*seq);
            }
            k
        });
    }

    fn len(&self) -> usize { self.by_id.len() }
}

struct CacheState {
    records: OrdMap<ResourceIdentity, Arc<ResourceRecord>>,
    tombstones: Tombstones,
    epoch: u64,
}

pub struct ResourceCache {
    state: Mutex<CacheState>,
    published: ArcSwap<CacheSnapshot>,
    events: broadcast::Sender<CacheEvent>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for ResourceCache {
    fn default() -> Self { Self::new(2048) }
}

impl ResourceCache {
    /// `event_cap` bounds the change-notification channel; slow subscribers get
    /// `Lagged` and should resync from [`ResourceCache::snapshot`].
    pub fn new(event_cap: usize) -> Self { Self::with_tombstone_cap(event_cap, TOMBSTONE_CAP) }

    pub fn with_tombstone_cap(event_cap: usize, tombstone_cap: usize) -> Self {
        let (events, _) = broadcast::channel(event_cap.max(16));
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            state: Mutex::new(CacheState { records: OrdMap::new(), tombstones: Tombstones::new(tombstone_cap), epoch: 0 }),
            published: ArcSwap::from_pointee(CacheSnapshot::default()),
            events,
            epoch_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, st: &mut CacheState) {
        st.epoch = st.epoch.saturating_add(1);
        self.published.store(Arc::new(CacheSnapshot { epoch: st.epoch, records: st.records.clone() }));
        let _ = self.epoch_tx.send(st.epoch);
        gauge!("cache_objects", st.records.len() as f64);
    }

    fn notify(&self, st: &CacheState, identity: ResourceIdentity, change: CacheChange) {
        // Epoch of the commit that is about to be (or was just) published.
        let _ = self.events.send(CacheEvent { identity, change, epoch: st.epoch });
    }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<Arc<ResourceRecord>> {
        self.published.load().get(identity).cloned()
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> { self.published.load_full() }

    pub fn len(&self) -> usize { self.published.load().len() }
    pub fn is_empty(&self) -> bool { self.published.load().is_empty() }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> { self.events.subscribe() }

    /// Number of remembered deletes.
    pub fn tombstone_count(&self) -> usize { self.lock().tombstones.len() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Upsert a record unless the cache already holds an equal or newer token for it.
    pub fn put(&self, record: impl Into<Arc<ResourceRecord>>) -> PutOutcome {
        let record: Arc<ResourceRecord> = record.into();
        let mut st = self.lock();
        let id = record.identity.clone();
        if let Some(tomb) = st.tombstones.get(&id) {
            if !record.token.is_newer_than(tomb) {
                counter!("cache_stale_dropped_total", 1u64);
                debug!(identity = %id, token = %record.token, tombstone = %tomb, "cache: put behind tombstone dropped");
                return PutOutcome::Stale;
            }
        }
        let outcome = match st.records.get(&id) {
            Some(cur) if !record.token.is_newer_than(&cur.token) => {
                counter!("cache_stale_dropped_total", 1u64);
                debug!(identity = %id, token = %record.token, current = %cur.token, "cache: stale put dropped");
                return PutOutcome::Stale;
            }
            Some(_) => PutOutcome::Updated,
            None => PutOutcome::Inserted,
        };
        let token = record.token.clone();
        st.tombstones.remove(&id);
        st.records.insert(id.clone(), record);
        self.publish(&mut st);
        self.notify(&st, id, CacheChange::Upserted { token });
        counter!("cache_puts_total", 1u64);
        outcome
    }

    /// Remove an identity unconditionally. Removing an absent identity is a no-op.
    pub fn delete(&self, identity: &ResourceIdentity) -> Option<Arc<ResourceRecord>> {
        let mut st = self.lock();
        let removed = st.records.remove(identity);
        if removed.is_some() {
            self.publish(&mut st);
            self.notify(&st, identity.clone(), CacheChange::Removed);
            counter!("cache_deletes_total", 1u64);
        }
        removed
    }

    /// Watch-path delete observed at `token`. Ignored when the cache holds a newer
    /// record; otherwise removes it and remembers the token so that a redelivered
    /// older event cannot bring the record back. Returns whether a record was removed.
    pub fn delete_observed(&self, identity: &ResourceIdentity, token: &ConcurrencyToken) -> bool {
        let mut st = self.lock();
        if let Some(cur) = st.records.get(identity) {
            if cur.token.is_newer_than(token) {
                counter!("cache_stale_dropped_total", 1u64);
                debug!(identity = %identity, token = %token, current = %cur.token, "cache: stale delete dropped");
                return false;
            }
        }
        let newer_tomb = st.tombstones.get(identity).map(|t| token.is_newer_than(t)).unwrap_or(true);
        if newer_tomb {
            st.tombstones.insert(identity.clone(), token.clone());
        }
        let removed = st.records.remove(identity).is_some();
        if removed {
            self.publish(&mut st);
            self.notify(&st, identity.clone(), CacheChange::Removed);
            counter!("cache_deletes_total", 1u64);
        }
        removed
    }

    /// Atomically rebuild one kind scope from a fresh listing taken at `list_token`.
    ///
    /// Afterwards the scope holds exactly the listed identities, except for records
    /// written after the listing (token newer than `list_token`), which are kept.
    pub fn replace_kind(&self, scope: &KindScope, records: Vec<ResourceRecord>, list_token: &ConcurrencyToken) -> ReplaceSummary {
        let mut st = self.lock();
        let mut summary = ReplaceSummary::default();
        st.tombstones.retain(|id, t| !(scope.contains(id) && !t.is_newer_than(list_token)));

        let listed: FxHashSet<ResourceIdentity> = records.iter().map(|r| r.identity.clone()).collect();
        let start = ResourceIdentity::new(scope.kind.group.as_str(), scope.kind.kind.as_str(), None, "");
        let doomed: Vec<ResourceIdentity> = st
            .records
            .range(start..)
            .take_while(|(id, _)| scope.kind.matches(id))
            .filter(|(id, rec)| scope.contains(id) && !listed.contains(*id) && !rec.token.is_newer_than(list_token))
            .map(|(id, _)| id.clone())
            .collect();

        let mut changes: Vec<(ResourceIdentity, CacheChange)> = Vec::with_capacity(records.len() + doomed.len());
        for id in doomed {
            st.records.remove(&id);
            summary.removed += 1;
            changes.push((id, CacheChange::Removed));
        }
        for rec in records {
            if !scope.contains(&rec.identity) {
                continue;
            }
            let id = rec.identity.clone();
            if let Some(tomb) = st.tombstones.get(&id) {
                if !rec.token.is_newer_than(tomb) {
                    summary.kept_newer += 1;
                    continue;
                }
            }
            match st.records.get(&id) {
                Some(cur) if !rec.token.is_newer_than(&cur.token) => {
                    summary.kept_newer += 1;
                    continue;
                }
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
            let token = rec.token.clone();
            st.records.insert(id.clone(), Arc::new(rec));
            changes.push((id, CacheChange::Upserted { token }));
        }
        if !changes.is_empty() {
            self.publish(&mut st);
            for (id, change) in changes {
                self.notify(&st, id, change);
            }
        }
        counter!("cache_relists_total", 1u64);
        debug!(scope = %scope, inserted = summary.inserted, updated = summary.updated, removed = summary.removed, kept_newer = summary.kept_newer, "cache: kind replaced");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magnitude_core::WatchedKind;

    fn rec(kind: &str, ns: Option<&str>, name: &str, rv: &str) -> ResourceRecord {
        let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
        if let Some(ns) = ns {
            meta["namespace"] = serde_json::Value::String(ns.to_string());
        }
        ResourceRecord::from_document(serde_json::json!({ "apiVersion": "v1", "kind": kind, "metadata": meta })).unwrap()
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let cache = ResourceCache::default();
        cache.put(rec("Pod", Some("ns"), "a", "1"));
        let before = cache.snapshot();
        cache.put(rec("Pod", Some("ns"), "b", "2"));
        cache.delete(&ResourceIdentity::new("", "Pod", Some("ns"), "a"));
        assert_eq!(before.len(), 1);
        assert!(before.contains(&ResourceIdentity::new("", "Pod", Some("ns"), "a")));
        let after = cache.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.epoch() > before.epoch());
    }

    #[test]
    fn of_kind_walks_only_that_kind() {
        let snap = CacheSnapshot::from_records(vec![
            rec("ConfigMap", Some("ns"), "c", "1"),
            rec("Pod", Some("a"), "p1", "2"),
            rec("Pod", Some("b"), "p2", "3"),
            rec("Service", Some("a"), "s", "4"),
        ]);
        let names: Vec<&str> = snap.of_kind("", "Pod").map(|r| r.identity.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2"]);
    }

    #[test]
    fn replace_kind_respects_namespace_scope() {
        let cache = ResourceCache::default();
        cache.put(rec("Pod", Some("a"), "p1", "1"));
        cache.put(rec("Pod", Some("b"), "p2", "2"));
        let scope = KindScope::new(WatchedKind::new("", "v1", "Pod"), Some("a"));
        let summary = cache.replace_kind(&scope, vec![], &ConcurrencyToken::new("10"));
        assert_eq!(summary.removed, 1);
        assert!(cache.get(&ResourceIdentity::new("", "Pod", Some("b"), "p2")).is_some());
    }
}
