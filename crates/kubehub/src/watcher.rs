//! Per-kind list/watch loops that keep a [`ResourceCache`] in step with a cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use magnitude_core::{ConcurrencyToken, EngineConfig, KindScope};
use magnitude_store::ResourceCache;

use crate::{Backoff, ClusterApi, ClusterError, WatchEvent};

/// A stream that closes this quickly without delivering anything is treated as a failure.
const MIN_HEALTHY_STREAM: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchPhase {
    Listing,
    Watching,
    Erroring,
    Backoff,
    Stopped,
}

/// Observable state of one kind watcher.
#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    pub scope: KindScope,
    pub phase: WatchPhase,
    /// Cache contents for this kind may be stale; cleared by the next successful list.
    pub degraded: bool,
    /// At least one list has completed.
    pub synced: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Objects in the most recent listing.
    pub objects: usize,
    /// Watch events applied since start.
    pub events: u64,
}

impl WatchStatus {
    fn new(scope: KindScope) -> Self {
        Self {
            scope,
            phase: WatchPhase::Listing,
            degraded: false,
            synced: false,
            consecutive_failures: 0,
            last_error: None,
            last_synced_at: None,
            objects: 0,
            events: 0,
        }
    }
}

enum Step {
    List,
    Watch(ConcurrencyToken),
    Fail(ClusterError),
    Wait,
}

enum StreamExit {
    Cancelled,
    Ended,
    Failed(ClusterError),
}

/// List/watch loop for a single kind scope.
pub struct KindWatcher {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<ResourceCache>,
    scope: KindScope,
    backoff: Backoff,
    status: watch::Sender<WatchStatus>,
}

impl KindWatcher {
    pub fn new(cluster: Arc<dyn ClusterApi>, cache: Arc<ResourceCache>, scope: KindScope, cfg: &EngineConfig) -> (Self, watch::Receiver<WatchStatus>) {
        let (status, rx) = watch::channel(WatchStatus::new(scope.clone()));
        let backoff = Backoff::new(cfg.watch_backoff_initial, cfg.watch_backoff_max);
        (Self { cluster, cache, scope, backoff, status }, rx)
    }

    fn phase(&self, phase: WatchPhase) { self.status.send_modify(|s| s.phase = phase); }

    /// Run until `cancel` fires. Failures never end the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let kind = self.scope.kind.key();
        let mut step = Step::List;
        info!(scope = %self.scope, "watcher started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            step = match step {
                Step::List => {
                    self.phase(WatchPhase::Listing);
                    let t0 = Instant::now();
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.cluster.list(&self.scope) => r,
                    };
                    match listed {
                        Ok(list) => {
                            let objects = list.items.len();
                            let summary = self.cache.replace_kind(&self.scope, list.items, &list.token);
                            counter!("watch_relist_total", 1u64, "kind" => kind.clone());
                            self.backoff.reset();
                            self.status.send_modify(|s| {
                                s.synced = true;
                                s.degraded = false;
                                s.consecutive_failures = 0;
                                s.last_error = None;
                                s.last_synced_at = Some(Utc::now());
                                s.objects = objects;
                            });
                            info!(
                                scope = %self.scope,
                                objects,
                                inserted = summary.inserted,
                                updated = summary.updated,
                                removed = summary.removed,
                                token = %list.token,
                                took_ms = %t0.elapsed().as_millis(),
                                "listed"
                            );
                            Step::Watch(list.token)
                        }
                        Err(e) => Step::Fail(e),
                    }
                }
                Step::Watch(from) => {
                    self.phase(WatchPhase::Watching);
                    let opened = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.cluster.watch(&self.scope, &from) => r,
                    };
                    match opened {
                        Err(e) => Step::Fail(e),
                        Ok(stream) => match self.drain(stream, from, &kind, &cancel).await {
                            StreamExit::Cancelled => break,
                            StreamExit::Failed(e) => Step::Fail(e),
                            StreamExit::Ended => {
                                debug!(scope = %self.scope, "watch stream closed; re-listing");
                                Step::List
                            }
                        },
                    }
                }
                Step::Fail(e) => {
                    self.phase(WatchPhase::Erroring);
                    counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                    let msg = e.to_string();
                    self.status.send_modify(|s| {
                        s.degraded = true;
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        s.last_error = Some(msg.clone());
                    });
                    warn!(scope = %self.scope, error = %msg, attempt = self.backoff.attempt() + 1, "watch failed; kind degraded");
                    Step::Wait
                }
                Step::Wait => {
                    self.phase(WatchPhase::Backoff);
                    let delay = self.backoff.next_delay();
                    debug!(scope = %self.scope, delay_ms = %delay.as_millis(), "backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    Step::List
                }
            };
        }
        self.phase(WatchPhase::Stopped);
        info!(scope = %self.scope, "watcher stopped");
    }

    async fn drain(&self, mut stream: crate::WatchStream, from: ConcurrencyToken, kind: &str, cancel: &CancellationToken) -> StreamExit {
        let started = Instant::now();
        let mut token = from;
        let mut seen = 0u64;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamExit::Cancelled,
                n = stream.next() => n,
            };
            let ev = match next {
                Some(Ok(ev)) => ev,
                Some(Err(e)) => return StreamExit::Failed(e),
                None if seen == 0 && started.elapsed() < MIN_HEALTHY_STREAM => {
                    return StreamExit::Failed(ClusterError::Unavailable(format!("watch from {} closed immediately", token)));
                }
                None => return StreamExit::Ended,
            };
            match ev {
                WatchEvent::Added(rec) | WatchEvent::Modified(rec) => {
                    if rec.token.is_newer_than(&token) {
                        token = rec.token.clone();
                    }
                    self.cache.put(rec);
                }
                WatchEvent::Deleted(rec) => {
                    if rec.token.is_newer_than(&token) {
                        token = rec.token.clone();
                    }
                    self.cache.delete_observed(&rec.identity, &rec.token);
                }
                WatchEvent::Bookmark(t) => {
                    if t.is_newer_than(&token) {
                        token = t;
                    }
                    continue;
                }
                WatchEvent::Error(e) => return StreamExit::Failed(e),
            }
            seen += 1;
            counter!("watch_events_total", 1u64, "kind" => kind.to_string());
            self.status.send_modify(|s| s.events += 1);
        }
    }
}

/// All kind watchers of one engine, sharing a cancellation token.
pub struct WatcherSet {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    statuses: Vec<watch::Receiver<WatchStatus>>,
}

impl WatcherSet {
    pub fn spawn(cluster: Arc<dyn ClusterApi>, cache: Arc<ResourceCache>, scopes: Vec<KindScope>, cfg: &EngineConfig) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(scopes.len());
        let mut statuses = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let (watcher, rx) = KindWatcher::new(cluster.clone(), cache.clone(), scope, cfg);
            tasks.push(tokio::spawn(watcher.run(cancel.child_token())));
            statuses.push(rx);
        }
        info!(kinds = tasks.len(), "watchers spawned");
        Self { cancel, tasks, statuses }
    }

    pub fn statuses(&self) -> Vec<WatchStatus> { self.statuses.iter().map(|rx| rx.borrow().clone()).collect() }

    pub fn status_receivers(&self) -> Vec<watch::Receiver<WatchStatus>> { self.statuses.clone() }

    /// Wait until every kind has completed its first list. Returns false on timeout.
    pub async fn wait_synced(&self, timeout: Duration) -> bool { wait_synced(self.statuses.clone(), timeout).await }

    /// Cancel all watchers and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "watcher task panicked");
            }
        }
    }
}

/// Wait until every status channel reports a completed first list. Returns false
/// on timeout or when a watcher went away before syncing.
pub async fn wait_synced(statuses: Vec<watch::Receiver<WatchStatus>>, timeout: Duration) -> bool {
    let waits = statuses.into_iter().map(|mut rx| async move {
        let ok = rx.wait_for(|s| s.synced).await.is_ok();
        ok
    });
    match tokio::time::timeout(timeout, futures::future::join_all(waits)).await {
        Ok(all) => all.into_iter().all(|ok| ok),
        Err(_) => false,
    }
}
