use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions, WatchParams},
    core::{ApiResource, DynamicObject, TypeMeta, WatchEvent as KubeWatchEvent},
    discovery::{Discovery, Scope},
    Client,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use magnitude_core::{ConcurrencyToken, Document, KindScope, ResourceIdentity, ResourceRecord};

use crate::{ClusterApi, ClusterError, DiscoveredResource, ObjectList, WatchEvent, WatchStream};

const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

type Served = HashMap<(String, String), (ApiResource, bool)>;

/// [`ClusterApi`] backed by a live API server through kube-rs.
pub struct KubeCluster {
    client: Client,
    watch_timeout_secs: u32,
    served: RwLock<Served>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS, served: RwLock::new(HashMap::new()) }
    }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(map_err)?;
        Ok(Self::new(client))
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    async fn rediscover(&self) -> Result<Vec<DiscoveredResource>, ClusterError> {
        let t0 = std::time::Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(map_err)?;
        let mut served = Served::new();
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                out.push(DiscoveredResource { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone(), namespaced });
                served.insert((ar.group.clone(), ar.kind.clone()), (ar, namespaced));
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        info!(kinds = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery refreshed");
        *self.served.write().await = served;
        Ok(out)
    }

    /// Resolve `(group, kind)` against cached discovery, refreshing it once on a miss.
    async fn resource(&self, group: &str, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        let key = (group.to_string(), kind.to_string());
        if let Some(found) = self.served.read().await.get(&key) {
            return Ok(found.clone());
        }
        self.rediscover().await?;
        self.served
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("kind not served: {}/{}", group, kind)))
    }

    async fn api_for_scope(&self, scope: &KindScope) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (mut ar, namespaced) = self.resource(&scope.kind.group, &scope.kind.kind).await?;
        if ar.version != scope.kind.version {
            ar = ApiResource::from_gvk_with_plural(
                &kube::core::GroupVersionKind::gvk(&scope.kind.group, &scope.kind.version, &scope.kind.kind),
                &ar.plural,
            );
        }
        let api = match (&scope.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    async fn api_for_identity(&self, identity: &ResourceIdentity) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, namespaced) = self.resource(&identity.api_group, &identity.kind).await?;
        let api = match (&identity.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (None, true) => return Err(ClusterError::Invalid("namespace required for namespaced kind".into())),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}

fn map_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            409 => ClusterError::Conflict(resp.message),
            404 => ClusterError::NotFound(resp.message),
            410 => ClusterError::Gone(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            _ => ClusterError::Unavailable(format!("{} ({})", resp.message, resp.code)),
        },
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn record_from(mut obj: DynamicObject, ar: &ApiResource) -> Result<ResourceRecord, ClusterError> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    let mut raw = serde_json::to_value(&obj).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    ResourceRecord::from_document(raw).map_err(|e| ClusterError::Invalid(e.to_string()))
}

fn object_from(doc: Document) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(doc).map_err(|e| ClusterError::Invalid(format!("not a kubernetes object: {}", e)))
}

fn translate(ev: KubeWatchEvent<DynamicObject>, ar: &ApiResource) -> Result<WatchEvent, ClusterError> {
    Ok(match ev {
        KubeWatchEvent::Added(o) => WatchEvent::Added(record_from(o, ar)?),
        KubeWatchEvent::Modified(o) => WatchEvent::Modified(record_from(o, ar)?),
        KubeWatchEvent::Deleted(o) => WatchEvent::Deleted(record_from(o, ar)?),
        KubeWatchEvent::Bookmark(b) => WatchEvent::Bookmark(ConcurrencyToken::new(b.metadata.resource_version)),
        KubeWatchEvent::Error(resp) => WatchEvent::Error(map_err(kube::Error::Api(resp))),
    })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn kinds(&self) -> Result<Vec<DiscoveredResource>, ClusterError> { self.rediscover().await }

    async fn list(&self, scope: &KindScope) -> Result<ObjectList, ClusterError> {
        let (api, ar) = self.api_for_scope(scope).await?;
        let list = api.list(&ListParams::default()).await.map_err(map_err)?;
        let token = list
            .metadata
            .resource_version
            .clone()
            .filter(|s| !s.is_empty())
            .map(ConcurrencyToken::new)
            .ok_or_else(|| ClusterError::Invalid(format!("list of {} returned no resourceVersion", scope)))?;
        let mut items = Vec::with_capacity(list.items.len());
        for o in list.items {
            match record_from(o, &ar) {
                Ok(r) => items.push(r),
                Err(e) => warn!(scope = %scope, error = %e, "skipping unreadable listed object"),
            }
        }
        debug!(scope = %scope, count = items.len(), token = %token, "listed");
        Ok(ObjectList { items, token })
    }

    async fn watch(&self, scope: &KindScope, from: &ConcurrencyToken) -> Result<WatchStream, ClusterError> {
        let (api, ar) = self.api_for_scope(scope).await?;
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let version = from.as_str().to_string();
        // The request is made inside a task that owns the Api; the caller gets the receiving end.
        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<WatchEvent, ClusterError>>(256);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<(), ClusterError>>();
        tokio::spawn(async move {
            let stream = match api.watch(&wp, &version).await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(map_err(e)));
                    return;
                }
            };
            futures::pin_mut!(stream);
            loop {
                let item = match stream.try_next().await {
                    Ok(Some(ev)) => translate(ev, &ar),
                    Ok(None) => break,
                    Err(e) => Err(map_err(e)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        match ready_rx.await {
            Ok(Ok(())) => Ok(rx.boxed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClusterError::Unavailable("watch task ended before the request completed".into())),
        }
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>, ClusterError> {
        let (api, ar) = self.api_for_identity(identity).await?;
        match api.get_opt(&identity.name).await.map_err(map_err)? {
            Some(o) => Ok(Some(record_from(o, &ar)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, doc: Document) -> Result<ResourceRecord, ClusterError> {
        let identity = ResourceIdentity::from_document(&doc).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let (api, ar) = self.api_for_identity(&identity).await?;
        let obj = object_from(doc)?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_err)?;
        record_from(created, &ar)
    }

    async fn replace(&self, doc: Document) -> Result<ResourceRecord, ClusterError> {
        let identity = ResourceIdentity::from_document(&doc).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let (api, ar) = self.api_for_identity(&identity).await?;
        let obj = object_from(doc)?;
        let replaced = api.replace(&identity.name, &PostParams::default(), &obj).await.map_err(map_err)?;
        record_from(replaced, &ar)
    }

    async fn delete(&self, identity: &ResourceIdentity, precondition: Option<&ConcurrencyToken>) -> Result<(), ClusterError> {
        let (api, _ar) = self.api_for_identity(identity).await?;
        let dp = DeleteParams {
            preconditions: precondition.map(|t| Preconditions { resource_version: Some(t.as_str().to_string()), uid: None }),
            ..DeleteParams::default()
        };
        api.delete(&identity.name, &dp).await.map_err(map_err)?;
        Ok(())
    }
}
