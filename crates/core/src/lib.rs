//! Magnitude core types: resource identities, concurrency tokens, cached records
//! and the error taxonomy shared by every engine component.

#![forbid(unsafe_code)]

pub mod config;
mod error;

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use uuid::Uuid;

pub use config::{DocumentLimits, EngineConfig};
pub use error::{SyncError, SyncResult};

/// Generic, schema-less resource document. Maps keep insertion order.
pub type Document = Json;

pub type Uid = [u8; 16];

/// Unique key of a cluster resource. Ordering is (group, kind, namespace, name),
/// which is also the order of cache snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(api_group: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { api_group: api_group.into(), kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn is_namespaced(&self) -> bool { self.namespace.is_some() }

    /// Identity of the Namespace object this resource lives in, if any.
    pub fn namespace_identity(&self) -> Option<ResourceIdentity> {
        self.namespace.as_deref().map(|ns| ResourceIdentity::new("", "Namespace", None, ns))
    }

    /// Extract the identity from a full document (`apiVersion`, `kind`, `metadata.name`,
    /// optional `metadata.namespace`).
    pub fn from_document(doc: &Document) -> SyncResult<Self> {
        let api_version = doc
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::MalformedDocument("missing apiVersion".into()))?;
        let kind = doc
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::MalformedDocument("missing kind".into()))?;
        let meta = doc.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::MalformedDocument("missing metadata.name".into()))?;
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let (group, _version) = split_api_version(api_version);
        Ok(ResourceIdentity::new(group, kind, namespace, name))
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.api_group.is_empty() {
            write!(f, "{}/", self.api_group)?;
        }
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Split `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Opaque version marker assigned by the cluster (Kubernetes `resourceVersion`).
///
/// Tokens are ordered by length first and then bytewise. For the decimal strings
/// the API server hands out this equals numeric order; for anything else it is
/// still a total order consistent with equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_newer_than(&self, other: &ConcurrencyToken) -> bool { self > other }
}

impl Ord for ConcurrencyToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.len().cmp(&other.0.len()).then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for ConcurrencyToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ConcurrencyToken {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Last known state of one resource, as held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub identity: ResourceIdentity,
    pub api_version: String,
    pub uid: Option<Uid>,
    pub token: ConcurrencyToken,
    /// Whole document without `status` (metadata included).
    pub spec: Document,
    /// Server-populated status subtree; `null` when the object has none.
    pub status: Document,
    pub observed_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Build a record from a server-returned document. The document must carry
    /// `metadata.resourceVersion`.
    pub fn from_document(mut doc: Document) -> SyncResult<Self> {
        let identity = ResourceIdentity::from_document(&doc)?;
        let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let meta = doc.get("metadata");
        let token = meta
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ConcurrencyToken::new)
            .ok_or_else(|| SyncError::MalformedDocument(format!("{} has no metadata.resourceVersion", identity)))?;
        let uid = meta
            .and_then(|m| m.get("uid"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(|u| *u.as_bytes());
        let status = doc.as_object_mut().and_then(|o| o.remove("status")).unwrap_or(Json::Null);
        Ok(Self { identity, api_version, uid, token, spec: doc, status, observed_at: Utc::now() })
    }

    /// Full document (spec plus status, status last).
    pub fn to_document(&self) -> Document {
        let mut doc = self.spec.clone();
        if !self.status.is_null() {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("status".into(), self.status.clone());
            }
        }
        doc
    }

    pub fn metadata(&self) -> Option<&serde_json::Map<String, Json>> {
        self.spec.get("metadata").and_then(|m| m.as_object())
    }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        let mut out = SmallVec::new();
        if let Some(lbls) = self.metadata().and_then(|m| m.get("labels")).and_then(|l| l.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() {
                    out.push((k.clone(), val.to_string()));
                }
            }
        }
        out
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(|v| v.as_str())
    }
}

/// A YAML edit submitted by the presentation layer. `base_token = None` asks for a create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditProposal {
    pub identity: ResourceIdentity,
    pub proposed_yaml: String,
    pub base_token: Option<ConcurrencyToken>,
}

/// Group/Version/Kind of a watched resource stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchedKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl WatchedKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = key.trim().split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(SyncError::MalformedDocument(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn matches(&self, identity: &ResourceIdentity) -> bool {
        self.group == identity.api_group && self.kind == identity.kind
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// A watched kind narrowed to an optional namespace. This is the unit the watcher
/// lists and the cache replaces on re-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindScope {
    pub kind: WatchedKind,
    pub namespace: Option<String>,
}

impl KindScope {
    pub fn new(kind: WatchedKind, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()) }
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        if !self.kind.matches(identity) {
            return false;
        }
        match &self.namespace {
            Some(ns) => identity.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for KindScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind.key(), self.namespace.as_deref().unwrap_or("(all)"))
    }
}

pub mod prelude {
    pub use super::{
        ConcurrencyToken, Document, EditProposal, KindScope, ResourceIdentity, ResourceRecord, SyncError, SyncResult, WatchedKind,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_order_is_numeric_for_decimal_versions() {
        let t = |s: &str| ConcurrencyToken::new(s);
        assert!(t("10").is_newer_than(&t("9")));
        assert!(t("100") > t("99"));
        assert!(!t("5").is_newer_than(&t("5")));
        assert_eq!(t("42").cmp(&t("42")), Ordering::Equal);
    }

    #[test]
    fn identity_from_document_reads_group_and_namespace() {
        let doc = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" }
        });
        let id = ResourceIdentity::from_document(&doc).unwrap();
        assert_eq!(id, ResourceIdentity::new("apps", "Deployment", Some("prod"), "web"));
        assert_eq!(id.to_string(), "apps/Deployment prod/web");
    }

    #[test]
    fn identity_errors_name_the_missing_field() {
        let e = ResourceIdentity::from_document(&serde_json::json!({ "kind": "Pod", "metadata": { "name": "x" } })).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "e={}", e);
        let e = ResourceIdentity::from_document(&serde_json::json!({ "apiVersion": "v1", "metadata": { "name": "x" } })).unwrap_err();
        assert!(e.to_string().contains("missing kind"), "e={}", e);
        let e = ResourceIdentity::from_document(&serde_json::json!({ "apiVersion": "v1", "kind": "Pod", "metadata": {} })).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn record_splits_status_and_parses_uid() {
        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "foo",
                "namespace": "ns",
                "resourceVersion": "5",
                "uid": "6f1a4f8e-2c1b-4b7e-9a53-0c8b2b7a9d10"
            },
            "spec": { "containers": [] },
            "status": { "phase": "Running" }
        });
        let rec = ResourceRecord::from_document(doc.clone()).unwrap();
        assert_eq!(rec.token.as_str(), "5");
        assert!(rec.uid.is_some());
        assert!(rec.spec.get("status").is_none());
        assert_eq!(rec.status["phase"], "Running");
        assert_eq!(rec.to_document(), doc);
    }

    #[test]
    fn record_requires_resource_version() {
        let doc = serde_json::json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "foo" } });
        assert!(matches!(ResourceRecord::from_document(doc), Err(SyncError::MalformedDocument(_))));
    }

    #[test]
    fn gvk_keys_parse_and_render() {
        let k = WatchedKind::parse("apps/v1/Deployment").unwrap();
        assert_eq!(k.group, "apps");
        assert_eq!(k.key(), "apps/v1/Deployment");
        assert_eq!(WatchedKind::parse("v1/Pod").unwrap().api_version(), "v1");
        assert!(WatchedKind::parse("Pod").is_err());
        let scope = KindScope::new(WatchedKind::parse("v1/Pod").unwrap(), Some("ns"));
        assert!(scope.contains(&ResourceIdentity::new("", "Pod", Some("ns"), "a")));
        assert!(!scope.contains(&ResourceIdentity::new("", "Pod", Some("other"), "a")));
        assert!(!scope.contains(&ResourceIdentity::new("", "ConfigMap", Some("ns"), "a")));
    }
}
