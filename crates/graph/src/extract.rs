//! Reference extractors: which other resources a record points at.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use magnitude_core::{ResourceIdentity, ResourceRecord, Uid};
use magnitude_store::CacheSnapshot;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Read-only lookups available to extractors while a graph is being built.
pub struct GraphContext<'a> {
    snapshot: &'a CacheSnapshot,
    by_uid: FxHashMap<Uid, &'a ResourceIdentity>,
}

impl<'a> GraphContext<'a> {
    pub fn new(snapshot: &'a CacheSnapshot) -> Self {
        let mut by_uid = FxHashMap::default();
        for rec in snapshot.iter() {
            if let Some(uid) = rec.uid {
                by_uid.insert(uid, &rec.identity);
            }
        }
        Self { snapshot, by_uid }
    }

    pub fn snapshot(&self) -> &'a CacheSnapshot { self.snapshot }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool { self.snapshot.contains(identity) }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<&'a Arc<ResourceRecord>> {
        let snap: &'a CacheSnapshot = self.snapshot;
        snap.get(identity)
    }

    pub fn by_uid(&self, uid: &Uid) -> Option<&'a ResourceIdentity> { self.by_uid.get(uid).copied() }

    /// Records of one kind, optionally narrowed to a namespace.
    pub fn of_kind_in(&self, group: &'a str, kind: &'a str, namespace: Option<&'a str>) -> impl Iterator<Item = &'a Arc<ResourceRecord>> + 'a {
        let snap: &'a CacheSnapshot = self.snapshot;
        snap.of_kind(group, kind)
            .filter(move |r| namespace.is_none() || r.identity.namespace.as_deref() == namespace)
    }
}

pub type Extractor = Arc<dyn Fn(&ResourceRecord, &GraphContext<'_>) -> Vec<ResourceIdentity> + Send + Sync>;

/// Extractors keyed by kind. A kind may have several; their results are concatenated.
#[derive(Clone)]
pub struct ExtractorRegistry {
    by_kind: FxHashMap<String, Vec<Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self { Self::with_builtins() }
}

impl ExtractorRegistry {
    pub fn empty() -> Self { Self { by_kind: FxHashMap::default() } }

    /// Registry preloaded with the core Kubernetes relationships.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register("Pod", |r, _| pod_spec_refs(r.spec.get("spec"), r.identity.namespace.as_deref()));
        for kind in ["Deployment", "ReplicaSet", "StatefulSet", "DaemonSet", "Job"] {
            reg.register(kind, |r, _| pod_spec_refs(template_spec(r.spec.get("spec")), r.identity.namespace.as_deref()));
        }
        reg.register("CronJob", |r, _| {
            let job = r.spec.get("spec").and_then(|s| s.get("jobTemplate")).and_then(|j| j.get("spec"));
            pod_spec_refs(template_spec(job), r.identity.namespace.as_deref())
        });
        reg.register("Service", service_pods);
        reg.register("Ingress", ingress_refs);
        reg.register("PersistentVolumeClaim", |r, _| {
            str_at(r.spec.get("spec"), &["volumeName"])
                .map(|pv| vec![ResourceIdentity::new("", "PersistentVolume", None, pv)])
                .unwrap_or_default()
        });
        reg.register("RoleBinding", binding_refs);
        reg.register("ClusterRoleBinding", binding_refs);
        reg
    }

    pub fn register<F>(&mut self, kind: &str, f: F) -> &mut Self
    where
        F: Fn(&ResourceRecord, &GraphContext<'_>) -> Vec<ResourceIdentity> + Send + Sync + 'static,
    {
        self.by_kind.entry(kind.to_string()).or_default().push(Arc::new(f));
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.by_kind.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    pub fn extract(&self, record: &ResourceRecord, ctx: &GraphContext<'_>) -> Vec<ResourceIdentity> {
        match self.by_kind.get(&record.identity.kind) {
            Some(fs) => fs.iter().flat_map(|f| f(record, ctx)).collect(),
            None => Vec::new(),
        }
    }
}

fn str_at<'a>(v: Option<&'a Json>, path: &[&str]) -> Option<&'a str> {
    let mut cur = v?;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str().filter(|s| !s.is_empty())
}

fn array<'a>(v: Option<&'a Json>, key: &str) -> impl Iterator<Item = &'a Json> + 'a {
    v.and_then(|x| x.get(key)).and_then(|a| a.as_array()).into_iter().flatten()
}

fn template_spec(workload_spec: Option<&Json>) -> Option<&Json> {
    workload_spec.and_then(|s| s.get("template")).and_then(|t| t.get("spec"))
}

/// ConfigMaps, Secrets, PVCs and the ServiceAccount a pod spec mounts or reads.
fn pod_spec_refs(spec: Option<&Json>, ns: Option<&str>) -> Vec<ResourceIdentity> {
    let mut out = Vec::new();
    let Some(spec) = spec else { return out };
    let cm = |name: &str| ResourceIdentity::new("", "ConfigMap", ns, name);
    let secret = |name: &str| ResourceIdentity::new("", "Secret", ns, name);

    for vol in array(Some(spec), "volumes") {
        if let Some(n) = str_at(Some(vol), &["configMap", "name"]) {
            out.push(cm(n));
        }
        if let Some(n) = str_at(Some(vol), &["secret", "secretName"]) {
            out.push(secret(n));
        }
        if let Some(n) = str_at(Some(vol), &["persistentVolumeClaim", "claimName"]) {
            out.push(ResourceIdentity::new("", "PersistentVolumeClaim", ns, n));
        }
        for src in array(vol.get("projected"), "sources") {
            if let Some(n) = str_at(Some(src), &["configMap", "name"]) {
                out.push(cm(n));
            }
            if let Some(n) = str_at(Some(src), &["secret", "name"]) {
                out.push(secret(n));
            }
        }
    }

    let containers = ["containers", "initContainers", "ephemeralContainers"].into_iter().flat_map(|k| array(Some(spec), k));
    for c in containers {
        for from in array(Some(c), "envFrom") {
            if let Some(n) = str_at(Some(from), &["configMapRef", "name"]) {
                out.push(cm(n));
            }
            if let Some(n) = str_at(Some(from), &["secretRef", "name"]) {
                out.push(secret(n));
            }
        }
        for env in array(Some(c), "env") {
            if let Some(n) = str_at(Some(env), &["valueFrom", "configMapKeyRef", "name"]) {
                out.push(cm(n));
            }
            if let Some(n) = str_at(Some(env), &["valueFrom", "secretKeyRef", "name"]) {
                out.push(secret(n));
            }
        }
    }

    for ps in array(Some(spec), "imagePullSecrets") {
        if let Some(n) = str_at(Some(ps), &["name"]) {
            out.push(secret(n));
        }
    }
    if let Some(sa) = str_at(Some(spec), &["serviceAccountName"]).or_else(|| str_at(Some(spec), &["serviceAccount"])) {
        out.push(ResourceIdentity::new("", "ServiceAccount", ns, sa));
    }
    out
}

fn service_pods(rec: &ResourceRecord, ctx: &GraphContext<'_>) -> Vec<ResourceIdentity> {
    let Some(selector) = rec.spec.get("spec").and_then(|s| s.get("selector")).and_then(|s| s.as_object()) else {
        return Vec::new();
    };
    if selector.is_empty() {
        return Vec::new();
    }
    let wanted: Vec<(&str, &str)> = selector.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v))).collect();
    ctx.of_kind_in("", "Pod", rec.identity.namespace.as_deref())
        .filter(|pod| wanted.iter().all(|(k, v)| pod.label(k) == Some(*v)))
        .map(|pod| pod.identity.clone())
        .collect()
}

fn ingress_refs(rec: &ResourceRecord, _ctx: &GraphContext<'_>) -> Vec<ResourceIdentity> {
    let ns = rec.identity.namespace.as_deref();
    let spec = rec.spec.get("spec");
    let svc = |b: &Json| {
        str_at(Some(b), &["service", "name"])
            .or_else(|| str_at(Some(b), &["serviceName"]))
            .map(|n| ResourceIdentity::new("", "Service", ns, n))
    };
    let mut out = Vec::new();
    for key in ["defaultBackend", "backend"] {
        if let Some(id) = spec.and_then(|s| s.get(key)).and_then(svc) {
            out.push(id);
        }
    }
    for rule in array(spec, "rules") {
        for path in array(rule.get("http"), "paths") {
            if let Some(id) = path.get("backend").and_then(svc) {
                out.push(id);
            }
        }
    }
    for tls in array(spec, "tls") {
        if let Some(n) = str_at(Some(tls), &["secretName"]) {
            out.push(ResourceIdentity::new("", "Secret", ns, n));
        }
    }
    out
}

fn binding_refs(rec: &ResourceRecord, _ctx: &GraphContext<'_>) -> Vec<ResourceIdentity> {
    let ns = rec.identity.namespace.as_deref();
    let mut out = Vec::new();
    for subject in array(Some(&rec.spec), "subjects") {
        if str_at(Some(subject), &["kind"]) != Some("ServiceAccount") {
            continue;
        }
        if let Some(name) = str_at(Some(subject), &["name"]) {
            let sub_ns = str_at(Some(subject), &["namespace"]).or(ns);
            out.push(ResourceIdentity::new("", "ServiceAccount", sub_ns, name));
        }
    }
    let role_ref = rec.spec.get("roleRef");
    if let Some(name) = str_at(role_ref, &["name"]) {
        match str_at(role_ref, &["kind"]) {
            Some("ClusterRole") => out.push(ResourceIdentity::new(RBAC_GROUP, "ClusterRole", None, name)),
            Some("Role") => out.push(ResourceIdentity::new(RBAC_GROUP, "Role", ns, name)),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_spec_refs_cover_volumes_env_and_pull_secrets() {
        let spec = serde_json::json!({
            "serviceAccountName": "runner",
            "imagePullSecrets": [ { "name": "regcred" } ],
            "volumes": [
                { "name": "a", "configMap": { "name": "cfg" } },
                { "name": "b", "secret": { "secretName": "tls" } },
                { "name": "c", "persistentVolumeClaim": { "claimName": "data" } },
                { "name": "d", "projected": { "sources": [ { "configMap": { "name": "proj-cfg" } }, { "secret": { "name": "proj-sec" } } ] } }
            ],
            "initContainers": [ { "name": "init", "envFrom": [ { "secretRef": { "name": "init-env" } } ] } ],
            "containers": [ {
                "name": "main",
                "envFrom": [ { "configMapRef": { "name": "env-cfg" } } ],
                "env": [ { "name": "PW", "valueFrom": { "secretKeyRef": { "name": "pw", "key": "k" } } } ]
            } ]
        });
        let refs = pod_spec_refs(Some(&spec), Some("ns"));
        let names: Vec<String> = refs.iter().map(|r| format!("{}/{}", r.kind, r.name)).collect();
        for want in [
            "ConfigMap/cfg",
            "Secret/tls",
            "PersistentVolumeClaim/data",
            "ConfigMap/proj-cfg",
            "Secret/proj-sec",
            "Secret/init-env",
            "ConfigMap/env-cfg",
            "Secret/pw",
            "Secret/regcred",
            "ServiceAccount/runner",
        ] {
            assert!(names.iter().any(|n| n == want), "missing {} in {:?}", want, names);
        }
        assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("ns")));
    }

    #[test]
    fn custom_kinds_can_be_registered() {
        let mut reg = ExtractorRegistry::empty();
        reg.register("Widget", |r, _| vec![ResourceIdentity::new("", "ConfigMap", r.identity.namespace.as_deref(), "widget-cfg")]);
        assert_eq!(reg.kinds(), vec!["Widget"]);
        let rec = ResourceRecord::from_document(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "w", "namespace": "ns", "resourceVersion": "1" }
        }))
        .unwrap();
        let snap = CacheSnapshot::default();
        let ctx = GraphContext::new(&snap);
        assert_eq!(reg.extract(&rec, &ctx), vec![ResourceIdentity::new("", "ConfigMap", Some("ns"), "widget-cfg")]);
    }
}
