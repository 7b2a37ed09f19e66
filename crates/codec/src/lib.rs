//! Magnitude resource codec: wire documents <-> canonical YAML.
//!
//! `decode` turns user YAML into a [`Document`] and validates that it names a
//! resource. `encode` renders a document with a deterministic key order and, for
//! editing, without status and server-managed metadata.

#![forbid(unsafe_code)]

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use magnitude_core::{Document, DocumentLimits, ResourceIdentity, ResourceRecord, SyncError, SyncResult};

const ROOT_ORDER: &[&str] = &["apiVersion", "kind", "metadata", "spec", "data", "stringData", "binaryData"];
const METADATA_ORDER: &[&str] = &["name", "generateName", "namespace", "labels", "annotations", "ownerReferences", "finalizers"];
const SERVER_METADATA: &[&str] = &[
    "resourceVersion",
    "managedFields",
    "uid",
    "generation",
    "creationTimestamp",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid namespace regex"));
// Names only have to be valid path segments; some kinds (RBAC) allow ':' and upper case.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^/%\s]+$").expect("valid name regex"));

fn malformed(msg: impl Into<String>) -> SyncError {
    counter!("codec_decode_err", 1u64);
    SyncError::MalformedDocument(msg.into())
}

/// Decode YAML text with default size limits.
pub fn decode(yaml: &str) -> SyncResult<Document> {
    decode_with(yaml, &DocumentLimits::default())
}

/// Decode a single YAML document into a structured document.
///
/// Fails with `MalformedDocument` on invalid syntax, a non-mapping root, more
/// than one document, exceeded size limits, or missing/invalid identity fields.
pub fn decode_with(yaml: &str, limits: &DocumentLimits) -> SyncResult<Document> {
    if yaml.len() > limits.max_bytes {
        return Err(malformed(format!("YAML payload too large (>{} bytes)", limits.max_bytes)));
    }
    let mut values: Vec<serde_yaml::Value> = Vec::with_capacity(1);
    for de in serde_yaml::Deserializer::from_str(yaml) {
        let v = serde_yaml::Value::deserialize(de).map_err(|e| malformed(format!("parsing YAML: {}", e)))?;
        values.push(v);
        if values.len() > 1 {
            return Err(malformed("expected a single YAML document"));
        }
    }
    let val = match values.pop() {
        Some(v) if !v.is_null() => v,
        _ => return Err(malformed("empty YAML document")),
    };
    let json = serde_json::to_value(val).map_err(|e| malformed(format!("converting YAML to JSON: {}", e)))?;
    if !json.is_object() {
        return Err(malformed("document root must be a mapping"));
    }
    if json_node_budget_exceeded(&json, limits.max_nodes) {
        return Err(malformed(format!("YAML document too complex (>{} nodes)", limits.max_nodes)));
    }
    validate_identity(&json)?;
    Ok(json)
}

/// Identity named by a decoded document.
pub fn identity_of(doc: &Document) -> SyncResult<ResourceIdentity> {
    validate_identity(doc)
}

fn validate_identity(doc: &Json) -> SyncResult<ResourceIdentity> {
    let id = ResourceIdentity::from_document(doc).map_err(|e| {
        counter!("codec_decode_err", 1u64);
        e
    })?;
    if id.name.len() > 253 || id.name == "." || id.name == ".." || !NAME_RE.is_match(&id.name) {
        return Err(malformed(format!("invalid metadata.name {:?}", id.name)));
    }
    if let Some(ns) = id.namespace.as_deref() {
        if ns.len() > 63 || !NAMESPACE_RE.is_match(ns) {
            return Err(malformed(format!("invalid metadata.namespace {:?}", ns)));
        }
    }
    Ok(id)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Stops one past the budget; that is enough to tell "over" from "at".
    fn walk(v: &Json, cur: &mut usize, limit: usize) {
        if *cur >= limit { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= limit { break; }
                    walk(vv, cur, limit);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= limit { break; }
                    walk(vv, cur, limit);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max.saturating_add(1));
    count > max
}

/// Render a document as canonical YAML. With `include_status = false` the status
/// subtree and server-managed metadata are stripped first.
pub fn encode(doc: &Document, include_status: bool) -> SyncResult<String> {
    let canon = if include_status {
        canonicalize(doc)
    } else {
        let mut v = doc.clone();
        strip_server_fields(&mut v);
        canonicalize(&v)
    };
    serde_yaml::to_string(&canon).map_err(|e| SyncError::MalformedDocument(format!("rendering YAML: {}", e)))
}

pub fn encode_record(record: &ResourceRecord, include_status: bool) -> SyncResult<String> {
    if include_status {
        encode(&record.to_document(), true)
    } else {
        encode(&record.spec, false)
    }
}

/// Remove `status` and fields owned by the API server.
pub fn strip_server_fields(v: &mut Json) {
    let Some(obj) = v.as_object_mut() else { return };
    obj.remove("status");
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in SERVER_METADATA {
            meta.remove(*key);
        }
        let emptied = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(annos) => {
                annos.remove(LAST_APPLIED_ANNOTATION);
                annos.is_empty()
            }
            None => false,
        };
        if emptied {
            meta.remove("annotations");
        }
    }
}

#[derive(Clone, Copy)]
enum Level {
    Root,
    Metadata,
    Nested,
}

/// Deterministic key order: well-known keys first, remaining keys alphabetically,
/// `status` last at the root. Sequences keep their element order.
pub fn canonicalize(v: &Json) -> Json {
    canonical_at(v, Level::Root)
}

fn canonical_at(v: &Json, level: Level) -> Json {
    match v {
        Json::Object(map) => {
            let priority: &[&str] = match level {
                Level::Root => ROOT_ORDER,
                Level::Metadata => METADATA_ORDER,
                Level::Nested => &[],
            };
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| sort_key(a, priority, level).cmp(&sort_key(b, priority, level)));
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                let child_level = match level {
                    Level::Root if k == "metadata" => Level::Metadata,
                    _ => Level::Nested,
                };
                out.insert(k.clone(), canonical_at(&map[k.as_str()], child_level));
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(|i| canonical_at(i, Level::Nested)).collect()),
        other => other.clone(),
    }
}

fn sort_key<'a>(k: &'a str, priority: &[&str], level: Level) -> (usize, &'a str) {
    if matches!(level, Level::Root) && k == "status" {
        return (usize::MAX, k);
    }
    match priority.iter().position(|p| *p == k) {
        Some(i) => (i, ""),
        None => (priority.len(), k),
    }
}
