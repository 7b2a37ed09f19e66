//! Magnitude graph builder.
//!
//! A graph is a pure function of one cache snapshot: nodes are every cached
//! resource, edges are ownership (`ownerReferences`), namespace containment and
//! kind-specific references found by the [`ExtractorRegistry`]. Nothing here is
//! stored; each build starts from scratch.

#![forbid(unsafe_code)]

pub mod extract;

use std::collections::VecDeque;
use std::time::Instant;

use metrics::histogram;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use magnitude_core::{split_api_version, ResourceIdentity, ResourceRecord};
use magnitude_store::CacheSnapshot;

pub use extract::{Extractor, ExtractorRegistry, GraphContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Owns,
    References,
    Contains,
}

/// What a client needs to draw a node without fetching the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    pub label: String,
    pub kind: String,
    pub api_group: String,
    pub namespace: Option<String>,
    pub token: String,
    /// `status.phase` when present, `Terminating` while a deletion is pending.
    pub phase: Option<String>,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub identity: ResourceIdentity,
    pub display: DisplayMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: ResourceIdentity,
    pub to: ResourceIdentity,
    pub relation: RelationKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    /// Cache epoch the graph was built from.
    pub epoch: u64,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn node(&self, identity: &ResourceIdentity) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.identity == identity)
    }

    pub fn edges_from<'a>(&'a self, identity: &'a ResourceIdentity) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| &e.from == identity)
    }

    pub fn edges_to<'a>(&'a self, identity: &'a ResourceIdentity) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| &e.to == identity)
    }

    /// Subgraph of everything within `depth` hops of `center`, following edges in
    /// either direction. Empty when `center` is not in the graph.
    pub fn neighbourhood(&self, center: &ResourceIdentity, depth: usize) -> Graph {
        if self.node(center).is_none() {
            return Graph { epoch: self.epoch, ..Graph::default() };
        }
        let mut adjacent: FxHashMap<&ResourceIdentity, Vec<&ResourceIdentity>> = FxHashMap::default();
        for e in &self.edges {
            adjacent.entry(&e.from).or_default().push(&e.to);
            adjacent.entry(&e.to).or_default().push(&e.from);
        }
        let mut seen: FxHashSet<&ResourceIdentity> = FxHashSet::default();
        seen.insert(center);
        let mut queue = VecDeque::from([(center, 0usize)]);
        while let Some((id, d)) = queue.pop_front() {
            if d == depth {
                continue;
            }
            for next in adjacent.get(id).into_iter().flatten() {
                if seen.insert(*next) {
                    queue.push_back((*next, d + 1));
                }
            }
        }
        Graph {
            epoch: self.epoch,
            nodes: self.nodes.iter().filter(|n| seen.contains(&n.identity)).cloned().collect(),
            edges: self.edges.iter().filter(|e| seen.contains(&e.from) && seen.contains(&e.to)).cloned().collect(),
        }
    }
}

/// Builds graphs from snapshots using a fixed extractor registry.
#[derive(Clone, Default)]
pub struct GraphBuilder {
    registry: ExtractorRegistry,
}

impl GraphBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn with_registry(registry: ExtractorRegistry) -> Self { Self { registry } }

    pub fn registry_mut(&mut self) -> &mut ExtractorRegistry { &mut self.registry }

    pub fn build(&self, snapshot: &CacheSnapshot) -> Graph {
        let t0 = Instant::now();
        let ctx = GraphContext::new(snapshot);
        let nodes: Vec<GraphNode> = snapshot
            .iter()
            .map(|r| GraphNode { identity: r.identity.clone(), display: display_of(r) })
            .collect();

        let mut edges: Vec<GraphEdge> = Vec::new();
        for rec in snapshot.iter() {
            for parent in owners_of(rec, &ctx) {
                edges.push(GraphEdge { from: parent, to: rec.identity.clone(), relation: RelationKind::Owns });
            }
            if let Some(ns) = rec.identity.namespace_identity() {
                edges.push(GraphEdge { from: ns, to: rec.identity.clone(), relation: RelationKind::Contains });
            }
            for target in self.registry.extract(rec, &ctx) {
                edges.push(GraphEdge { from: rec.identity.clone(), to: target, relation: RelationKind::References });
            }
        }
        let total = edges.len();
        edges.retain(|e| e.from != e.to && snapshot.contains(&e.from) && snapshot.contains(&e.to));
        edges.sort();
        edges.dedup();

        let took = t0.elapsed();
        histogram!("graph_build_ms", took.as_secs_f64() * 1000.0);
        debug!(
            epoch = snapshot.epoch(),
            nodes = nodes.len(),
            edges = edges.len(),
            dropped = total.saturating_sub(edges.len()),
            took_ms = %took.as_millis(),
            "graph built"
        );
        Graph { epoch: snapshot.epoch(), nodes, edges }
    }
}

fn display_of(rec: &ResourceRecord) -> DisplayMetadata {
    let id = &rec.identity;
    let label = match &id.namespace {
        Some(ns) => format!("{}/{}", ns, id.name),
        None => id.name.clone(),
    };
    let terminating = rec.metadata().map(|m| m.contains_key("deletionTimestamp")).unwrap_or(false);
    let phase = if terminating {
        Some("Terminating".to_string())
    } else {
        rec.status.get("phase").and_then(|p| p.as_str()).map(str::to_string)
    };
    DisplayMetadata {
        label,
        kind: id.kind.clone(),
        api_group: id.api_group.clone(),
        namespace: id.namespace.clone(),
        token: rec.token.to_string(),
        phase,
        labels: rec.labels().into_iter().collect(),
    }
}

/// Owners named by `metadata.ownerReferences`, resolved by uid when the owner is
/// cached, otherwise by (group, kind, name) in the child's namespace and then at
/// cluster scope.
fn owners_of(rec: &ResourceRecord, ctx: &GraphContext<'_>) -> Vec<ResourceIdentity> {
    let Some(refs) = rec.metadata().and_then(|m| m.get("ownerReferences")).and_then(|o| o.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(refs.len());
    for r in refs {
        if let Some(found) = r.get("uid").and_then(|u| u.as_str()).and_then(|u| Uuid::parse_str(u).ok()).and_then(|uid| ctx.by_uid(uid.as_bytes())) {
            out.push(found.clone());
            continue;
        }
        let kind = r.get("kind").and_then(|x| x.as_str()).unwrap_or("");
        let name = r.get("name").and_then(|x| x.as_str()).unwrap_or("");
        if kind.is_empty() || name.is_empty() {
            continue;
        }
        let (group, _version) = split_api_version(r.get("apiVersion").and_then(|x| x.as_str()).unwrap_or(""));
        let namespaced = ResourceIdentity::new(group, kind, rec.identity.namespace.as_deref(), name);
        if ctx.contains(&namespaced) {
            out.push(namespaced);
        } else {
            let cluster = ResourceIdentity::new(group, kind, None, name);
            if ctx.contains(&cluster) {
                out.push(cluster);
            }
        }
    }
    out
}
