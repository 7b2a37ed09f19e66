//! Engine configuration read from `MAGNITUDE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::WatchedKind;

const DEFAULT_WATCH_KINDS: &str =
    "v1/Namespace,v1/Pod,v1/ConfigMap,v1/Secret,v1/Service,v1/ServiceAccount,v1/PersistentVolumeClaim,apps/v1/Deployment,apps/v1/ReplicaSet,apps/v1/StatefulSet,apps/v1/DaemonSet";

/// Size guards applied to user-submitted YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub watch_kinds: Vec<WatchedKind>,
    /// Restrict watches to one namespace (cluster-scoped kinds ignore it).
    pub namespace: Option<String>,
    pub watch_backoff_initial: Duration,
    pub watch_backoff_max: Duration,
    /// Server-side timeout requested for each watch call.
    pub watch_timeout_secs: u32,
    /// Default timeout for one mutation when the caller supplies none.
    pub apply_timeout: Duration,
    pub limits: DocumentLimits,
    /// Capacity of the cache change-notification channel.
    pub event_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watch_kinds: parse_kinds(DEFAULT_WATCH_KINDS),
            namespace: None,
            watch_backoff_initial: Duration::from_millis(250),
            watch_backoff_max: Duration::from_secs(30),
            watch_timeout_secs: 290,
            apply_timeout: Duration::from_secs(30),
            limits: DocumentLimits::default(),
            event_cap: 2048,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `MAGNITUDE_*` variables present in the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(s) = std::env::var("MAGNITUDE_WATCH_KINDS") {
            let kinds = parse_kinds(&s);
            if kinds.is_empty() {
                warn!(value = %s, "MAGNITUDE_WATCH_KINDS has no valid entries; keeping defaults");
            } else {
                cfg.watch_kinds = kinds;
            }
        }
        cfg.namespace = std::env::var("MAGNITUDE_NAMESPACE").ok().filter(|s| !s.is_empty());
        if let Some(ms) = env_parse::<u64>("MAGNITUDE_WATCH_BACKOFF_INITIAL_MS") {
            cfg.watch_backoff_initial = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_parse::<u64>("MAGNITUDE_WATCH_BACKOFF_MAX_SECS") {
            cfg.watch_backoff_max = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u32>("MAGNITUDE_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("MAGNITUDE_APPLY_TIMEOUT_SECS") {
            cfg.apply_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("MAGNITUDE_MAX_YAML_BYTES") {
            cfg.limits.max_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("MAGNITUDE_MAX_YAML_NODES") {
            cfg.limits.max_nodes = n;
        }
        if let Some(n) = env_parse::<usize>("MAGNITUDE_EVENT_CAP") {
            cfg.event_cap = n.max(16);
        }
        cfg
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

/// Parse a comma separated list of gvk keys, skipping invalid entries.
pub fn parse_kinds(s: &str) -> Vec<WatchedKind> {
    let mut out = Vec::new();
    for key in s.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        match WatchedKind::parse(key) {
            Ok(k) => {
                if !out.contains(&k) {
                    out.push(k);
                }
            }
            Err(e) => warn!(key, error = %e, "skipping watch kind"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_kinds_include_namespace_and_pod() {
        let cfg = EngineConfig::default();
        assert!(cfg.watch_kinds.iter().any(|k| k.key() == "v1/Namespace"));
        assert!(cfg.watch_kinds.iter().any(|k| k.key() == "v1/Pod"));
        assert!(cfg.watch_backoff_initial < cfg.watch_backoff_max);
    }

    #[test]
    fn parse_kinds_skips_garbage_and_duplicates() {
        let kinds = parse_kinds("v1/Pod, nonsense ,apps/v1/Deployment,v1/Pod,");
        let keys: Vec<String> = kinds.iter().map(|k| k.key()).collect();
        assert_eq!(keys, vec!["v1/Pod".to_string(), "apps/v1/Deployment".to_string()]);
    }
}
