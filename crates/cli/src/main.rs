use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use magnitude_api::{Engine, EngineEvent, MagnitudeApi, ProposeOutcome};
use magnitude_core::{ConcurrencyToken, EngineConfig, ResourceIdentity, WatchedKind};
use magnitude_graph::{Graph, RelationKind};
use magnitude_kubehub::{ClusterApi, KubeCluster, CLUSTER_SCOPED_KINDS};

#[derive(Parser, Debug)]
#[command(name = "magctl", version, about = "Magnitude cluster state CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict to one namespace (default: all; `default` for single-object commands)
    #[arg(long = "ns", global = true, env = "MAGNITUDE_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds to wait for the initial sync before answering from a partial cache
    #[arg(long = "wait-secs", global = true, env = "MAGNITUDE_WAIT_SECS", default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Kinds,
    /// Print the resource graph of the watched kinds
    Graph {
        /// Only the neighbourhood of this object, e.g. "apps/v1/Deployment/web"
        #[arg(long = "focus")]
        focus: Option<String>,
        /// Hops from the focused object
        #[arg(long = "depth", default_value_t = 2)]
        depth: usize,
    },
    /// Print one object as canonical YAML
    Get {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        name: String,
        /// Include status and server-managed metadata
        #[arg(long = "status", action = ArgAction::SetTrue)]
        status: bool,
    },
    /// Apply an edited YAML document under optimistic concurrency
    Edit {
        gvk: String,
        name: String,
        /// YAML file, or "-" for stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Token the edit was based on (from `get`); omit to create
        #[arg(long = "token")]
        token: Option<String>,
        /// Check and summarize without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete one object
    Delete {
        gvk: String,
        name: String,
        /// Only delete if the object is still at this token
        #[arg(long = "token")]
        token: Option<String>,
    },
    /// Stream cache changes until Ctrl-C
    Watch,
    /// Per-kind watcher health
    Status,
}

fn init_tracing() {
    let env = std::env::var("MAGNITUDE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MAGNITUDE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MAGNITUDE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolve a GVK key and name to an identity; namespaced kinds default to `default`.
fn target(gvk: &str, name: &str, ns: Option<&str>) -> Result<(WatchedKind, ResourceIdentity)> {
    let kind = WatchedKind::parse(gvk).with_context(|| format!("parsing kind {}", gvk))?;
    let ns = if CLUSTER_SCOPED_KINDS.contains(&kind.kind.as_str()) { None } else { Some(ns.unwrap_or("default")) };
    let id = ResourceIdentity::new(kind.group.clone(), kind.kind.clone(), ns, name);
    Ok((kind, id))
}

/// Parse `gvk/name` as accepted by `--focus`.
fn focus_target(s: &str, ns: Option<&str>) -> Result<ResourceIdentity> {
    let (gvk, name) = s.rsplit_once('/').ok_or_else(|| anyhow!("expected <gvk>/<name>, got {}", s))?;
    Ok(target(gvk, name, ns)?.1)
}

/// Engine scoped to the object's kind and namespace only.
async fn engine_for(kind: &WatchedKind, id: &ResourceIdentity) -> Result<Arc<Engine>> {
    let cfg = EngineConfig { watch_kinds: vec![kind.clone()], namespace: id.namespace.clone(), ..EngineConfig::from_env() };
    Engine::connect(cfg).await
}

async fn synced(engine: &Engine, wait_secs: u64) {
    let t0 = Instant::now();
    if engine.wait_synced(Duration::from_secs(wait_secs)).await {
        info!(took_ms = %t0.elapsed().as_millis(), "initial sync complete");
    } else {
        warn!(wait_secs, "initial sync incomplete; results may be partial");
    }
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
        Ok(s)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
    }
}

fn relation_name(r: RelationKind) -> &'static str {
    match r {
        RelationKind::Owns => "owns",
        RelationKind::References => "references",
        RelationKind::Contains => "contains",
    }
}

fn print_graph(g: &Graph, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("KIND                     NAME                                     PHASE");
            for n in &g.nodes {
                let kind = if n.display.api_group.is_empty() { n.display.kind.clone() } else { format!("{}.{}", n.display.kind, n.display.api_group) };
                println!("{:<24} {:<40} {}", kind, n.display.label, n.display.phase.as_deref().unwrap_or("-"));
            }
            println!();
            for e in &g.edges {
                println!("{} -{}-> {}", e.from, relation_name(e.relation), e.to);
            }
            eprintln!("epoch={} nodes={} edges={}", g.epoch, g.nodes.len(), g.edges.len());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(g)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Kinds => {
            info!("kinds invoked");
            let cluster = KubeCluster::try_default().await.context("building kube client")?;
            let kinds = cluster.kinds().await.context("discovering kinds")?;
            match cli.output {
                Output::Human => {
                    for r in kinds {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Graph { focus, depth } => {
            info!(ns = ?ns, focus = ?focus, depth, "graph invoked");
            let cfg = EngineConfig { namespace: cli.namespace.clone(), ..EngineConfig::from_env() };
            let engine = Engine::connect(cfg).await?;
            synced(&engine, cli.wait_secs).await;
            let res = match focus {
                Some(f) => match focus_target(&f, ns) {
                    Ok(id) => engine.neighbourhood(&id, depth).await.map_err(anyhow::Error::from).and_then(|g| print_graph(&g, cli.output)),
                    Err(e) => Err(e),
                },
                None => engine.get_graph().await.map_err(anyhow::Error::from).and_then(|g| print_graph(&g, cli.output)),
            };
            engine.shutdown().await;
            res?;
        }
        Commands::Get { gvk, name, status } => {
            let (kind, id) = target(&gvk, &name, ns)?;
            info!(id = %id, status, "get invoked");
            let engine = engine_for(&kind, &id).await?;
            synced(&engine, cli.wait_secs).await;
            let res = engine.get_resource_yaml(&id, status).await;
            engine.shutdown().await;
            let doc = res?;
            match cli.output {
                Output::Human => {
                    eprintln!("# token: {}", doc.token);
                    print!("{}", doc.yaml);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
            }
        }
        Commands::Edit { gvk, name, file, token, dry_run } => {
            let (kind, id) = target(&gvk, &name, ns)?;
            let yaml = read_input(&file)?;
            let base = token.map(ConcurrencyToken::new);
            info!(id = %id, dry_run, base = ?base.as_ref().map(|t| t.as_str()), "edit invoked");
            let engine = engine_for(&kind, &id).await?;
            synced(&engine, cli.wait_secs).await;
            if dry_run {
                let res = engine.preview_edit(&id, &yaml, base).await;
                engine.shutdown().await;
                let summary = res?;
                match cli.output {
                    Output::Human => println!("dry-run {}: +{} ~{} -{}", id, summary.adds, summary.updates, summary.removes),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                }
                return Ok(());
            }
            let res = engine.propose_edit(&id, &yaml, base).await;
            engine.shutdown().await;
            let outcome = res?;
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            match outcome {
                ProposeOutcome::Success(rec) => {
                    if cli.output == Output::Human {
                        println!("applied {} at token {}", rec.identity, rec.token);
                    }
                }
                ProposeOutcome::Conflict(current) => bail!("conflict: {} changed; current token is {} (re-run get and edit again)", current.identity, current.token),
                ProposeOutcome::Malformed(m) => bail!("malformed document: {}", m),
                ProposeOutcome::NotFound(id) => bail!("not found: {}", id),
            }
        }
        Commands::Delete { gvk, name, token } => {
            let (kind, id) = target(&gvk, &name, ns)?;
            info!(id = %id, "delete invoked");
            let engine = engine_for(&kind, &id).await?;
            synced(&engine, cli.wait_secs).await;
            let res = engine.delete_resource(&id, token.map(ConcurrencyToken::new)).await;
            engine.shutdown().await;
            res?;
            println!("deleted {}", id);
        }
        Commands::Watch => {
            info!(ns = ?ns, "watch invoked");
            let cfg = EngineConfig { namespace: cli.namespace.clone(), ..EngineConfig::from_env() };
            let engine = Engine::connect(cfg).await?;
            let mut handle = engine.subscribe().await?;
            loop {
                tokio::select! {
                    maybe = handle.rx.recv() => {
                        match maybe {
                            Some(evt) => match cli.output {
                                Output::Json => println!("{}", serde_json::to_string(&evt)?),
                                Output::Human => match evt {
                                    EngineEvent::Changed { identity, token: Some(t), .. } => println!("+ {} @{}", identity, t),
                                    EngineEvent::Changed { identity, token: None, .. } => println!("- {}", identity),
                                    EngineEvent::Resync { epoch } => println!("~ resync at epoch {}", epoch),
                                },
                            },
                            None => {
                                warn!("event stream closed; exiting watch loop");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            handle.cancel.cancel();
            engine.shutdown().await;
        }
        Commands::Status => {
            let cfg = EngineConfig { namespace: cli.namespace.clone(), ..EngineConfig::from_env() };
            let engine = Engine::connect(cfg).await?;
            synced(&engine, cli.wait_secs).await;
            let statuses = engine.watch_status().await;
            engine.shutdown().await;
            let statuses = statuses?;
            match cli.output {
                Output::Human => {
                    println!("KIND                            PHASE      SYNCED DEGRADED FAILS OBJECTS LAST_ERROR");
                    for s in statuses {
                        println!(
                            "{:<31} {:<10} {:<6} {:<8} {:<5} {:<7} {}",
                            s.scope.to_string(),
                            format!("{:?}", s.phase),
                            s.synced,
                            s.degraded,
                            s.consecutive_failures,
                            s.objects,
                            s.last_error.as_deref().unwrap_or("-")
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_default_namespace_only_for_namespaced_kinds() {
        let (_, id) = target("apps/v1/Deployment", "web", None).unwrap();
        assert_eq!(id, ResourceIdentity::new("apps", "Deployment", Some("default"), "web"));
        let (_, id) = target("v1/Namespace", "shop", Some("ignored")).unwrap();
        assert_eq!(id.namespace, None);
        assert!(target("Deployment", "web", None).is_err());
    }

    #[test]
    fn focus_splits_on_the_last_slash() {
        let id = focus_target("v1/Pod/web-1", Some("shop")).unwrap();
        assert_eq!(id, ResourceIdentity::new("", "Pod", Some("shop"), "web-1"));
        assert!(focus_target("web", None).is_err());
    }

    #[test]
    fn cli_parses_edit() {
        let cli = Cli::try_parse_from(["magctl", "--ns", "shop", "edit", "v1/ConfigMap", "cfg", "-f", "-", "--token", "7"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("shop"));
        match cli.command {
            Commands::Edit { token, file, dry_run, .. } => {
                assert_eq!(token.as_deref(), Some("7"));
                assert_eq!(file, "-");
                assert!(!dry_run);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
