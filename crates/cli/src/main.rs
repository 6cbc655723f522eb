use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tern_core::ReleaseHistory;
use tern_deploy::{
    ApplyRequest, BlueGreenRequest, DeleteRequest, DeleteTarget, DeployFlags, DeployOutput, Destination, Engine, EngineConfig, HistoryBackend, PipelineContext,
    RollbackRequest, RollingRequest, Strategy, TrafficSplitRequest,
};
use tern_kubehub::{ClusterHistoryStore, HistoryObject};
use tern_ops::KubeOps;
use tern_persist::{HistoryStore, SqliteStore};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ternctl", version, about = "Tern deployment engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Target namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Release name; keys the release history
    #[arg(long = "release", global = true)]
    release: Option<String>,

    /// History backend (overrides TERN_HISTORY_BACKEND)
    #[arg(long = "history-backend", global = true)]
    history_backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct DeployArgs {
    /// Delete resources the previous successful release had and this one drops
    #[arg(long = "prune", action = ArgAction::SetTrue)]
    prune: bool,
    /// Keep names stable across releases instead of suffixing `-<n>`
    #[arg(long = "no-versioning", action = ArgAction::SetTrue)]
    no_versioning: bool,
    #[arg(long = "skip-steady-state", action = ArgAction::SetTrue)]
    skip_steady_state: bool,
    /// Steady-state timeout in minutes (0 = default)
    #[arg(long = "timeout", default_value_t = 10)]
    timeout_minutes: u64,
}

impl DeployArgs {
    fn flags(&self) -> DeployFlags {
        DeployFlags { prune: self.prune, versioning: !self.no_versioning, skip_steady_state: self.skip_steady_state }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rolling deploy of a manifest set
    Rolling {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        /// Reuse the latest release number if it is still in progress
        #[arg(long = "continue-latest", action = ArgAction::SetTrue)]
        continue_latest: bool,
        #[command(flatten)]
        deploy: DeployArgs,
    },
    /// Blue-green deploy with a primary/stage Service pair
    BlueGreen {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        #[arg(long = "skip-cutover", action = ArgAction::SetTrue)]
        skip_cutover: bool,
        #[command(flatten)]
        deploy: DeployArgs,
    },
    /// Roll back to the last successful release
    Rollback {
        /// Release being rolled back; 0 = latest
        #[arg(long = "number", default_value_t = 0)]
        number: u32,
        #[command(flatten)]
        deploy: DeployArgs,
    },
    /// Delete resources: explicit refs, `*` for everything tracked, or manifests
    Delete {
        /// Kind/name or namespace/Kind/name, or `*`
        resources: Vec<String>,
        #[arg(short = 'f', long = "filename")]
        files: Vec<PathBuf>,
        #[arg(long = "delete-namespace", action = ArgAction::SetTrue)]
        delete_namespace: bool,
    },
    /// Apply a manifest subset without touching release history
    Apply {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        #[arg(long = "skip-steady-state", action = ArgAction::SetTrue)]
        skip_steady_state: bool,
        #[arg(long = "timeout", default_value_t = 10)]
        timeout_minutes: u64,
    },
    /// Set weighted destinations on an Istio VirtualService
    TrafficSplit {
        virtual_service: String,
        /// `[host[:port]/]subset=weight`, repeatable
        #[arg(long = "dest", required = true)]
        destinations: Vec<String>,
    },
    /// Print the release history
    History,
}

fn init_tracing() {
    let env = std::env::var("TERN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TERN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TERN_METRICS_ADDR; expected host:port");
        }
    }
}

/// `[host[:port]/]subset=weight`
fn parse_destination(s: &str) -> Result<Destination> {
    let (target, weight) = s.rsplit_once('=').ok_or_else(|| anyhow!("destination `{}`: expected [host[:port]/]subset=weight", s))?;
    let weight: u32 = weight.trim().parse().with_context(|| format!("destination `{}`: weight is not a number", s))?;
    let (host_port, subset) = match target.split_once('/') {
        Some((hp, subset)) => (Some(hp), subset),
        None => (None, target),
    };
    let (host, port) = match host_port.map(|hp| hp.split_once(':').map(|(h, p)| (h, Some(p))).unwrap_or((hp, None))) {
        Some((h, p)) => {
            let port = p.map(|p| p.parse::<u32>().with_context(|| format!("destination `{}`: bad port", s))).transpose()?;
            (Some(h.to_string()).filter(|h| !h.is_empty()), port)
        }
        None => (None, None),
    };
    let subset = Some(subset.trim().to_string()).filter(|s| !s.is_empty());
    Ok(Destination { host, subset, port, weight })
}

async fn build_store(config: &EngineConfig) -> Result<Arc<dyn HistoryStore>> {
    Ok(match config.history_backend {
        HistoryBackend::Sqlite => {
            let store = match &config.db_path {
                Some(p) => SqliteStore::open(p)?,
                None => SqliteStore::open_default()?,
            };
            Arc::new(store)
        }
        HistoryBackend::ConfigMap => Arc::new(ClusterHistoryStore::new(tern_kubehub::get_kube_client().await?, HistoryObject::ConfigMap)),
        HistoryBackend::Secret => Arc::new(ClusterHistoryStore::new(tern_kubehub::get_kube_client().await?, HistoryObject::Secret)),
    })
}

fn print_output(output: Output, strategy: &str, out: &DeployOutput) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "status": "success", "strategy": strategy, "result": out }))?),
        Output::Human => {
            if let Some(reason) = &out.noop {
                println!("{}: nothing done ({})", strategy, reason);
            }
            if let Some(n) = out.release_number {
                println!("release: {}", n);
            }
            if let Some(stage) = out.stage_color {
                let primary = out.primary_color.map(|c| c.as_str()).unwrap_or("default");
                println!("colors: primary={} stage={}", primary, stage);
            }
            if let Some(n) = out.rolled_back_to {
                println!("rolled back to release {}", n);
            }
            for p in &out.pods {
                println!("pod {:<40} {:<10} {}", p.name, p.phase.as_deref().unwrap_or("-"), if p.new_pod { "new" } else { "existing" });
            }
            for id in &out.pruned {
                println!("pruned {}", id);
            }
            for id in &out.deleted {
                println!("deleted {}", id);
            }
            for w in &out.warnings {
                println!("warning: {}", w);
            }
        }
    }
    Ok(())
}

fn render_age(ts: i64) -> String {
    if ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(b) = &cli.history_backend {
        config.history_backend = b.parse()?;
    }
    let release = cli.release.clone().ok_or_else(|| anyhow!("--release is required"));
    let ns = cli.namespace.as_str();

    if let Commands::History = cli.command {
        let release = release?;
        let store = build_store(&config).await?;
        let history = match store.get(ns, &release).await? {
            Some(stored) => ReleaseHistory::deserialize(&stored.blob)?,
            None => ReleaseHistory::new(),
        };
        match cli.output {
            Output::Json => println!("{}", serde_json::to_string_pretty(&history)?),
            Output::Human => {
                println!("NUMBER  STATUS      AGE      RESOURCES  WORKLOADS");
                for r in &history.releases {
                    println!("{:<7} {:<11} {:<8} {:<10} {}", r.number, format!("{:?}", r.status), render_age(r.started_at), r.resources.len(), r.managed_workloads.len() + r.custom_workloads.len());
                }
            }
        }
        return Ok(());
    }

    let (ctx, strategy) = match cli.command {
        Commands::Rolling { files, continue_latest, deploy } => {
            let resources = tern_apply::read_manifest_paths(&files, Some(ns))?;
            let ctx = PipelineContext::new(&release?, ns, deploy.timeout_minutes).with_flags(deploy.flags());
            (ctx, Strategy::Rolling(RollingRequest { resources, continue_latest }))
        }
        Commands::BlueGreen { files, skip_cutover, deploy } => {
            let resources = tern_apply::read_manifest_paths(&files, Some(ns))?;
            let ctx = PipelineContext::new(&release?, ns, deploy.timeout_minutes).with_flags(deploy.flags());
            (ctx, Strategy::BlueGreen(BlueGreenRequest { resources, skip_cutover }))
        }
        Commands::Rollback { number, deploy } => {
            let ctx = PipelineContext::new(&release?, ns, deploy.timeout_minutes).with_flags(deploy.flags());
            (ctx, Strategy::Rollback(RollbackRequest { release_number: number }))
        }
        Commands::Delete { resources, files, delete_namespace } => {
            let manifests = if files.is_empty() { None } else { Some(tern_apply::read_manifest_paths(&files, Some(ns))?) };
            let target = DeleteTarget::resolve(&resources, manifests, ns)?;
            // Only the wildcard reads history
            let release = if matches!(target, DeleteTarget::All) { release? } else { release.unwrap_or_default() };
            let ctx = PipelineContext::new(&release, ns, 0);
            (ctx, Strategy::Delete(DeleteRequest { target, delete_namespace }))
        }
        Commands::Apply { files, skip_steady_state, timeout_minutes } => {
            let resources = tern_apply::read_manifest_paths(&files, Some(ns))?;
            let flags = DeployFlags { skip_steady_state, ..DeployFlags::default() };
            let ctx = PipelineContext::new(&release.unwrap_or_default(), ns, timeout_minutes).with_flags(flags);
            (ctx, Strategy::Apply(ApplyRequest { resources }))
        }
        Commands::TrafficSplit { virtual_service, destinations } => {
            let destinations = destinations.iter().map(|d| parse_destination(d)).collect::<Result<Vec<_>>>()?;
            let ctx = PipelineContext::new(&release.unwrap_or_default(), ns, 0);
            (ctx, Strategy::TrafficSplit(TrafficSplitRequest { virtual_service, destinations }))
        }
        Commands::History => return Ok(()),
    };

    let ops = KubeOps::connect(&config.field_manager, config.poll_interval).await?;
    let store = build_store(&config).await?;
    let engine = Engine::new(Arc::new(ops), store, config);
    let name = strategy.name();
    info!(run_id = %ctx.run_id, strategy = name, "starting");
    match engine.execute(&ctx, strategy).await {
        Ok(out) => print_output(cli.output, name, &out),
        Err(e) => {
            error!(error = %e, "{} failed", name);
            if cli.output == Output::Json {
                println!("{}", serde_json::json!({ "status": "failure", "strategy": name, "validation": e.is_validation(), "error": e.to_string() }));
            }
            Err(anyhow!("{} failed: {}", name, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_parse_all_forms() {
        let d = parse_destination("canary=20").unwrap();
        assert_eq!(d, Destination { host: None, subset: Some("canary".into()), port: None, weight: 20 });
        let d = parse_destination("web.ns.svc:8080/stable=80").unwrap();
        assert_eq!(d.host.as_deref(), Some("web.ns.svc"));
        assert_eq!(d.port, Some(8080));
        assert_eq!(d.subset.as_deref(), Some("stable"));
        let d = parse_destination("web/=100").unwrap();
        assert_eq!(d.subset, None);
        assert!(parse_destination("canary").is_err());
        assert!(parse_destination("canary=x").is_err());
    }

    #[test]
    fn cli_parses_rolling_flags() {
        let cli = Cli::try_parse_from(["ternctl", "--release", "web", "--ns", "prod", "rolling", "-f", "app.yaml", "--prune", "--timeout", "3"]).unwrap();
        match cli.command {
            Commands::Rolling { files, deploy, .. } => {
                assert_eq!(files, vec![PathBuf::from("app.yaml")]);
                assert!(deploy.flags().prune);
                assert!(deploy.flags().versioning);
                assert_eq!(deploy.timeout_minutes, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cli.namespace, "prod");
    }

    #[test]
    fn age_renders_compactly() {
        assert_eq!(render_age(0), "-");
        assert!(render_age(chrono::Utc::now().timestamp() - 90).ends_with('m'));
    }
}
