//! ---
//! xbar_section: "01-core-functionality"
//! xbar_subsection: "binary"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Binary entrypoint for the node daemon."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use xbar_common::{init_tracing, NodeConfig, ScopedSpec};
use xbar_metrics::{new_registry, DaemonMetrics, MetricsExporter, NodeMetrics};
use xbar_orchestrator::{resolve_ids, IdKind, Node, NodeIdentity, NodeOptions, NodeState};

#[derive(Debug, Parser)]
#[command(
    author,
    version = env!("CARGO_PKG_VERSION"),
    about = "Node controller daemon",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Start the node and run until stopped")]
    Start(StartArgs),
    #[command(about = "Validate the node configuration and print the resolved workers")]
    Check(NodeDirArgs),
    #[command(about = "Print extended version information")]
    Version,
}

#[derive(Debug, Args)]
struct NodeDirArgs {
    #[arg(long, value_name = "DIR", default_value = ".crossbar", help = "Node directory")]
    cbdir: PathBuf,

    #[arg(
        long,
        value_name = "FILE",
        default_value = "config.json",
        help = "Configuration file, relative to the node directory"
    )]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    node: NodeDirArgs,

    #[arg(
        long,
        value_name = "DIRECTIVE",
        help = "Log filter when neither XBAR_LOG nor RUST_LOG is set"
    )]
    loglevel: Option<String>,
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(run_node(args))
        }
        Commands::Check(args) => check_config(&args),
        Commands::Version => {
            println!(
                "xbard {} ({} build)",
                env!("CARGO_PKG_VERSION"),
                build_profile()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_node(args: StartArgs) -> Result<ExitCode> {
    let load_started = Instant::now();
    let loaded = NodeConfig::load(&args.node.cbdir, &args.node.config)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(level) = args.loglevel {
        config.logging.level = Some(level);
    }
    init_tracing("xbard", &config.logging)?;

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());
    let node_metrics = NodeMetrics::new(registry.clone())?;

    info!(
        config = %loaded.source.display(),
        cbdir = %args.node.cbdir.display(),
        version = env!("CARGO_PKG_VERSION"),
        "node configuration loaded"
    );

    let metrics_exporter = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(MetricsExporter::bind(registry, config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let node = Node::new(
        NodeOptions {
            cbdir: args.node.cbdir,
            config: args.node.config,
            ..NodeOptions::default()
        },
        node_metrics,
    );

    let started = node.start_with_config(config).await;
    let state = if started == NodeState::Failed {
        started
    } else {
        info!(state = %started, "node started; waiting for termination signal");
        tokio::select! {
            state = node.wait() => state,
            received = termination() => {
                match received {
                    Ok(name) => info!(signal = name, "termination signal received; shutting down"),
                    Err(err) => warn!(error = %err, "failed to listen for termination signals; shutting down"),
                }
                node.shutdown_signal().request_stop();
                node.wait().await
            }
        }
    };

    if let Some(exporter) = metrics_exporter {
        exporter.stop().await?;
    }

    if state == NodeState::Failed {
        let reason = node
            .shutdown_signal()
            .failure()
            .unwrap_or_else(|| "unknown failure".to_owned());
        eprintln!("xbard: node failed: {reason}");
        return Ok(ExitCode::FAILURE);
    }
    info!(state = %state, "node stopped");
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
async fn termination() -> std::io::Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        received = signal::ctrl_c() => received.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination() -> std::io::Result<&'static str> {
    signal::ctrl_c().await.map(|_| "ctrl-c")
}

fn check_config(args: &NodeDirArgs) -> Result<ExitCode> {
    let loaded = NodeConfig::load(&args.cbdir, &args.config)?;
    let config = &loaded.config;
    let identity = NodeIdentity::resolve(config)?;

    let workers: Vec<_> = resolve_ids(IdKind::Worker, &config.workers)
        .into_iter()
        .map(|worker| {
            json!({
                "id": worker.id,
                "type": worker.spec.kind.as_str(),
                "declared_id": worker.spec.declared_id(),
                "realms": resolve_ids(IdKind::Realm, worker.spec.realms())
                    .into_iter()
                    .map(|realm| realm.id)
                    .collect::<Vec<_>>(),
                "components": worker.spec.components().len(),
                "transports": worker.spec.transports.as_ref().map(Vec::len),
            })
        })
        .collect();

    let summary = json!({
        "config": display_path(&loaded.source),
        "config_hash": config.digest()?,
        "node_id": identity.node_id,
        "realm": identity.realm_name,
        "mode": if config.is_managed() { "managed" } else { "standalone" },
        "workers": workers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
