// p2pjs: peer daemon that shares script jobs across a mesh of nodes.

mod commands;
mod config;
mod dispatcher;
mod engine;
mod local_ip;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use p2pjs_core::{Cookie, ExecutionRequest, NodeConfig, PeerAddress};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "p2pjs", version, about = "Peer-to-peer script job sharing node")]
struct Cli {
    /// Listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// First peer to contact, as <ip>#<port>
    #[arg(short = 'f', long = "first-peer", value_name = "IP#PORT")]
    first_peer: Option<String>,

    /// Run headless: no operator commands on stdin
    #[arg(short, long)]
    background: bool,

    /// Run one script locally and exit
    #[arg(short, long, value_name = "PATH")]
    script: Option<PathBuf>,

    /// Argument for --script
    #[arg(long, default_value_t = 0.0, requires = "script")]
    arg: f64,

    /// Config file (default: ~/.config/p2pjs/config.toml, then /etc/p2pjs/config.toml)
    #[arg(long, env = "P2PJS_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(p) = cli.port {
        cfg.port = p;
    }
    if let Some(seed) = cli.first_peer.clone() {
        cfg.seed_peer = Some(seed);
    }

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    match cli.script {
        Some(path) => rt.block_on(run_script(&cfg, &path, cli.arg)),
        None => rt.block_on(serve(cfg, cli.background)),
    }
}

fn process_engine(cfg: &config::Config) -> engine::ProcessEngine {
    engine::ProcessEngine::new(
        cfg.interpreter.clone(),
        cfg.syntax_check.clone(),
        Duration::from_secs(cfg.job_timeout_secs),
    )
}

/// Standalone mode: execute one script here and print the outcome.
async fn run_script(cfg: &config::Config, path: &std::path::Path, arg: f64) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading script {}", path.display()))?;
    let outcome = process_engine(cfg)
        .run(ExecutionRequest {
            cookie: Cookie::generate(),
            arg,
            source,
        })
        .await;
    println!("{} {}", outcome.status, outcome.result);
    Ok(())
}

async fn serve(cfg: config::Config, background: bool) -> anyhow::Result<()> {
    let seed = cfg
        .seed_peer
        .as_deref()
        .map(|s| {
            s.parse::<PeerAddress>()
                .with_context(|| format!("invalid first peer {:?}", s))
        })
        .transpose()?;

    let address = local_ip::resolve(cfg.advertise_ip.as_deref());
    let mut node = NodeConfig::new(PeerAddress::new(address, cfg.port));
    node.max_running_jobs = cfg.max_running_jobs;
    node.offer_timeout_ticks = cfg.offer_timeout_ticks;

    let listener = transport::bind(cfg.port)
        .await
        .with_context(|| format!("binding port {}", cfg.port))?;
    tracing::info!(
        addr = %node.advertised,
        version = env!("CARGO_PKG_VERSION"),
        max_running_jobs = node.max_running_jobs,
        "node listening"
    );

    let mut dispatcher = dispatcher::Dispatcher::new(
        node,
        Arc::new(process_engine(&cfg)),
        Duration::from_millis(cfg.tick_interval_ms.max(1)),
    );
    if !background {
        dispatcher = dispatcher.with_commands(commands::spawn_stdin_reader());
    }
    if let Some(seed) = seed {
        dispatcher.connect_seed(seed);
    }

    dispatcher
        .run(listener, async {
            if let Err(e) = shutdown_signal().await {
                tracing::warn!(error = %e, "cannot listen for shutdown signals");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
