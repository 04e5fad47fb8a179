//! haproxy-sync: keeps a local HAProxy's backend set synchronized with
//! the service instances registered in a coordination service.
//!
//! # Architecture Overview
//!
//! ```text
//!   registration tree                    ┌──────────────────────────────┐
//!   (coordination svc) ──children/──────▶│ watch: registry + resolver   │
//!                        node reads      └──────────────┬───────────────┘
//!                                                       │ ServersChanged
//!                                                       ▼
//!                                        ┌──────────────────────────────┐
//!                                        │ core: reconciliation         │
//!                                        │ controller (clean/dirty/     │
//!                                        │ reload, audit, dirty budget) │
//!                                        └──────┬──────────────┬────────┘
//!                                  reload       │              │ patch / stats
//!                                               ▼              ▼
//!                                        ┌────────────┐ ┌──────────────┐
//!                                        │ haproxy::  │ │ haproxy::sock│
//!                                        │ manager    │ │ (ctrl socket)│
//!                                        └────────────┘ └──────────────┘
//! ```
//!
//! Setup failures (address lookup, registry connect) restart the whole
//! sequence after a fixed delay, forever; only a bad config file exits
//! the process.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use haproxy_sync::config::loader::load_config;
use haproxy_sync::config::schema::Config;
use haproxy_sync::core::controller::Controller;
use haproxy_sync::haproxy::manager::LbManager;
use haproxy_sync::haproxy::sock::HaproxySock;
use haproxy_sync::lifecycle::{signals, Shutdown};
use haproxy_sync::net::addrs;
use haproxy_sync::watch::dir::DirRegistry;
use haproxy_sync::watch::{domain_to_path, ServerWatcher};

/// Delay before the entire setup sequence is retried.
const SETUP_RETRY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "haproxy-sync",
    about = "Keeps the local HAProxy backend set in sync with registered services"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    file: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "haproxy_sync=info",
        1 => "haproxy_sync=debug",
        _ => "haproxy_sync=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A bad config file is the one fatal startup error.
    let config = load_config(&cli.file)?;
    tracing::info!(name = %config.name, "haproxy-sync starting");

    let shutdown = Shutdown::new();
    tokio::spawn(signals::handle_signals(shutdown.clone()));

    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            res = run_once(&config, &shutdown) => match res {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(error = %e, "startup failed: retry in 30sec");
                    tokio::time::sleep(SETUP_RETRY).await;
                }
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// One pass through the setup sequence, then the long-lived controller
/// loop. An `Err` restarts the sequence from address classification.
async fn run_once(
    config: &Config,
    shutdown: &Shutdown,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Acquire addresses; no safe bind configuration exists without them.
    let untrusted_ips = addrs::untrusted_addrs(config).await?;

    // Session setup. Remote coordination clients implement
    // `watch::Registry` and plug in here.
    let Some(root) = &config.coordination.registrar_dir else {
        return Err(
            "coordination.registrar_dir is required (no remote registry client built in)".into(),
        );
    };
    let registry = DirRegistry::connect(root.clone()).await?;
    tracing::info!(root = %root.display(), "connected to registration tree");

    // Fresh watcher for this session.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (_session_tx, session_rx) = mpsc::unbounded_channel();
    let path = domain_to_path(&config.name);
    // Poll task exits on shutdown; the handle is not joined.
    let _poll_task = registry.watch(
        path.clone(),
        Duration::from_millis(config.coordination.poll_interval_ms),
        events_tx.clone(),
        shutdown.subscribe(),
    );
    let watcher = ServerWatcher::new(registry, path, events_tx);

    let reloader = LbManager::new(config.haproxy.clone());
    let patcher = HaproxySock::new(config.haproxy.socket_path.clone());

    let controller = Controller::new(
        config.trusted_ip.clone(),
        untrusted_ips,
        watcher,
        reloader,
        patcher,
        events_rx,
        session_rx,
    );
    controller.run(shutdown.subscribe()).await;
    Ok(())
}
