// Allow dead code - parts of the cloud and config surface are kept for API
// completeness even where the controller core does not exercise them yet
#![allow(dead_code)]

//! RNode Testnet Controller
//!
//! Control-plane supervisor for a small fleet of RNode validator hosts on a
//! public cloud.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  RNODE TESTNET CONTROLLER                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Node API (8080)          ←── PUT /nodes, heartbeats, files │
//! │  Config Resolver          ←── user + global + templates     │
//! │  Node Supervisors         ←── liveness, failure latching    │
//! │  Host Driver              ←── IP / DNS / disk / instance    │
//! │  Reconciliation Loop      ←── majority leader election      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

mod api;
mod cloud;
mod config;
mod crypto;
mod error;
mod host;
mod network;
mod node;
mod types;
mod util;

use cloud::gcp::GcpProvider;
use cloud::CloudProvider;
use config::AppConfig;
use network::NetworkController;

/// RNode testnet controller - fleet supervisor for validator hosts
#[derive(Parser, Debug)]
#[command(name = "rnode-controller")]
#[command(version = "0.1.0")]
#[command(about = "Control-plane supervisor for a fleet of RNode validator hosts", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "controller.toml")]
    config: PathBuf,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP listen address override
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🌐 RNode Testnet Controller v{}", env!("CARGO_PKG_VERSION"));

    let mut app_config = if args.config.exists() {
        AppConfig::load(&args.config)?
    } else {
        warn!("config file {:?} not found, using defaults", args.config);
        AppConfig::default()
    };
    if let Some(data_dir) = args.data_dir {
        app_config.data_dir = data_dir;
    }
    if let Some(listen) = args.listen {
        app_config.listen_addr = listen;
    }
    app_config.validate()?;

    info!("⚙️  configuration:");
    info!("   data dir: {}", app_config.data_dir.display());
    info!("   listen addr: {}", app_config.listen_addr);
    info!("   initial delay: {}s", app_config.initial_delay);
    info!("   check interval: {}s", app_config.check_interval);

    // The provider's blocking HTTP client must be built off the runtime.
    let credentials = app_config.credentials_file().to_path_buf();
    let provider =
        tokio::task::spawn_blocking(move || GcpProvider::from_credentials_file(&credentials))
            .await??;
    let cloud: Arc<dyn CloudProvider> = Arc::new(provider);
    info!("☁️  cloud provider ready");

    let controller = NetworkController::new(Arc::new(app_config), cloud);

    let api_handle = tokio::spawn(api::serve(Arc::clone(&controller)));
    let loop_handle = tokio::spawn(Arc::clone(&controller).run());

    info!("✅ controller started");
    info!("   Press Ctrl+C to shut down");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 shutdown signal received");
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
        result = loop_handle => {
            error!("controller loop exited: {:?}", result);
        }
    }

    // Cancel in-flight maintenance; a restart interrupted in its stop phase
    // skips the start phase and releases its lock.
    controller.shutdown_token().cancel();

    info!("👋 rnode controller shutting down");
    Ok(())
}
