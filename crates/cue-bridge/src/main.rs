//! cue-bridge
//!
//! Bridges RGB lighting devices to Home Assistant over MQTT.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cue_bridge::config::BridgeConfig;
use cue_bridge::sdk::{self, VirtualSdk};
use cue_bridge::session::{self, SessionHandle};

/// Lighting to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "cue-bridge")]
#[command(about = "Expose RGB lighting devices to Home Assistant over MQTT", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./cue-bridge.toml")]
    config: PathBuf,

    /// MQTT broker host (overrides config and environment)
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cue_bridge=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting cue-bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.apply_env();
    if let Some(host) = args.host {
        config.mqtt.host = host;
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    config.validate()?;

    // The handshake must succeed before anything is published
    let mut backend = VirtualSdk::from_config(&config.sdk.devices);
    let initialized = tokio::select! {
        result = sdk::initialize(
            &mut backend,
            config.sdk.exclusive_control,
            config.sdk.handshake_retry(),
        ) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while waiting for the lighting server");
            return Ok(());
        }
    };
    if let Err(e) = initialized {
        error!("Lighting SDK unavailable: {}", e);
        return Err(e.into());
    }

    let (handle, tasks) = session::connect(&config, Box::new(backend));

    shutdown_signal(handle).await;
    tasks.join().await;

    info!("cue-bridge stopped");
    Ok(())
}

/// Wait for a shutdown signal, forwarding SIGHUP as a device rescan
async fn shutdown_signal(handle: SessionHandle) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let rescan = {
        let handle = handle.clone();
        async move {
            let mut hangup =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                    .expect("Failed to install signal handler");
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, rescanning devices");
                if let Err(e) = handle.rescan().await {
                    warn!("Rescan request failed: {}", e);
                }
            }
        }
    };

    #[cfg(not(unix))]
    let rescan = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
        _ = rescan => {},
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Bridge session already stopped: {}", e);
    }
}
