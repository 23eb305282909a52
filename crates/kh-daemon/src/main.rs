//! KrakenHashes coordinator daemon entry point.

use anyhow::{Context, Result};
use tracing::{info, warn};

use kh_core::config::Config;
use kh_daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config, using defaults: {err}");
            Config::default()
        }
    };

    if config.general.json_logs {
        kh_telemetry::logging::init_logging_json("kh-daemon", &config.general.log_level);
    } else {
        kh_telemetry::logging::init_logging("kh-daemon", &config.general.log_level);
    }

    // Expand ~ in the store path.
    if config.store.path.starts_with("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        config.store.path = config.store.path.replacen('~', &home, 1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "krakenhashes daemon starting");

    let daemon = Daemon::new(config)
        .await
        .context("failed to initialize daemon")?;

    // Ctrl-C triggers a graceful drain.
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; shutting down");
            shutdown.trigger();
        }
    });

    daemon.run().await
}
