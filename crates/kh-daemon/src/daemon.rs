use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use kh_core::artifacts::{ArtifactStore, MemoryArtifactStore};
use kh_core::config::Config;
use kh_core::StoreDb;
use kh_engine::{CrackIngest, JobLifecycle, ProgressTracker};
use kh_protocol::EventBus;
use kh_session::ws::{self, WsState};
use kh_session::{AgentRegistry, SessionHandler};

use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownSignal;

/// The coordinator daemon: owns the store, the live-agent registry, the
/// engine components, the scheduler loop, and the agent-facing server.
pub struct Daemon {
    config: Config,
    store: Arc<StoreDb>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<AgentRegistry>,
    events: EventBus,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create a daemon on an already-open store.
    pub fn with_store(
        config: Config,
        store: Arc<StoreDb>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            store,
            artifacts,
            registry: Arc::new(AgentRegistry::new()),
            events: EventBus::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Create a daemon, opening (or creating) the store from config.
    pub async fn new(config: Config) -> Result<Self> {
        let store = if config.store.path == ":memory:" {
            StoreDb::new_in_memory().await
        } else {
            if let Some(parent) = std::path::Path::new(&config.store.path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
            StoreDb::new(&config.store.path).await
        }
        .context("failed to open store database")?;
        Ok(Self::with_store(
            config,
            Arc::new(store),
            Arc::new(MemoryArtifactStore::new()),
        ))
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// The mutation surface handed to the external API layer.
    pub fn lifecycle(&self) -> JobLifecycle {
        JobLifecycle::new(
            self.store.clone(),
            self.artifacts.clone(),
            self.registry.clone(),
        )
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self) -> Result<()> {
        let tracker = ProgressTracker::new(self.store.clone(), self.events.clone());
        let ingest = CrackIngest::new(self.store.clone(), tracker.clone());
        let handler = SessionHandler::new(
            self.store.clone(),
            tracker.clone(),
            ingest.clone(),
            self.registry.clone(),
        );

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.artifacts.clone(),
            self.registry.clone(),
            tracker,
            ingest,
            Duration::from_secs(self.config.scheduler.heartbeat_interval_secs),
        );

        // --- Agent-facing server ---
        let app = Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(WsState {
                registry: self.registry.clone(),
                handler,
            }))
            .layer(TraceLayer::new_for_http());

        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        info!(addr = %bind_addr, "agent endpoint listening");

        let mut server_shutdown = self.shutdown.subscribe();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.recv().await;
                })
                .await
        });

        // --- Scheduler loop ---
        let tick = Duration::from_secs(self.config.scheduler.tick_interval_secs);
        let mut scheduler_shutdown = self.shutdown.subscribe();
        let scheduler_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = scheduler.tick().await {
                            error!(error = %err, "scheduler tick failed");
                        }
                    }
                    _ = scheduler_shutdown.recv() => {
                        info!("scheduler loop draining");
                        break;
                    }
                }
            }
        });

        scheduler_handle.await.ok();
        let _ = server.await;
        info!("daemon stopped");
        Ok(())
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
