//! The daemon: store, managers, health reconciler and the API server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flowmesh_api::{ApiState, build_router};
use flowmesh_core::config::{FlowConfig, GatewayFileConfig};
use flowmesh_core::deploy::{
    CommandOrchestrator, Compiler, DryRunOrchestrator, Orchestrator, PrerenderedCompiler,
};
use flowmesh_core::events::{EventBus, MemoryBus};
use flowmesh_gateway::GatewaySet;
use flowmesh_health::HealthReconciler;
use flowmesh_state::StateStore;
use flowmesh_workflow::{DeploymentManager, IngressManager, InstanceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrchestratorMode {
    /// Shell out to `kubectl` / `docker`.
    Kubectl,
    /// Record specs without deploying anything.
    DryRun,
}

impl OrchestratorMode {
    pub fn build(self, config: &FlowConfig) -> Arc<dyn Orchestrator> {
        match self {
            Self::Kubectl => Arc::new(CommandOrchestrator::new(config.orchestrator.clone())),
            Self::DryRun => Arc::new(DryRunOrchestrator::new()),
        }
    }
}

/// A running daemon.
pub struct Daemon {
    addr: SocketAddr,
    reconciler: HealthReconciler,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Assemble every subsystem over `store` and serve the API on
    /// `listener`.
    pub async fn start(
        listener: TcpListener,
        store: StateStore,
        config: &FlowConfig,
        orchestrator: Arc<dyn Orchestrator>,
        bus: Arc<dyn EventBus>,
    ) -> anyhow::Result<Self> {
        let addr = listener.local_addr()?;
        let compiler: Arc<dyn Compiler> = Arc::new(PrerenderedCompiler);

        let deployments =
            DeploymentManager::new(store.clone(), compiler.clone(), orchestrator.clone(), bus);
        let instances = InstanceManager::new(store.clone(), config.call_timeout());
        let ingress = IngressManager::new(store, compiler, orchestrator);
        let reconciler = HealthReconciler::new(deployments.clone(), config.deployment_timeout());
        info!(
            call_timeout = ?config.call_timeout(),
            deployment_timeout = ?config.deployment_timeout(),
            "managers initialized"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // ── Health reconciler ──────────────────────────────────
        let health = reconciler.clone();
        let health_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = health.run(health_shutdown).await {
                error!(error = %e, "health reconciler failed");
            }
        }));

        // ── API server ─────────────────────────────────────────
        let router = build_router(ApiState {
            deployments,
            instances,
            ingress,
            health: Some(reconciler.clone()),
        });
        let mut server_shutdown = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "API server failed");
            }
        }));
        info!(%addr, "API server listening");

        Ok(Self {
            addr,
            reconciler,
            shutdown,
            tasks,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn reconciler(&self) -> &HealthReconciler {
        &self.reconciler
    }

    /// Receiver that flips when the daemon stops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the API server and the reconciler, and wait for both.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "daemon task failed");
            }
        }
        info!("daemon stopped");
    }
}

/// Options of `flowd daemon`.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub port: Option<u16>,
    pub data_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub orchestrator: OrchestratorMode,
    pub gateways: Option<PathBuf>,
}

/// Run the daemon until Ctrl-C.
pub async fn run(options: DaemonOptions) -> anyhow::Result<()> {
    let mut config = match &options.config {
        Some(path) => FlowConfig::from_file(path)?,
        None => FlowConfig::default(),
    };
    if let Some(port) = options.port {
        config.daemon.port = port;
    }

    std::fs::create_dir_all(&options.data_dir)?;
    let db_path = options.data_dir.join("flowmesh.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
    let orchestrator = options.orchestrator.build(&config);
    info!(mode = ?options.orchestrator, "orchestrator selected");

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.daemon.port))).await?;
    let daemon = Daemon::start(listener, store, &config, orchestrator, bus.clone()).await?;

    let gateways = match &options.gateways {
        Some(path) => {
            let mut file = GatewayFileConfig::from_file(path)?;
            file.fail_url.get_or_insert_with(|| config.fail_url());
            let set = GatewaySet::launch(
                &file,
                bus,
                IpAddr::from([0, 0, 0, 0]),
                daemon.shutdown_signal(),
            )
            .await?;
            info!(count = set.gateways().len(), "gateways hosted by the daemon");
            Some(set)
        }
        None => None,
    };

    wait_for_ctrl_c().await;
    daemon.stop().await;
    if let Some(set) = gateways {
        set.join().await;
    }
    Ok(())
}

pub(crate) async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "cannot listen for Ctrl-C; shutting down"),
    }
}
