//! Runs every gateway of a gateway file inside one process.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flowmesh_core::config::GatewayFileConfig;
use flowmesh_core::events::EventBus;

use crate::catch::CatchGateway;
use crate::error::{GatewayError, GatewayResult};
use crate::exclusive::ExclusiveGateway;
use crate::scaffold::{RoutingStrategy, serve};
use crate::throw::ThrowGateway;

#[derive(Debug)]
pub struct RunningGateway {
    pub name: String,
    pub kind: &'static str,
    pub addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct GatewaySet {
    gateways: Vec<RunningGateway>,
}

impl GatewaySet {
    /// Bind and start every configured gateway on `ip`. Throw and catch
    /// topics are created on `bus` first.
    pub async fn launch(
        config: &GatewayFileConfig,
        bus: Arc<dyn EventBus>,
        ip: IpAddr,
        shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<Self> {
        check_names(config)?;
        let mut gateways = Vec::new();

        for gw in &config.exclusive {
            let strategy = ExclusiveGateway::from_config(gw, config.fail_url_for(&gw.fail_url))?;
            gateways.push(listen(&gw.name, "exclusive", ip, gw.port, Arc::new(strategy), &shutdown, Vec::new()).await?);
        }

        for gw in &config.throw {
            bus.create_topic(&gw.topic)?;
            let strategy = ThrowGateway::from_config(gw, bus.clone(), config.fail_url_for(&gw.fail_url));
            gateways.push(listen(&gw.name, "throw", ip, gw.port, Arc::new(strategy), &shutdown, Vec::new()).await?);
        }

        for gw in &config.catch {
            bus.create_topic(&gw.topic)?;
            let strategy = Arc::new(CatchGateway::from_config(
                gw,
                bus.clone(),
                config.fail_url_for(&gw.fail_url),
            ));
            let poller = strategy.spawn_poller(shutdown.clone());
            gateways.push(listen(&gw.name, "catch", ip, gw.port, strategy, &shutdown, vec![poller]).await?);
        }

        Ok(Self { gateways })
    }

    pub fn gateways(&self) -> &[RunningGateway] {
        &self.gateways
    }

    pub fn addr(&self, name: &str) -> Option<SocketAddr> {
        self.gateways.iter().find(|g| g.name == name).map(|g| g.addr)
    }

    /// Wait for every server and poller to finish.
    pub async fn join(self) {
        for gateway in self.gateways {
            for task in gateway.tasks {
                if let Err(e) = task.await {
                    warn!(gateway = %gateway.name, error = %e, "gateway task failed");
                }
            }
        }
    }
}

fn check_names(config: &GatewayFileConfig) -> GatewayResult<()> {
    let names = config
        .exclusive
        .iter()
        .map(|g| &g.name)
        .chain(config.throw.iter().map(|g| &g.name))
        .chain(config.catch.iter().map(|g| &g.name));
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(GatewayError::Config {
                name: name.clone(),
                reason: "gateway name used twice".into(),
            });
        }
    }
    Ok(())
}

async fn listen(
    name: &str,
    kind: &'static str,
    ip: IpAddr,
    port: u16,
    strategy: Arc<dyn RoutingStrategy>,
    shutdown: &watch::Receiver<bool>,
    mut tasks: Vec<JoinHandle<()>>,
) -> GatewayResult<RunningGateway> {
    let requested = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(requested)
        .await
        .map_err(|source| GatewayError::Bind { addr: requested, source })?;
    let addr = listener
        .local_addr()
        .map_err(|source| GatewayError::Bind { addr: requested, source })?;

    let server_name = name.to_string();
    let shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = serve(listener, strategy, shutdown).await {
            error!(gateway = %server_name, error = %e, "gateway server failed");
        }
    }));
    info!(gateway = name, kind, %addr, "gateway listening");

    Ok(RunningGateway {
        name: name.to_string(),
        kind,
        addr,
        tasks,
    })
}
