//! `flowd gateways`: run the gateways of a gateway file on their own.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use flowmesh_core::config::GatewayFileConfig;
use flowmesh_core::events::MemoryBus;
use flowmesh_gateway::GatewaySet;

use crate::daemon::wait_for_ctrl_c;

/// Run every gateway in `config` until Ctrl-C. Throw and catch gateways
/// share one in-process bus.
pub async fn run(config: &Path, bind: IpAddr, fail_url: Option<String>) -> anyhow::Result<()> {
    let mut file = GatewayFileConfig::from_file(config)?;
    if let Some(url) = fail_url {
        file.fail_url = Some(url);
    }
    if file.fail_url.is_none() {
        info!("no failure endpoint configured; exhausted calls are only logged");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let set = GatewaySet::launch(&file, Arc::new(MemoryBus::new()), bind, shutdown_rx).await?;
    for gateway in set.gateways() {
        info!(name = %gateway.name, kind = gateway.kind, addr = %gateway.addr, "gateway ready");
    }

    wait_for_ctrl_c().await;
    shutdown_tx.send_replace(true);
    set.join().await;
    info!("gateways stopped");
    Ok(())
}
