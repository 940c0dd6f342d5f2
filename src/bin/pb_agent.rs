//! pb-agent: Packet Broker Agent
//!
//! Serves `GsPba` and `NsPba` to the local cluster and runs the Forwarder
//! and Home Network pipelines against the broker data plane.
//!
//! ## Configuration
//! - `pba.yaml`, a path argument or `PBA_CONFIG`
//! - `PBA__AGENT__NET_ID`, `PBA__AGENT__FORWARDER__ENABLE`, ... environment overrides
//! - `PBA_LOG`: log filter (default `info`)

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};

use pb_agent::config::Config;
use pb_agent::proto::pba::gs_pba_server::GsPbaServer;
use pb_agent::proto::pba::ns_pba_server::NsPbaServer;
use pb_agent::utils::bootstrap::{cancel_on_shutdown_signal, init_tracing, parse_config_path};
use pb_agent::Agent;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let agent = Agent::builder(config.agent).build().map_err(|e| {
        error!("Failed to configure agent: {}", e);
        e
    })?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));
    agent.start(&cancel);

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let addr: std::net::SocketAddr = config.server.bind_address().parse()?;
    let auth = agent.cluster_auth();
    info!(address = %addr, cluster_auth = auth.is_enabled(), "Packet Broker Agent listening");

    let served = Server::builder()
        .add_service(health_service)
        .add_service(GsPbaServer::with_interceptor(
            agent.gs_pba_service(),
            auth.clone(),
        ))
        .add_service(NsPbaServer::with_interceptor(agent.ns_pba_service(), auth))
        .serve_with_shutdown(addr, cancel.clone().cancelled_owned())
        .await;

    cancel.cancel();
    agent.wait().await;
    info!("Packet Broker Agent stopped");

    served?;
    Ok(())
}
