//! Shared utilities for integration tests.
//!
//! In-process mock broker, Gateway Server and Network Server on ephemeral
//! ports, plus helpers to build an agent against them.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use pb_agent::cluster::{ClusterRole, StaticPeers, CLUSTER_KEY_HEADER};
use pb_agent::config::AgentConfig;
use pb_agent::connection::Dialer;
use pb_agent::pool::WorkerPoolConfig;
use pb_agent::proto::packetbroker::forwarder_data_server::{ForwarderData, ForwarderDataServer};
use pb_agent::proto::packetbroker::home_network_data_server::{
    HomeNetworkData, HomeNetworkDataServer,
};
use pb_agent::proto::packetbroker::{
    PublishDownlinkMessageRequest, PublishDownlinkMessageResponse, PublishUplinkMessageRequest,
    PublishUplinkMessageResponse, RoutedDownlinkMessage, RoutedUplinkMessage,
    SubscribeForwarderRequest, SubscribeHomeNetworkRequest,
};
use pb_agent::proto::pba::gs_ns_server::{GsNs, GsNsServer};
use pb_agent::proto::pba::gs_pba_server::GsPbaServer;
use pb_agent::proto::pba::ns_gs_server::{NsGs, NsGsServer};
use pb_agent::proto::pba::ns_pba_server::NsPbaServer;
use pb_agent::proto::pba::{
    DownlinkMessage, RxMetadata, ScheduleDownlinkResponse, TxSettings, UplinkMessage,
};
use pb_agent::utils::retry::no_backoff;
use pb_agent::{Agent, AgentBuilder};

pub const TOKEN_KEY: &str = "00112233445566778899aabbccddeeff";
pub const CLUSTER_KEY: &str = "secret";

/// How long to wait for an expected event before failing.
pub const WAIT: Duration = Duration::from_secs(5);

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
type StreamSender<T> = mpsc::Sender<Result<T, Status>>;

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Poll `f` until it returns true or [`WAIT`] elapses.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

/// Formatted log output collected by [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.0.lock().unwrap()).contains(needle)
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's logs into a buffer until the guard is dropped.
///
/// Covers agent tasks as long as the test runs on the current-thread runtime.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

/// Broker data plane recording publishes and holding the open subscriptions.
#[derive(Default)]
pub struct MockBroker {
    publish_delay: Duration,
    pub uplinks: Mutex<Vec<PublishUplinkMessageRequest>>,
    pub downlinks: Mutex<Vec<PublishDownlinkMessageRequest>>,
    pub forwarder_subscriptions: Mutex<Vec<SubscribeForwarderRequest>>,
    pub home_network_subscriptions: Mutex<Vec<SubscribeHomeNetworkRequest>>,
    forwarder_stream: Mutex<Option<StreamSender<RoutedDownlinkMessage>>>,
    home_network_stream: Mutex<Option<StreamSender<RoutedUplinkMessage>>>,
    subscribed: Notify,
}

impl MockBroker {
    pub fn with_publish_delay(delay: Duration) -> Self {
        Self {
            publish_delay: delay,
            ..Default::default()
        }
    }

    pub async fn serve(self: &Arc<Self>) -> SocketAddr {
        let (listener, addr) = listen().await;
        self.serve_on(listener);
        addr
    }

    /// Serve on a fixed address, e.g. one an agent is already dialing.
    pub async fn serve_at(self: &Arc<Self>, addr: SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        self.serve_on(listener);
    }

    fn serve_on(self: &Arc<Self>, listener: TcpListener) {
        let router = Server::builder()
            .add_service(ForwarderDataServer::from_arc(self.clone()))
            .add_service(HomeNetworkDataServer::from_arc(self.clone()));
        tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));
    }

    pub fn uplink_count(&self) -> usize {
        self.uplinks.lock().unwrap().len()
    }

    pub fn downlink_count(&self) -> usize {
        self.downlinks.lock().unwrap().len()
    }

    /// End the open Forwarder subscription stream.
    pub fn end_forwarder_stream(&self) {
        self.forwarder_stream.lock().unwrap().take();
    }

    /// Wait until the Forwarder has subscribed `n` times in total.
    pub async fn forwarder_subscribed(&self, n: usize) -> StreamSender<RoutedDownlinkMessage> {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.subscribed.notified();
                if self.forwarder_subscriptions.lock().unwrap().len() >= n {
                    if let Some(tx) = self.forwarder_stream.lock().unwrap().clone() {
                        return tx;
                    }
                }
                notified.await;
            }
        })
        .await
        .expect("forwarder subscription")
    }

    /// Wait until the Home Network has subscribed `n` times in total.
    pub async fn home_network_subscribed(&self, n: usize) -> StreamSender<RoutedUplinkMessage> {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.subscribed.notified();
                if self.home_network_subscriptions.lock().unwrap().len() >= n {
                    if let Some(tx) = self.home_network_stream.lock().unwrap().clone() {
                        return tx;
                    }
                }
                notified.await;
            }
        })
        .await
        .expect("home network subscription")
    }
}

#[tonic::async_trait]
impl ForwarderData for MockBroker {
    async fn publish(
        &self,
        request: Request<PublishUplinkMessageRequest>,
    ) -> Result<Response<PublishUplinkMessageResponse>, Status> {
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
        let mut uplinks = self.uplinks.lock().unwrap();
        uplinks.push(request.into_inner());
        Ok(Response::new(PublishUplinkMessageResponse {
            id: format!("up-{}", uplinks.len()),
        }))
    }

    type SubscribeStream = ResponseStream<RoutedDownlinkMessage>;

    async fn subscribe(
        &self,
        request: Request<SubscribeForwarderRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (tx, rx) = mpsc::channel(16);
        *self.forwarder_stream.lock().unwrap() = Some(tx);
        self.forwarder_subscriptions
            .lock()
            .unwrap()
            .push(request.into_inner());
        self.subscribed.notify_waiters();
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tonic::async_trait]
impl HomeNetworkData for MockBroker {
    async fn publish(
        &self,
        request: Request<PublishDownlinkMessageRequest>,
    ) -> Result<Response<PublishDownlinkMessageResponse>, Status> {
        let mut downlinks = self.downlinks.lock().unwrap();
        downlinks.push(request.into_inner());
        Ok(Response::new(PublishDownlinkMessageResponse {
            id: format!("down-{}", downlinks.len()),
        }))
    }

    type SubscribeStream = ResponseStream<RoutedUplinkMessage>;

    async fn subscribe(
        &self,
        request: Request<SubscribeHomeNetworkRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let (tx, rx) = mpsc::channel(16);
        *self.home_network_stream.lock().unwrap() = Some(tx);
        self.home_network_subscriptions
            .lock()
            .unwrap()
            .push(request.into_inner());
        self.subscribed.notify_waiters();
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// A request received by a mock peer with its cluster key, if any.
#[derive(Debug, Clone)]
pub struct Received<T> {
    pub message: T,
    pub cluster_key: Option<String>,
}

fn received<T>(request: Request<T>) -> Received<T> {
    let cluster_key = request
        .metadata()
        .get(CLUSTER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Received {
        message: request.into_inner(),
        cluster_key,
    }
}

/// Gateway Server scheduling every downlink with a fixed delay.
#[derive(Default)]
pub struct MockGatewayServer {
    pub downlinks: Mutex<Vec<Received<DownlinkMessage>>>,
}

impl MockGatewayServer {
    pub async fn serve(self: &Arc<Self>) -> SocketAddr {
        let (listener, addr) = listen().await;
        let router = Server::builder().add_service(NsGsServer::from_arc(self.clone()));
        tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));
        addr
    }
}

#[tonic::async_trait]
impl NsGs for MockGatewayServer {
    async fn schedule_downlink(
        &self,
        request: Request<DownlinkMessage>,
    ) -> Result<Response<ScheduleDownlinkResponse>, Status> {
        self.downlinks.lock().unwrap().push(received(request));
        Ok(Response::new(ScheduleDownlinkResponse {
            delay: Some(prost_types::Duration {
                seconds: 1,
                nanos: 0,
            }),
        }))
    }
}

/// Network Server accepting every uplink.
#[derive(Default)]
pub struct MockNetworkServer {
    pub uplinks: Mutex<Vec<Received<UplinkMessage>>>,
}

impl MockNetworkServer {
    pub async fn serve(self: &Arc<Self>) -> SocketAddr {
        let (listener, addr) = listen().await;
        let router = Server::builder().add_service(GsNsServer::from_arc(self.clone()));
        tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));
        addr
    }
}

#[tonic::async_trait]
impl GsNs for MockNetworkServer {
    async fn handle_uplink(&self, request: Request<UplinkMessage>) -> Result<Response<()>, Status> {
        self.uplinks.lock().unwrap().push(received(request));
        Ok(Response::new(()))
    }
}

/// Agent configuration for NetID 000013 in cluster `eu1`.
pub fn agent_config(forwarder: bool, home_network: bool) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.net_id = "000013".to_string();
    config.tenant_id = "ttn".to_string();
    config.cluster_id = "eu1".to_string();
    config.token_key = TOKEN_KEY.to_string();
    config.cluster.key = CLUSTER_KEY.to_string();
    config.forwarder.enable = forwarder;
    config.home_network.enable = home_network;
    config
}

/// Pool configuration with a small worker limit.
pub fn worker_pool(limit: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        limit,
        ..Default::default()
    }
}

/// Builder wired to the mock broker and peers, restarting without delay.
pub fn agent_builder(
    config: AgentConfig,
    broker: SocketAddr,
    gateway_server: Option<SocketAddr>,
    network_server: Option<SocketAddr>,
) -> AgentBuilder {
    let mut peers = StaticPeers::new();
    if let Some(addr) = gateway_server {
        peers = peers.with_peer(ClusterRole::GatewayServer, addr.to_string());
    }
    if let Some(addr) = network_server {
        peers = peers.with_peer(ClusterRole::NetworkServer, addr.to_string());
    }
    Agent::builder(config)
        .with_dialer(Dialer::plaintext(&broker.to_string()))
        .with_peer_resolver(Arc::new(peers))
        .with_task_backoff(no_backoff())
}

/// Serve the agent's `GsPba` and `NsPba` behind the cluster auth hook.
pub async fn serve_agent(agent: &Agent) -> SocketAddr {
    let (listener, addr) = listen().await;
    let auth = agent.cluster_auth();
    let router = Server::builder()
        .add_service(GsPbaServer::with_interceptor(
            agent.gs_pba_service(),
            auth.clone(),
        ))
        .add_service(NsPbaServer::with_interceptor(agent.ns_pba_service(), auth));
    tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));
    addr
}

/// Attach the shared cluster key to `msg`.
pub fn with_cluster_key<T>(msg: T) -> Request<T> {
    let mut req = Request::new(msg);
    req.metadata_mut()
        .insert(CLUSTER_KEY_HEADER, CLUSTER_KEY.parse().unwrap());
    req
}

/// Plain unconfirmed data uplink from `dev_addr`.
pub fn data_uplink(dev_addr: u32) -> Vec<u8> {
    let mut phy = vec![0x40];
    phy.extend_from_slice(&dev_addr.to_le_bytes());
    phy.extend_from_slice(&[0x00, 0x01, 0x00]); // FCtrl, FCnt
    phy.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]); // MIC
    phy
}

/// Gateway Server uplink received by `gateway_id`.
pub fn gs_uplink(gateway_id: &str, uplink_token: &[u8]) -> UplinkMessage {
    UplinkMessage {
        raw_payload: data_uplink(0x2600_0001),
        settings: Some(TxSettings {
            frequency: 868_100_000,
            data_rate_index: 5,
            coding_rate: "4/5".to_string(),
        }),
        rx_metadata: vec![RxMetadata {
            gateway_id: gateway_id.to_string(),
            rssi: -42.0,
            snr: 7.5,
            uplink_token: uplink_token.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    }
}
