//! Packet Broker Agent.
//!
//! Bridges the local cluster to the broker data plane in two independent
//! roles:
//!
//! - **Forwarder**: publishes uplinks from local Gateway Servers and
//!   subscribes to downlinks routed back for their gateways.
//! - **Home Network**: subscribes to uplinks routed to this network and
//!   publishes downlinks from local Network Servers toward the Forwarder.
//!
//! Every pipeline runs as a supervised task; each generation dials its own
//! connection and drains its input through an elastic worker pool.
//!
//! ```text
//! GsPba.PublishUplink ──▶ upstream (64) ──▶ pb_publish_uplink ──▶ broker
//! broker ──▶ pb_subscribe_downlink ──▶ NsGs.ScheduleDownlink
//! broker ──▶ pb_subscribe_uplink ──▶ GsNs.HandleUplink
//! NsPba.PublishDownlink ──▶ downstream (32) ──▶ pb_publish_downlink ──▶ broker
//! ```

mod filters;
mod forwarder;
mod grpc;
mod home_network;

pub use filters::{format_filters, subscription_filters};
pub use grpc::{GsPbaService, NsPbaService};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::cluster::{ClusterAuth, PeerResolver, StaticPeers};
use crate::config::AgentConfig;
use crate::connection::{AuthenticationMode, Dialer};
use crate::encryption::{MessageEncrypter, PlaintextPayloads};
use crate::error::{AgentError, PipelineError};
use crate::pool::{PoolStats, WorkerPoolConfig};
use crate::proto::packetbroker as pb;
use crate::task::{self, TaskConfig};
use crate::tenant::{default_tenant_extractor, MessageContext, TenantContextFiller, TenantExtractor};
use crate::token::{AgentUplinkToken, TokenCodec};
use crate::types::{DevAddrPrefix, NetId};
use crate::utils::retry::dial_task_backoff;

/// Capacity of the uplink channel toward the broker.
pub const UPSTREAM_BUFFER_SIZE: usize = 1 << 6;

/// Capacity of the downlink channel toward the broker.
pub const DOWNSTREAM_BUFFER_SIZE: usize = 1 << 5;

/// Timeout of a single publish or peer RPC.
pub const PUBLISH_MESSAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// The four agent pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    ForwarderPublish,
    ForwarderSubscribe,
    HomeNetworkSubscribe,
    HomeNetworkPublish,
}

impl Pipeline {
    /// Supervised task ID.
    pub fn task_id(self) -> &'static str {
        match self {
            Pipeline::ForwarderPublish => "pb_publish_uplink",
            Pipeline::ForwarderSubscribe => "pb_subscribe_downlink",
            Pipeline::HomeNetworkSubscribe => "pb_subscribe_uplink",
            Pipeline::HomeNetworkPublish => "pb_publish_downlink",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_id())
    }
}

/// Uplink waiting to be published, with the context of its producer.
#[derive(Debug)]
pub(crate) struct UplinkEnvelope {
    pub ctx: MessageContext,
    pub message: pb::UplinkMessage,
}

/// Downlink waiting to be published toward the Forwarder in `token`.
#[derive(Debug)]
pub(crate) struct DownlinkEnvelope {
    pub ctx: MessageContext,
    pub token: AgentUplinkToken,
    pub message: pb::DownlinkMessage,
}

/// Ingress channel that outlives pipeline generations.
pub(crate) struct Ingress<T> {
    pub tx: mpsc::Sender<T>,
    pub rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> Ingress<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

pub(crate) struct ForwarderRole {
    pub worker_pool: WorkerPoolConfig,
    pub upstream: Ingress<UplinkEnvelope>,
    pub publish_stats: Arc<PoolStats>,
    pub subscribe_stats: Arc<PoolStats>,
}

pub(crate) struct HomeNetworkRole {
    pub worker_pool: WorkerPoolConfig,
    pub dev_addr_prefixes: Vec<DevAddrPrefix>,
    pub downstream: Ingress<DownlinkEnvelope>,
    pub subscribe_stats: Arc<PoolStats>,
    pub publish_stats: Arc<PoolStats>,
}

/// State shared by the pipelines and the gRPC services.
pub(crate) struct AgentInner {
    pub net_id: NetId,
    pub cluster_id: String,
    pub home_network_cluster_id: String,
    pub dialer: Dialer,
    pub codec: TokenCodec,
    pub tenant_fillers: Vec<Arc<dyn TenantContextFiller>>,
    pub tenant_extractor: TenantExtractor,
    pub peers: Arc<dyn PeerResolver>,
    pub encrypter: Arc<dyn MessageEncrypter>,
    pub cluster_auth: ClusterAuth,
    pub forwarder: Option<ForwarderRole>,
    pub home_network: Option<HomeNetworkRole>,
}

/// Packet Broker Agent.
///
/// Built with [`AgentBuilder`]; [`Agent::start`] registers the pipelines of
/// the enabled roles.
pub struct Agent {
    inner: Arc<AgentInner>,
    task_backoff: ExponentialBuilder,
    tracker: TaskTracker,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn net_id(&self) -> NetId {
        self.inner.net_id
    }

    /// Start the pipelines of the enabled roles.
    ///
    /// Pipelines restart on failure until `cancel` is cancelled.
    pub fn start(&self, cancel: &CancellationToken) {
        if self.inner.forwarder.is_some() {
            self.spawn_pipeline(cancel, Pipeline::ForwarderPublish, forwarder::publish_uplink);
            self.spawn_pipeline(cancel, Pipeline::ForwarderSubscribe, forwarder::subscribe_downlink);
        }
        if self.inner.home_network.is_some() {
            self.spawn_pipeline(cancel, Pipeline::HomeNetworkSubscribe, home_network::subscribe_uplink);
            self.spawn_pipeline(cancel, Pipeline::HomeNetworkPublish, home_network::publish_downlink);
        }
    }

    /// Wait for all pipelines to stop after cancellation.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Worker pool counters of `pipeline`, if its role is enabled.
    pub fn pool_stats(&self, pipeline: Pipeline) -> Option<Arc<PoolStats>> {
        let inner = &self.inner;
        match pipeline {
            Pipeline::ForwarderPublish => inner.forwarder.as_ref().map(|r| r.publish_stats.clone()),
            Pipeline::ForwarderSubscribe => {
                inner.forwarder.as_ref().map(|r| r.subscribe_stats.clone())
            }
            Pipeline::HomeNetworkSubscribe => inner
                .home_network
                .as_ref()
                .map(|r| r.subscribe_stats.clone()),
            Pipeline::HomeNetworkPublish => {
                inner.home_network.as_ref().map(|r| r.publish_stats.clone())
            }
        }
    }

    /// GsPba service for local Gateway Servers.
    pub fn gs_pba_service(&self) -> GsPbaService {
        GsPbaService::new(self.inner.clone())
    }

    /// NsPba service for local Network Servers.
    pub fn ns_pba_service(&self) -> NsPbaService {
        NsPbaService::new(self.inner.clone())
    }

    /// Interceptor authenticating inbound cluster calls.
    pub fn cluster_auth(&self) -> ClusterAuth {
        self.inner.cluster_auth.clone()
    }

    fn spawn_pipeline<F, Fut>(&self, cancel: &CancellationToken, pipeline: Pipeline, run: F)
    where
        F: Fn(Arc<AgentInner>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let config = TaskConfig::new(pipeline.task_id()).with_backoff(self.task_backoff.clone());
        let cancel = cancel.clone();
        self.tracker.spawn(async move {
            let result = task::run_task(cancel, config, move |token| run(inner.clone(), token)).await;
            if let Err(e) = result {
                warn!(pipeline = %pipeline, error = %e, "Pipeline stopped");
            }
        });
        info!(pipeline = %pipeline, "Pipeline registered");
    }
}

/// Builds an [`Agent`] from configuration and optional collaborators.
pub struct AgentBuilder {
    config: AgentConfig,
    tenant_fillers: Vec<Arc<dyn TenantContextFiller>>,
    tenant_extractor: Option<TenantExtractor>,
    peers: Option<Arc<dyn PeerResolver>>,
    encrypter: Option<Arc<dyn MessageEncrypter>>,
    dialer: Option<Dialer>,
    task_backoff: ExponentialBuilder,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            tenant_fillers: Vec::new(),
            tenant_extractor: None,
            peers: None,
            encrypter: None,
            dialer: None,
            task_backoff: dial_task_backoff(),
        }
    }

    /// Append a tenant context filler. Fillers run in order.
    pub fn with_tenant_context_filler(mut self, filler: Arc<dyn TenantContextFiller>) -> Self {
        self.tenant_fillers.push(filler);
        self
    }

    /// Replace the extractor that resolves the tenant of a message.
    pub fn with_tenant_extractor(mut self, extractor: TenantExtractor) -> Self {
        self.tenant_extractor = Some(extractor);
        self
    }

    /// Replace the static peers from configuration.
    pub fn with_peer_resolver(mut self, peers: Arc<dyn PeerResolver>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_message_encrypter(mut self, encrypter: Arc<dyn MessageEncrypter>) -> Self {
        self.encrypter = Some(encrypter);
        self
    }

    /// Replace the data plane dialer built from configuration.
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Backoff between pipeline generations.
    pub fn with_task_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.task_backoff = backoff;
        self
    }

    /// Validate the configuration and build the agent.
    pub fn build(self) -> Result<Agent, AgentError> {
        let config = self.config;

        let net_id: NetId = config.net_id.parse().map_err(AgentError::InvalidNetId)?;
        config
            .authentication_mode
            .parse::<AuthenticationMode>()?;
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Dialer::from_config(&config)?,
        };

        let codec = TokenCodec::new(&token_key(&config.token_key)?)?;

        let cluster_auth =
            ClusterAuth::new(&config.cluster.key).map_err(AgentError::Credentials)?;

        let forwarder = config.forwarder.enable.then(|| ForwarderRole {
            worker_pool: config.forwarder.worker_pool.clone(),
            upstream: Ingress::new(UPSTREAM_BUFFER_SIZE),
            publish_stats: Arc::default(),
            subscribe_stats: Arc::default(),
        });

        let home_network = if config.home_network.enable {
            let mut dev_addr_prefixes = config
                .home_network
                .dev_addr_prefixes
                .iter()
                .map(|prefix| {
                    prefix
                        .parse::<DevAddrPrefix>()
                        .map_err(|source| AgentError::DevAddrPrefix {
                            prefix: prefix.clone(),
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if dev_addr_prefixes.is_empty() {
                dev_addr_prefixes.push(net_id.dev_addr_prefix());
            }
            Some(HomeNetworkRole {
                worker_pool: config.home_network.worker_pool.clone(),
                dev_addr_prefixes,
                downstream: Ingress::new(DOWNSTREAM_BUFFER_SIZE),
                subscribe_stats: Arc::default(),
                publish_stats: Arc::default(),
            })
        } else {
            None
        };

        let inner = AgentInner {
            net_id,
            home_network_cluster_id: config.home_network_cluster_id().to_string(),
            cluster_id: config.cluster_id.clone(),
            dialer,
            codec,
            tenant_fillers: self.tenant_fillers,
            tenant_extractor: self
                .tenant_extractor
                .unwrap_or_else(|| default_tenant_extractor(config.tenant_id.clone())),
            peers: self
                .peers
                .unwrap_or_else(|| Arc::new(StaticPeers::from_config(&config.cluster))),
            encrypter: self
                .encrypter
                .unwrap_or_else(|| Arc::new(PlaintextPayloads)),
            cluster_auth,
            forwarder,
            home_network,
        };

        info!(
            net_id = %net_id,
            cluster_id = %inner.cluster_id,
            home_network_cluster_id = %inner.home_network_cluster_id,
            forwarder = inner.forwarder.is_some(),
            home_network = inner.home_network.is_some(),
            "Packet Broker Agent configured"
        );

        Ok(Agent {
            inner: Arc::new(inner),
            task_backoff: self.task_backoff,
            tracker: TaskTracker::new(),
        })
    }
}

/// Decode the configured token key, generating one when empty.
fn token_key(hex_key: &str) -> Result<Vec<u8>, AgentError> {
    if !hex_key.is_empty() {
        return Ok(hex::decode(hex_key.trim())?);
    }
    let key = TokenCodec::generate_key().map_err(AgentError::KeyGeneration)?;
    warn!(
        token_key = %hex::encode(&key),
        "No token key configured, generated a random one; tokens issued before a restart cannot be decrypted after it"
    );
    Ok(key)
}
