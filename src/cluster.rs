//! Local cluster peers.
//!
//! The agent forwards routed downlinks to a Gateway Server and routed
//! uplinks to a Network Server. Peers are resolved through [`PeerResolver`];
//! [`StaticPeers`] serves fixed addresses from configuration.
//!
//! Calls between the agent and its peers are authenticated with a shared
//! cluster key carried in the `x-cluster-key` metadata ([`ClusterAuth`]).

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tonic::metadata::{AsciiMetadataValue, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::lorawan::UplinkIdentifiers;

/// gRPC metadata key carrying the shared cluster key.
pub const CLUSTER_KEY_HEADER: &str = "x-cluster-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    GatewayServer,
    NetworkServer,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::GatewayServer => write!(f, "gateway_server"),
            ClusterRole::NetworkServer => write!(f, "network_server"),
        }
    }
}

/// What a peer is resolved for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentifiers {
    Gateway(String),
    Device(UplinkIdentifiers),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("No {0} peer available")]
    Unavailable(ClusterRole),

    #[error("Invalid {role} address `{address}`: {source}")]
    Address {
        role: ClusterRole,
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Resolves the cluster peer serving a role for the given identifiers.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn get_peer(
        &self,
        role: ClusterRole,
        ids: &PeerIdentifiers,
    ) -> Result<Channel, PeerError>;
}

/// Peers at fixed addresses, connected lazily and cached.
pub struct StaticPeers {
    addresses: HashMap<ClusterRole, String>,
    channels: RwLock<HashMap<ClusterRole, Channel>>,
}

impl StaticPeers {
    pub fn new() -> Self {
        Self {
            addresses: HashMap::new(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register `address` for `role`. Addresses without a scheme use http.
    pub fn with_peer(mut self, role: ClusterRole, address: impl Into<String>) -> Self {
        let address = address.into();
        info!(role = %role, address = %address, "Registered static peer");
        self.addresses.insert(role, address);
        self
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut peers = Self::new();
        if !config.gateway_server_address.is_empty() {
            peers = peers.with_peer(ClusterRole::GatewayServer, &config.gateway_server_address);
        }
        if !config.network_server_address.is_empty() {
            peers = peers.with_peer(ClusterRole::NetworkServer, &config.network_server_address);
        }
        peers
    }
}

impl Default for StaticPeers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerResolver for StaticPeers {
    async fn get_peer(
        &self,
        role: ClusterRole,
        _ids: &PeerIdentifiers,
    ) -> Result<Channel, PeerError> {
        if let Some(channel) = self.channels.read().await.get(&role) {
            return Ok(channel.clone());
        }

        let address = self
            .addresses
            .get(&role)
            .ok_or(PeerError::Unavailable(role))?;
        let uri = if address.contains("://") {
            address.clone()
        } else {
            format!("http://{}", address)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|source| PeerError::Address {
                role,
                address: address.clone(),
                source,
            })?
            .connect_lazy();

        debug!(role = %role, address = %address, "Connected to peer");
        let mut channels = self.channels.write().await;
        Ok(channels.entry(role).or_insert(channel).clone())
    }
}

/// Shared-key authentication between cluster members.
///
/// With no key configured every call passes.
#[derive(Debug, Clone, Default)]
pub struct ClusterAuth {
    key: Option<AsciiMetadataValue>,
}

impl ClusterAuth {
    pub fn new(key: &str) -> Result<Self, String> {
        if key.is_empty() {
            return Ok(Self::default());
        }
        let key = MetadataValue::try_from(key).map_err(|e| e.to_string())?;
        Ok(Self { key: Some(key) })
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Attach the cluster key to an outgoing request.
    pub fn authorize<T>(&self, req: &mut Request<T>) {
        if let Some(key) = &self.key {
            req.metadata_mut().insert(CLUSTER_KEY_HEADER, key.clone());
        }
    }
}

impl Interceptor for ClusterAuth {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        let Some(expected) = &self.key else {
            return Ok(req);
        };
        match req.metadata().get(CLUSTER_KEY_HEADER) {
            Some(key) if key == expected => Ok(req),
            Some(_) => Err(Status::unauthenticated("invalid cluster key")),
            None => Err(Status::unauthenticated("missing cluster key")),
        }
    }
}
