//! Packet Broker Agent configuration.

use serde::Deserialize;

use crate::pool::WorkerPoolConfig;

/// Default Packet Broker data plane address.
pub const DEFAULT_DATA_PLANE_ADDRESS: &str = "dp.packetbroker.net:443";

/// Default OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://iam.packetbroker.net/token";

/// Agent configuration.
///
/// Values are kept as written; parsing and validation happen when the
/// agent is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker data plane endpoint (`host:port` or a full URI).
    pub data_plane_address: String,
    /// NetID of this network, hex encoded.
    pub net_id: String,
    /// Tenant used when a message carries none.
    pub tenant_id: String,
    pub cluster_id: String,
    /// Home Network cluster ID. Empty means `cluster_id`.
    pub home_network_cluster_id: String,
    /// `tls` or `oauth2`.
    pub authentication_mode: String,
    /// Dial the data plane without transport security (OAuth2 only).
    pub insecure: bool,
    pub tls: TlsConfig,
    pub oauth2: OAuth2Config,
    /// Hex encoded 16 or 32 byte token key. Generated when empty.
    pub token_key: String,
    pub forwarder: ForwarderConfig,
    pub home_network: HomeNetworkConfig,
    pub cluster: ClusterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_plane_address: DEFAULT_DATA_PLANE_ADDRESS.to_string(),
            net_id: "000000".to_string(),
            tenant_id: String::new(),
            cluster_id: String::new(),
            home_network_cluster_id: String::new(),
            authentication_mode: "oauth2".to_string(),
            insecure: false,
            tls: TlsConfig::default(),
            oauth2: OAuth2Config::default(),
            token_key: String::new(),
            forwarder: ForwarderConfig::default(),
            home_network: HomeNetworkConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Effective Home Network cluster ID.
    pub fn home_network_cluster_id(&self) -> &str {
        if self.home_network_cluster_id.is_empty() {
            &self.cluster_id
        } else {
            &self.home_network_cluster_id
        }
    }
}

/// PEM files for TLS client authentication.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle. Native roots are used when empty.
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

/// OAuth2 client credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

/// Forwarder role.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub enable: bool,
    pub worker_pool: WorkerPoolConfig,
}

/// Home Network role.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HomeNetworkConfig {
    pub enable: bool,
    /// DevAddr prefixes to subscribe to, as `ADDR/LENGTH`. Derived from the
    /// NetID when empty.
    pub dev_addr_prefixes: Vec<String>,
    pub worker_pool: WorkerPoolConfig,
}

/// Local cluster peers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub gateway_server_address: String,
    pub network_server_address: String,
    /// Shared cluster key. Empty disables cluster authentication.
    pub key: String,
}
