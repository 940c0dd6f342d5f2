//! Connections to the broker data plane.
//!
//! A [`Dialer`] holds the endpoint and credentials; every pipeline generation
//! dials its own [`Connection`] and drops it when the generation ends.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Request, Status};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::correlation::{connection_correlation_id, correlated_request};
use crate::error::AgentError;
use crate::oauth2::TokenSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Dial cancelled")]
    Cancelled,
}

/// How the agent authenticates with the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// TLS client certificate.
    Tls,
    /// OAuth2 client credentials as per-RPC bearer token.
    OAuth2,
}

impl FromStr for AuthenticationMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tls" => Ok(Self::Tls),
            "oauth2" => Ok(Self::OAuth2),
            other => Err(AgentError::AuthenticationMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum PerRpcCredentials {
    None,
    OAuth2(Arc<TokenSource>),
}

/// Dials the data plane with the configured credentials.
#[derive(Debug, Clone)]
pub struct Dialer {
    uri: String,
    tls: Option<ClientTlsConfig>,
    credentials: PerRpcCredentials,
}

impl Dialer {
    /// Dial `address` without transport security or credentials.
    pub fn plaintext(address: &str) -> Self {
        Self {
            uri: endpoint_uri(address, "http"),
            tls: None,
            credentials: PerRpcCredentials::None,
        }
    }

    /// Build a dialer from the agent configuration.
    ///
    /// TLS mode always uses transport security with the configured client
    /// certificate. OAuth2 mode uses transport security unless `insecure`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let mode: AuthenticationMode = config.authentication_mode.parse()?;

        let secure = mode == AuthenticationMode::Tls || !config.insecure;
        let mut tls = if secure {
            let mut tls = ClientTlsConfig::new();
            if config.tls.ca_file.is_empty() {
                tls = tls.with_enabled_roots();
            } else {
                let ca = std::fs::read(&config.tls.ca_file)?;
                tls = tls.ca_certificate(Certificate::from_pem(ca));
            }
            Some(tls)
        } else {
            None
        };

        let credentials = match mode {
            AuthenticationMode::Tls => {
                if config.tls.cert_file.is_empty() || config.tls.key_file.is_empty() {
                    return Err(AgentError::Credentials(
                        "TLS authentication requires cert_file and key_file".to_string(),
                    ));
                }
                let cert = std::fs::read(&config.tls.cert_file)?;
                let key = std::fs::read(&config.tls.key_file)?;
                tls = tls.map(|tls| tls.identity(Identity::from_pem(cert, key)));
                PerRpcCredentials::None
            }
            AuthenticationMode::OAuth2 => {
                if config.oauth2.client_id.is_empty() {
                    return Err(AgentError::Credentials(
                        "OAuth2 authentication requires client_id".to_string(),
                    ));
                }
                PerRpcCredentials::OAuth2(Arc::new(TokenSource::new(
                    config.oauth2.token_url.clone(),
                    config.oauth2.client_id.clone(),
                    config.oauth2.client_secret.clone(),
                )))
            }
        };

        let scheme = if tls.is_some() { "https" } else { "http" };
        Ok(Self {
            uri: endpoint_uri(&config.data_plane_address, scheme),
            tls,
            credentials,
        })
    }

    #[cfg(test)]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connect, blocking until connected, failed or cancelled.
    ///
    /// `direction` tags the connection correlation ID (`up` or `down`).
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        direction: &str,
    ) -> Result<Connection, DialError> {
        let mut endpoint = Endpoint::from_shared(self.uri.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        debug!(uri = %self.uri, "Dialing data plane");
        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            channel = endpoint.connect() => channel?,
        };

        let correlation_id = connection_correlation_id(direction);
        info!(uri = %self.uri, correlation_id = %correlation_id, "Connected to data plane");
        Ok(Connection {
            channel,
            credentials: self.credentials.clone(),
            correlation_id,
        })
    }
}

/// An established data plane connection.
///
/// Closed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    channel: Channel,
    credentials: PerRpcCredentials,
    correlation_id: String,
}

impl Connection {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Build a request carrying credentials and correlation IDs.
    ///
    /// The connection correlation ID is added in front of `correlation_ids`.
    pub async fn request<T>(&self, msg: T, correlation_ids: &[String]) -> Result<Request<T>, Status> {
        let mut ids = Vec::with_capacity(correlation_ids.len() + 1);
        ids.push(self.correlation_id.clone());
        ids.extend_from_slice(correlation_ids);
        let mut req = correlated_request(msg, &ids);

        if let PerRpcCredentials::OAuth2(source) = &self.credentials {
            let token = source
                .token()
                .await
                .map_err(|e| Status::unauthenticated(e.to_string()))?;
            let value = MetadataValue::try_from(format!("Bearer {}", token))
                .map_err(|_| Status::unauthenticated("invalid access token"))?;
            req.metadata_mut().insert("authorization", value);
        }
        Ok(req)
    }
}

fn endpoint_uri(address: &str, scheme: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{}", scheme, address)
    }
}
