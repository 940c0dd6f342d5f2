//! Error types, one enum per failure scope.
//!
//! - [`AgentError`]: construction failed, the agent does not start.
//! - [`PipelineError`]: ends a pipeline generation; the task supervisor restarts it.
//! - [`MessageError`]: drops one message; the pipeline continues.

use tonic::Status;

use crate::cluster::PeerError;
use crate::connection::DialError;
use crate::convert::ConvertError;
use crate::encryption::EncryptionError;
use crate::lorawan::IdentifiersError;
use crate::tenant::TenantError;
use crate::token::{TokenError, TokenKeyError};
use crate::types::IdentifierError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid NetID: {0}")]
    InvalidNetId(#[source] IdentifierError),

    #[error("Invalid authentication mode `{0}`, expected `tls` or `oauth2`")]
    AuthenticationMode(String),

    #[error("Invalid token key: {0}")]
    TokenKey(#[from] TokenKeyError),

    #[error("Token key is not valid hex: {0}")]
    TokenKeyEncoding(#[from] hex::FromHexError),

    #[error("Invalid DevAddr prefix `{prefix}`: {source}")]
    DevAddrPrefix {
        prefix: String,
        #[source]
        source: IdentifierError,
    },

    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("Token key generation failed: {0}")]
    KeyGeneration(#[source] TokenError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("Stream error: {0}")]
    Stream(#[from] Status),

    #[error("Stream closed by broker")]
    StreamClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Ingress channel closed")]
    IngressClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Tenant context: {0}")]
    TenantFill(#[from] TenantError),

    #[error("Convert: {0}")]
    Convert(#[from] ConvertError),

    #[error("Peer: {0}")]
    Peer(#[from] PeerError),

    #[error("RPC failed: {0}")]
    Rpc(#[from] Status),

    #[error("RPC timed out")]
    Timeout,

    #[error("Token: {0}")]
    Token(#[from] TokenError),

    #[error("Message identifiers: {0}")]
    Identifiers(#[from] IdentifiersError),

    #[error("Decrypt: {0}")]
    Decrypt(#[from] EncryptionError),

    #[error("Message has no payload")]
    NoPayload,
}
