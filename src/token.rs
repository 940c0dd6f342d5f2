//! Authenticated tokens that round-trip through the broker.
//!
//! Tokens are sealed with AES-GCM (AES-128 for a 16-byte key, AES-256 for a
//! 32-byte key) under a random 96-bit nonce:
//!
//! ```text
//! token = nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! Each token kind binds its own associated data, so a forwarder uplink token
//! never opens as an agent uplink token and vice versa.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::NetId;

const AGENT_UPLINK_AAD: &[u8] = b"pba:agent-uplink-token";
const FORWARDER_UPLINK_AAD: &[u8] = b"pba:forwarder-uplink-token";

/// Token key of an unsupported length.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token key length {length}, expected 16 or 32 bytes")]
pub struct TokenKeyError {
    pub length: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token was not produced by this codec's key, or was altered.
    #[error("failed to decrypt token")]
    Decrypt,

    #[error("failed to encrypt token")]
    Encrypt,

    #[error("failed to encode token: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Forwarder identity carried from the Home Network to its downlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUplinkToken {
    pub forwarder_net_id: NetId,
    pub forwarder_tenant_id: String,
    pub forwarder_cluster_id: String,
}

#[derive(Serialize, Deserialize)]
struct AgentUplinkTokenPayload {
    #[serde(rename = "n")]
    net_id: u32,
    #[serde(rename = "t", default, skip_serializing_if = "String::is_empty")]
    tenant_id: String,
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    cluster_id: String,
}

/// Gateway addressing sealed into the broker's `forwarder_uplink_token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderUplinkToken {
    #[serde(rename = "g")]
    pub gateway_id: String,
    #[serde(rename = "t", with = "base64_bytes", default)]
    pub gateway_uplink_token: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Stateless token encrypter/decrypter keyed by a symmetric secret.
pub struct TokenCodec {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", self.key.algorithm())
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Create a codec from a 16-byte (AES-128-GCM) or 32-byte (AES-256-GCM) key.
    pub fn new(key: &[u8]) -> Result<Self, TokenKeyError> {
        let algorithm = match key.len() {
            16 => &AES_128_GCM,
            32 => &AES_256_GCM,
            length => return Err(TokenKeyError { length }),
        };
        let unbound =
            UnboundKey::new(algorithm, key).map_err(|_| TokenKeyError { length: key.len() })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Generate a random 16-byte key.
    pub fn generate_key() -> Result<Vec<u8>, TokenError> {
        let mut key = vec![0u8; 16];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| TokenError::Encrypt)?;
        Ok(key)
    }

    /// Encrypt the forwarder identity triple.
    pub fn encrypt(
        &self,
        forwarder_net_id: NetId,
        forwarder_tenant_id: &str,
        forwarder_cluster_id: &str,
    ) -> Result<Vec<u8>, TokenError> {
        let payload = AgentUplinkTokenPayload {
            net_id: forwarder_net_id.to_number(),
            tenant_id: forwarder_tenant_id.to_string(),
            cluster_id: forwarder_cluster_id.to_string(),
        };
        self.seal(&payload, AGENT_UPLINK_AAD)
    }

    /// Decrypt a token produced by [`TokenCodec::encrypt`] with the same key.
    pub fn decrypt(&self, token: &[u8]) -> Result<AgentUplinkToken, TokenError> {
        let payload: AgentUplinkTokenPayload = self.open(token, AGENT_UPLINK_AAD)?;
        Ok(AgentUplinkToken {
            forwarder_net_id: NetId::new(payload.net_id).map_err(|_| TokenError::Decrypt)?,
            forwarder_tenant_id: payload.tenant_id,
            forwarder_cluster_id: payload.cluster_id,
        })
    }

    pub fn encrypt_forwarder_token(
        &self,
        token: &ForwarderUplinkToken,
    ) -> Result<Vec<u8>, TokenError> {
        self.seal(token, FORWARDER_UPLINK_AAD)
    }

    pub fn decrypt_forwarder_token(&self, token: &[u8]) -> Result<ForwarderUplinkToken, TokenError> {
        self.open(token, FORWARDER_UPLINK_AAD)
    }

    fn seal<T: Serialize>(&self, value: &T, aad: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| TokenError::Encrypt)?;

        let mut in_out = serde_json::to_vec(value)?;
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| TokenError::Encrypt)?;

        let mut token = Vec::with_capacity(NONCE_LEN + in_out.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&in_out);
        Ok(token)
    }

    fn open<T: DeserializeOwned>(&self, token: &[u8], aad: &[u8]) -> Result<T, TokenError> {
        if token.len() < NONCE_LEN + self.key.algorithm().tag_len() {
            return Err(TokenError::Decrypt);
        }
        let (nonce, ciphertext) = token.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| TokenError::Decrypt)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| TokenError::Decrypt)?;
        serde_json::from_slice(plaintext).map_err(|_| TokenError::Decrypt)
    }
}
