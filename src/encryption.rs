//! Payload encryption between the agent and the broker.

use async_trait::async_trait;

use crate::proto::packetbroker::{phy_payload, UplinkMessage};

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Encrypted payload with KEK label `{0}` is not supported")]
    Unsupported(String),

    #[error("Message has no payload")]
    NoPayload,
}

/// Encrypts uplink payloads before publishing and decrypts routed ones.
#[async_trait]
pub trait MessageEncrypter: Send + Sync {
    async fn encrypt_uplink(&self, msg: &mut UplinkMessage) -> Result<(), EncryptionError>;
    async fn decrypt_uplink(&self, msg: &mut UplinkMessage) -> Result<(), EncryptionError>;
}

/// Sends payloads in the clear and accepts only plain payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextPayloads;

#[async_trait]
impl MessageEncrypter for PlaintextPayloads {
    async fn encrypt_uplink(&self, _msg: &mut UplinkMessage) -> Result<(), EncryptionError> {
        Ok(())
    }

    async fn decrypt_uplink(&self, msg: &mut UplinkMessage) -> Result<(), EncryptionError> {
        let value = msg
            .phy_payload
            .as_ref()
            .and_then(|p| p.value.as_ref())
            .ok_or(EncryptionError::NoPayload)?;
        match value {
            phy_payload::Value::Plain(_) => Ok(()),
            phy_payload::Value::Encrypted(encrypted) => {
                Err(EncryptionError::Unsupported(encrypted.kek_label.clone()))
            }
        }
    }
}
