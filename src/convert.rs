//! Conversion between broker messages and local cluster messages.
//!
//! Uplink tokens ride along in both directions:
//!
//! ```text
//! GS uplink ──▶ forwarder_uplink_token = seal(gateway_id, GS uplink_token)
//!            broker ──▶ HN: rx_metadata.agent_uplink_token = seal(forwarder ids)
//!                           rx_metadata.forwarder_uplink_token (echoed)
//! NS downlink ──▶ broker ──▶ Forwarder: open(forwarder_uplink_token) ──▶ GS
//! ```

use std::time::SystemTime;

use crate::correlation;
use crate::proto::packetbroker::{
    self as pb, phy_payload, DownlinkRxWindow, GatewayMetadata, PhyPayload, RoutedDownlinkMessage,
    RoutedUplinkMessage,
};
use crate::proto::pba;
use crate::token::{ForwarderUplinkToken, TokenCodec, TokenError};
use crate::types::{IdentifierError, NetId};

/// Gateway ID of the rx metadata entry added when the broker reports none.
pub const PACKET_BROKER_GATEWAY_ID: &str = "packetbroker";

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Routed message has no message")]
    NoMessage,

    #[error("Message has no payload")]
    NoPayload,

    #[error("Payload is encrypted")]
    EncryptedPayload,

    #[error("Uplink has no transmission settings")]
    NoSettings,

    #[error("Downlink has no transmission request")]
    NoRequest,

    #[error("Downlink has no RX window")]
    NoRxWindow,

    #[error("Invalid NetID: {0}")]
    NetId(#[from] IdentifierError),

    #[error("Token: {0}")]
    Token(#[from] TokenError),
}

/// Convert a Gateway Server uplink for publishing to the broker.
///
/// The first rx metadata entry addresses the downlink path; it is sealed in
/// the forwarder uplink token.
pub fn to_broker_uplink(
    msg: &pba::UplinkMessage,
    codec: &TokenCodec,
) -> Result<pb::UplinkMessage, ConvertError> {
    if msg.raw_payload.is_empty() {
        return Err(ConvertError::NoPayload);
    }
    let settings = msg.settings.as_ref().ok_or(ConvertError::NoSettings)?;

    let forwarder_uplink_token = match msg.rx_metadata.first() {
        Some(md) => codec.encrypt_forwarder_token(&ForwarderUplinkToken {
            gateway_id: md.gateway_id.clone(),
            gateway_uplink_token: md.uplink_token.clone(),
        })?,
        None => Vec::new(),
    };

    Ok(pb::UplinkMessage {
        phy_payload: Some(PhyPayload {
            value: Some(phy_payload::Value::Plain(msg.raw_payload.clone())),
        }),
        frequency: settings.frequency,
        data_rate_index: settings.data_rate_index,
        coding_rate: settings.coding_rate.clone(),
        gateway_metadata: msg
            .rx_metadata
            .iter()
            .map(|md| GatewayMetadata {
                gateway_id: md.gateway_id.clone(),
                antenna_index: md.antenna_index,
                rssi: md.rssi,
                snr: md.snr,
            })
            .collect(),
        forwarder_receive_time: Some(
            msg.received_at
                .clone()
                .unwrap_or_else(|| SystemTime::now().into()),
        ),
        forwarder_uplink_token,
    })
}

/// Convert a routed uplink for the Network Server.
///
/// Every rx metadata entry carries the agent uplink token sealing the
/// forwarder identity, plus the forwarder uplink token as received.
pub fn from_broker_uplink(
    routed: &RoutedUplinkMessage,
    codec: &TokenCodec,
) -> Result<pba::UplinkMessage, ConvertError> {
    let msg = routed.message.as_ref().ok_or(ConvertError::NoMessage)?;
    let raw_payload = match msg.phy_payload.as_ref().and_then(|p| p.value.as_ref()) {
        Some(phy_payload::Value::Plain(plain)) => plain.clone(),
        Some(phy_payload::Value::Encrypted(_)) => return Err(ConvertError::EncryptedPayload),
        None => return Err(ConvertError::NoPayload),
    };

    let agent_uplink_token = codec.encrypt(
        NetId::new(routed.forwarder_net_id)?,
        &routed.forwarder_tenant_id,
        &routed.forwarder_cluster_id,
    )?;

    let mut rx_metadata: Vec<pba::RxMetadata> = msg
        .gateway_metadata
        .iter()
        .map(|md| pba::RxMetadata {
            gateway_id: md.gateway_id.clone(),
            antenna_index: md.antenna_index,
            rssi: md.rssi,
            snr: md.snr,
            uplink_token: Vec::new(),
            forwarder_uplink_token: msg.forwarder_uplink_token.clone(),
            agent_uplink_token: agent_uplink_token.clone(),
        })
        .collect();
    if rx_metadata.is_empty() {
        rx_metadata.push(pba::RxMetadata {
            gateway_id: PACKET_BROKER_GATEWAY_ID.to_string(),
            forwarder_uplink_token: msg.forwarder_uplink_token.clone(),
            agent_uplink_token,
            ..Default::default()
        });
    }

    Ok(pba::UplinkMessage {
        raw_payload,
        settings: Some(pba::TxSettings {
            frequency: msg.frequency,
            data_rate_index: msg.data_rate_index,
            coding_rate: msg.coding_rate.clone(),
        }),
        rx_metadata,
        received_at: Some(SystemTime::now().into()),
        correlation_ids: vec![correlation::uplink_correlation_id(&routed.id)],
    })
}

/// Convert a routed downlink for the Gateway Server.
///
/// Returns the destination gateway ID, opened from the forwarder uplink token.
pub fn from_broker_downlink(
    routed: &RoutedDownlinkMessage,
    codec: &TokenCodec,
) -> Result<(String, pba::DownlinkMessage), ConvertError> {
    let msg = routed.message.as_ref().ok_or(ConvertError::NoMessage)?;
    if msg.phy_payload.is_empty() {
        return Err(ConvertError::NoPayload);
    }
    let token = codec.decrypt_forwarder_token(&msg.forwarder_uplink_token)?;

    let rx1 = msg.rx1.clone().unwrap_or_default();
    let rx2 = msg.rx2.clone().unwrap_or_default();
    let down = pba::DownlinkMessage {
        raw_payload: msg.phy_payload.clone(),
        request: Some(pba::TxRequest {
            class: msg.class,
            priority: msg.priority,
            rx1_delay: msg.rx1_delay.clone(),
            rx1_data_rate_index: rx1.data_rate_index,
            rx1_frequency: rx1.frequency,
            rx2_data_rate_index: rx2.data_rate_index,
            rx2_frequency: rx2.frequency,
            frequency_plan_id: msg.frequency_plan_id.clone(),
        }),
        uplink_token: token.gateway_uplink_token,
        forwarder_uplink_token: msg.forwarder_uplink_token.clone(),
        agent_uplink_token: Vec::new(),
        correlation_ids: vec![correlation::downlink_correlation_id(&routed.id)],
    };
    Ok((token.gateway_id, down))
}

/// Convert a Network Server downlink for publishing to the broker.
pub fn to_broker_downlink(msg: &pba::DownlinkMessage) -> Result<pb::DownlinkMessage, ConvertError> {
    if msg.raw_payload.is_empty() {
        return Err(ConvertError::NoPayload);
    }
    let req = msg.request.as_ref().ok_or(ConvertError::NoRequest)?;
    let window = |data_rate_index: u32, frequency: u64| {
        (frequency != 0).then_some(DownlinkRxWindow {
            data_rate_index,
            frequency,
        })
    };
    let rx1 = window(req.rx1_data_rate_index, req.rx1_frequency);
    let rx2 = window(req.rx2_data_rate_index, req.rx2_frequency);
    if rx1.is_none() && rx2.is_none() {
        return Err(ConvertError::NoRxWindow);
    }

    Ok(pb::DownlinkMessage {
        phy_payload: msg.raw_payload.clone(),
        class: req.class,
        priority: req.priority,
        rx1_delay: req.rx1_delay.clone(),
        rx1,
        rx2,
        frequency_plan_id: req.frequency_plan_id.clone(),
        forwarder_uplink_token: msg.forwarder_uplink_token.clone(),
    })
}
