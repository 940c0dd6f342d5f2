//! Correlation IDs for cross-system tracing.
//!
//! Every broker connection and every relayed message is tagged, e.g.
//! `pba:conn:up:<uuid>` or `pba:uplink:<broker message id>`.

use tonic::metadata::{MetadataMap, MetadataValue};

/// gRPC metadata key carrying correlation IDs, one value per ID.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Generate a fresh correlation ID.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Correlation ID of a broker connection (`pba:conn:<direction>:<id>`).
pub fn connection_correlation_id(direction: &str) -> String {
    format!("pba:conn:{}:{}", direction, new_correlation_id())
}

/// Correlation ID of an uplink routed by the broker.
pub fn uplink_correlation_id(message_id: &str) -> String {
    format!("pba:uplink:{}", message_id)
}

/// Correlation ID of a downlink routed by the broker.
pub fn downlink_correlation_id(message_id: &str) -> String {
    format!("pba:downlink:{}", message_id)
}

/// Create a tonic Request carrying correlation IDs as gRPC metadata.
pub fn correlated_request<T>(msg: T, correlation_ids: &[String]) -> tonic::Request<T> {
    let mut req = tonic::Request::new(msg);
    for id in correlation_ids {
        if let Ok(val) = MetadataValue::try_from(id.as_str()) {
            req.metadata_mut().append(CORRELATION_ID_HEADER, val);
        }
    }
    req
}

/// Read correlation IDs from incoming gRPC metadata.
pub fn correlation_ids(metadata: &MetadataMap) -> Vec<String> {
    metadata
        .get_all(CORRELATION_ID_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}
