//! Home Network subscription filters.

use crate::proto::packetbroker::routing_filter::{join_request, JoinRequest, MacPayload, Message};
use crate::proto::packetbroker::{self as pb, RoutingFilter};
use crate::types::{DevAddrPrefix, Eui64};

/// Filters for a Home Network subscription.
///
/// One filter matches data frames by `prefixes`; one matches every
/// join-request regardless of JoinEUI and DevEUI.
pub fn subscription_filters(prefixes: &[DevAddrPrefix]) -> Vec<RoutingFilter> {
    let mac = MacPayload {
        dev_addr_prefixes: prefixes
            .iter()
            .map(|p| pb::DevAddrPrefix {
                value: p.dev_addr.0,
                length: u32::from(p.length),
            })
            .collect(),
    };
    let join_request = JoinRequest {
        eui_prefixes: vec![join_request::EuiPrefixes::default()],
    };
    vec![
        RoutingFilter {
            message: Some(Message::Mac(mac)),
        },
        RoutingFilter {
            message: Some(Message::JoinRequest(join_request)),
        },
    ]
}

/// Human readable filters, one entry per filter.
pub fn format_filters(filters: &[RoutingFilter]) -> Vec<String> {
    filters
        .iter()
        .map(|filter| match &filter.message {
            Some(Message::Mac(mac)) => {
                let prefixes: Vec<String> = mac
                    .dev_addr_prefixes
                    .iter()
                    .map(|p| format!("{:08X}/{}", p.value, p.length))
                    .collect();
                format!("MAC [{}]", prefixes.join(" "))
            }
            Some(Message::JoinRequest(join)) => {
                let prefixes: Vec<String> = join
                    .eui_prefixes
                    .iter()
                    .map(|p| {
                        format!(
                            "[JoinEUI: {}/{} DevEUI: {}/{}]",
                            Eui64(p.join_eui),
                            p.join_eui_length,
                            Eui64(p.dev_eui),
                            p.dev_eui_length
                        )
                    })
                    .collect();
                format!("JoinRequest {}", prefixes.join(" "))
            }
            None => "None".to_string(),
        })
        .collect()
}
