//! Home Network role: routed uplinks to the Network Server, downlinks back
//! to the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Code;

use pb_agent::proto::packetbroker::routing_filter::Message;
use pb_agent::proto::packetbroker::{
    phy_payload, DevAddrPrefix, EncryptedPayload, GatewayMetadata, PhyPayload, RoutedUplinkMessage,
    UplinkMessage,
};
use pb_agent::proto::pba::ns_pba_client::NsPbaClient;
use pb_agent::proto::pba::{DownlinkMessage, TxRequest};
use pb_agent::token::TokenCodec;
use pb_agent::types::NetId;
use pb_agent::Pipeline;

use crate::common::*;

fn routed_uplink(id: &str, payload: phy_payload::Value) -> RoutedUplinkMessage {
    RoutedUplinkMessage {
        id: id.to_string(),
        forwarder_net_id: 0x42,
        forwarder_tenant_id: "tenant-b".to_string(),
        forwarder_cluster_id: "cluster-b".to_string(),
        home_network_net_id: 0x13,
        home_network_tenant_id: "ttn".to_string(),
        home_network_cluster_id: "eu1".to_string(),
        message: Some(UplinkMessage {
            phy_payload: Some(PhyPayload {
                value: Some(payload),
            }),
            frequency: 868_300_000,
            data_rate_index: 3,
            gateway_metadata: vec![GatewayMetadata {
                gateway_id: "remote-gw".to_string(),
                rssi: -100.0,
                ..Default::default()
            }],
            forwarder_uplink_token: b"forwarder-token".to_vec(),
            ..Default::default()
        }),
    }
}

fn ns_downlink(agent_uplink_token: Vec<u8>, forwarder_uplink_token: Vec<u8>) -> DownlinkMessage {
    DownlinkMessage {
        raw_payload: vec![0x60, 0x01, 0x00, 0x00, 0x26],
        request: Some(TxRequest {
            class: 0,
            priority: 2,
            rx1_data_rate_index: 3,
            rx1_frequency: 868_300_000,
            rx2_data_rate_index: 0,
            rx2_frequency: 869_525_000,
            frequency_plan_id: "EU_863_870".to_string(),
            ..Default::default()
        }),
        forwarder_uplink_token,
        agent_uplink_token,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_subscription_filters_from_configured_prefix() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let mut config = agent_config(false, true);
    config.home_network.dev_addr_prefixes = vec!["01020304/7".to_string()];
    let agent = agent_builder(config, broker_addr, None, None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    broker.home_network_subscribed(1).await;
    let sub = broker.home_network_subscriptions.lock().unwrap()[0].clone();
    assert_eq!(sub.home_network_net_id, 0x13);
    assert_eq!(sub.home_network_tenant_id, "ttn");
    assert_eq!(sub.home_network_cluster_id, "eu1");
    assert_eq!(sub.group, "eu1");
    assert_eq!(sub.filters.len(), 2);

    let mac: Vec<_> = sub
        .filters
        .iter()
        .filter_map(|f| match &f.message {
            Some(Message::Mac(mac)) => Some(mac.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(mac.len(), 1);
    assert_eq!(
        mac[0].dev_addr_prefixes,
        vec![DevAddrPrefix {
            value: 0x0102_0304,
            length: 7,
        }]
    );

    let joins: Vec<_> = sub
        .filters
        .iter()
        .filter_map(|f| match &f.message {
            Some(Message::JoinRequest(join)) => Some(join.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].eui_prefixes.len(), 1);
    assert_eq!(joins[0].eui_prefixes[0].join_eui_length, 0);
    assert_eq!(joins[0].eui_prefixes[0].dev_eui_length, 0);

    cancel.cancel();
    agent.wait().await;
}

#[tokio::test]
async fn test_uplink_and_downlink_round_trip() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let ns = Arc::new(MockNetworkServer::default());
    let ns_addr = ns.serve().await;
    let agent = agent_builder(agent_config(false, true), broker_addr, None, Some(ns_addr))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let stream = broker.home_network_subscribed(1).await;
    stream
        .send(Ok(routed_uplink(
            "u1",
            phy_payload::Value::Plain(data_uplink(0x2600_0001)),
        )))
        .await
        .unwrap();

    assert!(eventually(|| ns.uplinks.lock().unwrap().len() == 1).await);
    let received = ns.uplinks.lock().unwrap()[0].clone();
    assert_eq!(received.cluster_key.as_deref(), Some(CLUSTER_KEY));
    assert!(received
        .message
        .correlation_ids
        .contains(&"pba:uplink:u1".to_string()));
    assert_eq!(received.message.raw_payload, data_uplink(0x2600_0001));
    let md = &received.message.rx_metadata[0];
    assert_eq!(md.gateway_id, "remote-gw");
    assert_eq!(md.forwarder_uplink_token, b"forwarder-token".to_vec());

    let addr = serve_agent(&agent).await;
    let mut client = NsPbaClient::connect(format!("http://{}", addr)).await.unwrap();
    client
        .publish_downlink(with_cluster_key(ns_downlink(
            md.agent_uplink_token.clone(),
            md.forwarder_uplink_token.clone(),
        )))
        .await
        .unwrap();

    assert!(eventually(|| broker.downlink_count() == 1).await);
    let req = broker.downlinks.lock().unwrap()[0].clone();
    assert_eq!(req.home_network_net_id, 0x13);
    assert_eq!(req.home_network_tenant_id, "ttn");
    assert_eq!(req.home_network_cluster_id, "eu1");
    assert_eq!(req.forwarder_net_id, 0x42);
    assert_eq!(req.forwarder_tenant_id, "tenant-b");
    assert_eq!(req.forwarder_cluster_id, "cluster-b");
    let msg = req.message.unwrap();
    assert_eq!(msg.forwarder_uplink_token, b"forwarder-token".to_vec());
    assert_eq!(msg.rx1.unwrap().frequency, 868_300_000);
    assert_eq!(msg.rx2.unwrap().frequency, 869_525_000);
    assert_eq!(msg.frequency_plan_id, "EU_863_870");

    cancel.cancel();
    agent.wait().await;
}

/// A downlink carrying a token sealed with another key never reaches the
/// broker.
#[tokio::test]
async fn test_downlink_with_foreign_token_is_rejected() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let agent = agent_builder(agent_config(false, true), broker_addr, None, None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let foreign = TokenCodec::new(&[0x5A; 32])
        .unwrap()
        .encrypt(NetId::new(0x42).unwrap(), "tenant-b", "cluster-b")
        .unwrap();
    let addr = serve_agent(&agent).await;
    let mut client = NsPbaClient::connect(format!("http://{}", addr)).await.unwrap();
    let err = client
        .publish_downlink(with_cluster_key(ns_downlink(foreign, Vec::new())))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.downlink_count(), 0);
    let stats = agent.pool_stats(Pipeline::HomeNetworkPublish).unwrap();
    assert_eq!(stats.delivered(), 0);

    cancel.cancel();
    agent.wait().await;
}

#[tokio::test]
async fn test_encrypted_uplink_is_dropped() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let ns = Arc::new(MockNetworkServer::default());
    let ns_addr = ns.serve().await;
    let agent = agent_builder(agent_config(false, true), broker_addr, None, Some(ns_addr))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let stream = broker.home_network_subscribed(1).await;
    stream
        .send(Ok(routed_uplink(
            "u1",
            phy_payload::Value::Encrypted(EncryptedPayload {
                kek_label: "eu1".to_string(),
                ..Default::default()
            }),
        )))
        .await
        .unwrap();
    stream
        .send(Ok(routed_uplink(
            "u2",
            phy_payload::Value::Plain(data_uplink(0x2600_0002)),
        )))
        .await
        .unwrap();

    assert!(eventually(|| ns.uplinks.lock().unwrap().len() == 1).await);
    let stats = agent.pool_stats(Pipeline::HomeNetworkSubscribe).unwrap();
    assert!(eventually(|| stats.delivered() == 2).await);
    let received = ns.uplinks.lock().unwrap()[0].clone();
    assert!(received
        .message
        .correlation_ids
        .contains(&"pba:uplink:u2".to_string()));

    cancel.cancel();
    agent.wait().await;
}
