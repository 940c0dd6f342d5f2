//! Forwarder role: uplink publishing and downlink scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Code;

use pb_agent::proto::packetbroker::{DownlinkMessage, DownlinkRxWindow, RoutedDownlinkMessage};
use pb_agent::proto::pba::gs_pba_client::GsPbaClient;
use pb_agent::proto::pba::gs_pba_server::GsPba;
use pb_agent::Pipeline;

use crate::common::*;

#[tokio::test]
async fn test_uplink_published_with_forwarder_identity() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let agent = agent_builder(agent_config(true, false), broker_addr, None, None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let addr = serve_agent(&agent).await;
    let mut client = GsPbaClient::connect(format!("http://{}", addr)).await.unwrap();
    client
        .publish_uplink(with_cluster_key(gs_uplink("gw-1", b"gs-token")))
        .await
        .unwrap();

    assert!(eventually(|| broker.uplink_count() == 1).await);
    let req = broker.uplinks.lock().unwrap()[0].clone();
    assert_eq!(req.forwarder_net_id, 0x13);
    assert_eq!(req.forwarder_tenant_id, "ttn");
    assert_eq!(req.forwarder_cluster_id, "eu1");
    let msg = req.message.unwrap();
    assert_eq!(msg.frequency, 868_100_000);
    assert_eq!(msg.gateway_metadata[0].gateway_id, "gw-1");
    assert!(!msg.forwarder_uplink_token.is_empty());

    cancel.cancel();
    agent.wait().await;
}

#[tokio::test]
async fn test_uplink_requires_cluster_key() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let agent = agent_builder(agent_config(true, false), broker_addr, None, None)
        .build()
        .unwrap();

    let addr = serve_agent(&agent).await;
    let mut client = GsPbaClient::connect(format!("http://{}", addr)).await.unwrap();
    let err = client
        .publish_uplink(gs_uplink("gw-1", b"gs-token"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

/// Two workers stay busy on a slow broker; the third uplink waits the busy
/// timeout and is dropped with a warning.
#[tokio::test]
async fn test_saturated_pool_drops_third_uplink() {
    let (logs, _guard) = capture_logs();
    let broker = Arc::new(MockBroker::with_publish_delay(Duration::from_millis(500)));
    let broker_addr = broker.serve().await;
    let mut config = agent_config(true, false);
    config.forwarder.worker_pool = worker_pool(2);
    let agent = agent_builder(config, broker_addr, None, None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let service = agent.gs_pba_service();
    for i in 0..3 {
        service
            .publish_uplink(tonic::Request::new(gs_uplink(&format!("gw-{}", i), b"t")))
            .await
            .unwrap();
    }

    let stats = agent.pool_stats(Pipeline::ForwarderPublish).unwrap();
    assert!(eventually(|| stats.dropped() == 1).await);
    assert!(logs.contains("WARN"));
    assert!(logs.contains("Worker pool busy, drop message"));
    assert!(logs.contains("pb_publish_uplink"));
    assert!(eventually(|| broker.uplink_count() == 2).await);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(broker.uplink_count(), 2);
    assert_eq!(stats.delivered(), 2);
    assert!(stats.spawned() <= 2);

    cancel.cancel();
    agent.wait().await;
}

#[tokio::test]
async fn test_routed_downlink_scheduled_on_gateway() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let gs = Arc::new(MockGatewayServer::default());
    let gs_addr = gs.serve().await;
    let agent = agent_builder(agent_config(true, false), broker_addr, Some(gs_addr), None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    agent
        .gs_pba_service()
        .publish_uplink(tonic::Request::new(gs_uplink("gw-1", b"gs-token")))
        .await
        .unwrap();
    assert!(eventually(|| broker.uplink_count() == 1).await);
    let forwarder_uplink_token = broker.uplinks.lock().unwrap()[0]
        .message
        .as_ref()
        .unwrap()
        .forwarder_uplink_token
        .clone();

    let stream = broker.forwarder_subscribed(1).await;
    let sub = broker.forwarder_subscriptions.lock().unwrap()[0].clone();
    assert_eq!(sub.forwarder_net_id, 0x13);
    assert_eq!(sub.group, "eu1");

    stream
        .send(Ok(RoutedDownlinkMessage {
            id: "d1".to_string(),
            forwarder_net_id: 0x13,
            forwarder_tenant_id: "ttn".to_string(),
            forwarder_cluster_id: "eu1".to_string(),
            home_network_net_id: 0x42,
            message: Some(DownlinkMessage {
                phy_payload: vec![0x60, 1, 2, 3],
                priority: 3,
                rx1: Some(DownlinkRxWindow {
                    data_rate_index: 5,
                    frequency: 868_100_000,
                }),
                forwarder_uplink_token,
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(eventually(|| gs.downlinks.lock().unwrap().len() == 1).await);
    let received = gs.downlinks.lock().unwrap()[0].clone();
    assert_eq!(received.cluster_key.as_deref(), Some(CLUSTER_KEY));
    assert_eq!(received.message.uplink_token, b"gs-token".to_vec());
    assert_eq!(received.message.raw_payload, vec![0x60, 1, 2, 3]);
    let request = received.message.request.unwrap();
    assert_eq!(request.rx1_frequency, 868_100_000);
    assert_eq!(request.priority, 3);

    cancel.cancel();
    agent.wait().await;
}

#[tokio::test]
async fn test_downlink_with_foreign_token_is_dropped() {
    let broker = Arc::new(MockBroker::default());
    let broker_addr = broker.serve().await;
    let gs = Arc::new(MockGatewayServer::default());
    let gs_addr = gs.serve().await;
    let agent = agent_builder(agent_config(true, false), broker_addr, Some(gs_addr), None)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    agent.start(&cancel);

    let stream = broker.forwarder_subscribed(1).await;
    let downlink = |token: Vec<u8>, id: &str| RoutedDownlinkMessage {
        id: id.to_string(),
        message: Some(DownlinkMessage {
            phy_payload: vec![0x60],
            rx1: Some(DownlinkRxWindow {
                data_rate_index: 0,
                frequency: 869_525_000,
            }),
            forwarder_uplink_token: token,
            ..Default::default()
        }),
        ..Default::default()
    };
    stream
        .send(Ok(downlink(b"not a token".to_vec(), "d1")))
        .await
        .unwrap();
    stream
        .send(Ok(RoutedDownlinkMessage {
            id: "empty".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();

    let stats = agent.pool_stats(Pipeline::ForwarderSubscribe).unwrap();
    assert!(eventually(|| stats.delivered() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(gs.downlinks.lock().unwrap().is_empty());
    assert_eq!(broker.forwarder_subscriptions.lock().unwrap().len(), 1);

    cancel.cancel();
    agent.wait().await;
}
