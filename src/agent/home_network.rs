//! Home Network pipelines: subscribe to routed uplinks, publish downlinks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::filters::{format_filters, subscription_filters};
use super::{AgentInner, DownlinkEnvelope, Pipeline, PUBLISH_MESSAGE_TIMEOUT};
use crate::cluster::{ClusterRole, PeerIdentifiers};
use crate::connection::Connection;
use crate::convert;
use crate::correlation::correlated_request;
use crate::error::{MessageError, PipelineError};
use crate::lorawan;
use crate::pool::{MessageHandler, WorkerPool};
use crate::proto::packetbroker::home_network_data_client::HomeNetworkDataClient;
use crate::proto::packetbroker::{
    phy_payload, PublishDownlinkMessageRequest, RoutedUplinkMessage, SubscribeHomeNetworkRequest,
};
use crate::proto::pba::gs_ns_client::GsNsClient;
use crate::tenant::{fill_context, MessageContext};

/// Run one generation of `pb_subscribe_uplink`.
pub(super) async fn subscribe_uplink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let span = tracing::info_span!(
        "pb_subscribe_uplink",
        home_network_net_id = %agent.net_id,
        home_network_cluster_id = %agent.home_network_cluster_id,
    );
    run_subscribe_uplink(agent, cancel).instrument(span).await
}

async fn run_subscribe_uplink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let Some(role) = agent.home_network.as_ref() else {
        return Ok(());
    };
    let conn = agent.dialer.dial(&cancel, "up").await?;
    let mut client = HomeNetworkDataClient::new(conn.channel());

    let filters = subscription_filters(&role.dev_addr_prefixes);
    debug!(filters = ?format_filters(&filters), "Subscription filters");
    let tenant_id = (agent.tenant_extractor)(&MessageContext::default());
    let req = conn
        .request(
            SubscribeHomeNetworkRequest {
                home_network_net_id: agent.net_id.to_number(),
                home_network_tenant_id: tenant_id,
                home_network_cluster_id: agent.home_network_cluster_id.clone(),
                filters,
                group: agent.cluster_id.clone(),
            },
            &[],
        )
        .await?;
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        res = client.subscribe(req) => res?.into_inner(),
    };
    info!(group = %agent.cluster_id, "Subscribed as Home Network");

    let handler = Arc::new(HandleUplink {
        agent: agent.clone(),
    });
    let pool = WorkerPool::new(
        Pipeline::HomeNetworkSubscribe.task_id(),
        &role.worker_pool,
        handler,
        role.subscribe_stats.clone(),
        &cancel,
    );

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
            msg = stream.message() => match msg {
                Ok(Some(msg)) => {
                    if msg.message.is_none() {
                        debug!(message_id = %msg.id, "Skip uplink without message");
                        continue;
                    }
                    pool.dispatch(msg).await;
                }
                Ok(None) => break Err(PipelineError::StreamClosed),
                Err(status) => break Err(PipelineError::Stream(status)),
            },
        }
    };
    pool.shutdown().await;
    result
}

struct HandleUplink {
    agent: Arc<AgentInner>,
}

#[async_trait]
impl MessageHandler<RoutedUplinkMessage> for HandleUplink {
    async fn handle(&self, msg: RoutedUplinkMessage) {
        let span = tracing::debug_span!(
            "uplink",
            message_id = %msg.id,
            forwarder_net_id = format_args!("{:06X}", msg.forwarder_net_id),
            forwarder_tenant_id = %msg.forwarder_tenant_id,
            forwarder_cluster_id = %msg.forwarder_cluster_id,
        );
        async {
            debug!("Received uplink message");
            if let Err(e) = self.forward(msg).await {
                warn!(error = %e, "Failed to handle uplink message");
            }
        }
        .instrument(span)
        .await
    }
}

impl HandleUplink {
    async fn forward(&self, mut msg: RoutedUplinkMessage) -> Result<(), MessageError> {
        let agent = &self.agent;

        let up = msg.message.as_mut().ok_or(MessageError::NoPayload)?;
        agent.encrypter.decrypt_uplink(up).await?;
        let ids = match up.phy_payload.as_ref().and_then(|p| p.value.as_ref()) {
            Some(phy_payload::Value::Plain(plain)) => lorawan::uplink_identifiers(plain)?,
            _ => return Err(MessageError::NoPayload),
        };

        let mut ctx = MessageContext::default();
        if !msg.home_network_tenant_id.is_empty() {
            ctx = ctx.with_tenant_id(msg.home_network_tenant_id.clone());
        }
        let tenant_id = (agent.tenant_extractor)(&ctx);
        let ctx = fill_context(&agent.tenant_fillers, ctx, &tenant_id).await?;

        let up = convert::from_broker_uplink(&msg, &agent.codec)?;
        let mut correlation_ids = ctx.correlation_ids;
        correlation_ids.extend(up.correlation_ids.iter().cloned());

        let channel = agent
            .peers
            .get_peer(ClusterRole::NetworkServer, &PeerIdentifiers::Device(ids))
            .await?;
        let mut req = correlated_request(up, &correlation_ids);
        agent.cluster_auth.authorize(&mut req);
        tokio::time::timeout(
            PUBLISH_MESSAGE_TIMEOUT,
            GsNsClient::new(channel).handle_uplink(req),
        )
        .await
        .map_err(|_| MessageError::Timeout)??;

        debug!(
            tenant_id = %tenant_id,
            dev_addr = ?ids.dev_addr.map(|a| a.to_string()),
            dev_eui = ?ids.dev_eui.map(|e| e.to_string()),
            join_eui = ?ids.join_eui.map(|e| e.to_string()),
            "Forwarded uplink to Network Server"
        );
        Ok(())
    }
}

/// Run one generation of `pb_publish_downlink`.
pub(super) async fn publish_downlink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let span = tracing::info_span!(
        "pb_publish_downlink",
        home_network_net_id = %agent.net_id,
        home_network_cluster_id = %agent.home_network_cluster_id,
    );
    run_publish_downlink(agent, cancel).instrument(span).await
}

async fn run_publish_downlink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let Some(role) = agent.home_network.as_ref() else {
        return Ok(());
    };
    let conn = agent.dialer.dial(&cancel, "down").await?;
    let handler = Arc::new(PublishDownlink {
        agent: agent.clone(),
        client: HomeNetworkDataClient::new(conn.channel()),
        conn,
    });
    let pool = WorkerPool::new(
        Pipeline::HomeNetworkPublish.task_id(),
        &role.worker_pool,
        handler,
        role.publish_stats.clone(),
        &cancel,
    );

    let mut downstream = role.downstream.rx.lock().await;
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
            envelope = downstream.recv() => match envelope {
                Some(envelope) => {
                    pool.dispatch(envelope).await;
                }
                None => break Err(PipelineError::IngressClosed),
            },
        }
    };
    drop(downstream);
    pool.shutdown().await;
    result
}

struct PublishDownlink {
    agent: Arc<AgentInner>,
    conn: Connection,
    client: HomeNetworkDataClient<tonic::transport::Channel>,
}

#[async_trait]
impl MessageHandler<DownlinkEnvelope> for PublishDownlink {
    async fn handle(&self, envelope: DownlinkEnvelope) {
        let tenant_id = (self.agent.tenant_extractor)(&envelope.ctx);
        let token = envelope.token;
        let forwarder_net_id = token.forwarder_net_id;
        let req = PublishDownlinkMessageRequest {
            home_network_net_id: self.agent.net_id.to_number(),
            home_network_tenant_id: tenant_id.clone(),
            home_network_cluster_id: self.agent.home_network_cluster_id.clone(),
            forwarder_net_id: forwarder_net_id.to_number(),
            forwarder_tenant_id: token.forwarder_tenant_id,
            forwarder_cluster_id: token.forwarder_cluster_id,
            message: Some(envelope.message),
        };
        let forwarder_tenant_id = req.forwarder_tenant_id.clone();
        let forwarder_cluster_id = req.forwarder_cluster_id.clone();

        match self.publish(req, &envelope.ctx.correlation_ids).await {
            Ok(message_id) => {
                debug!(
                    home_network_tenant_id = %tenant_id,
                    forwarder_net_id = %forwarder_net_id,
                    forwarder_tenant_id = %forwarder_tenant_id,
                    forwarder_cluster_id = %forwarder_cluster_id,
                    message_id = %message_id,
                    "Published downlink message"
                );
                record_publish("ok");
            }
            Err(e) => {
                warn!(
                    home_network_tenant_id = %tenant_id,
                    forwarder_net_id = %forwarder_net_id,
                    error = %e,
                    "Failed to publish downlink message"
                );
                record_publish("error");
            }
        }
    }
}

impl PublishDownlink {
    async fn publish(
        &self,
        req: PublishDownlinkMessageRequest,
        correlation_ids: &[String],
    ) -> Result<String, MessageError> {
        let req = self.conn.request(req, correlation_ids).await?;
        let mut client = self.client.clone();
        let res = tokio::time::timeout(PUBLISH_MESSAGE_TIMEOUT, client.publish(req))
            .await
            .map_err(|_| MessageError::Timeout)??;
        Ok(res.into_inner().id)
    }
}

fn record_publish(_outcome: &str) {
    #[cfg(feature = "otel")]
    {
        use crate::utils::metrics::{self, PUBLISH_TOTAL};
        PUBLISH_TOTAL.add(
            1,
            &[
                metrics::pool_attr(Pipeline::HomeNetworkPublish.task_id()),
                metrics::outcome_attr(_outcome),
            ],
        );
    }
}
