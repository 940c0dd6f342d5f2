//! Forwarder pipelines: publish uplinks, subscribe to routed downlinks.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{AgentInner, Pipeline, UplinkEnvelope, PUBLISH_MESSAGE_TIMEOUT};
use crate::cluster::{ClusterRole, PeerIdentifiers};
use crate::connection::Connection;
use crate::convert;
use crate::correlation::correlated_request;
use crate::error::{MessageError, PipelineError};
use crate::pool::{MessageHandler, WorkerPool};
use crate::proto::packetbroker::forwarder_data_client::ForwarderDataClient;
use crate::proto::packetbroker::{
    PublishUplinkMessageRequest, RoutedDownlinkMessage, SubscribeForwarderRequest,
};
use crate::proto::pba::ns_gs_client::NsGsClient;
use crate::tenant::{fill_context, MessageContext};

/// Run one generation of `pb_publish_uplink`.
pub(super) async fn publish_uplink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let span = tracing::info_span!(
        "pb_publish_uplink",
        forwarder_net_id = %agent.net_id,
        forwarder_cluster_id = %agent.cluster_id,
    );
    run_publish_uplink(agent, cancel).instrument(span).await
}

async fn run_publish_uplink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let Some(role) = agent.forwarder.as_ref() else {
        return Ok(());
    };
    let conn = agent.dialer.dial(&cancel, "up").await?;
    let handler = Arc::new(PublishUplink {
        agent: agent.clone(),
        client: ForwarderDataClient::new(conn.channel()),
        conn,
    });
    let pool = WorkerPool::new(
        Pipeline::ForwarderPublish.task_id(),
        &role.worker_pool,
        handler,
        role.publish_stats.clone(),
        &cancel,
    );

    let mut upstream = role.upstream.rx.lock().await;
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
            envelope = upstream.recv() => match envelope {
                Some(envelope) => {
                    pool.dispatch(envelope).await;
                }
                None => break Err(PipelineError::IngressClosed),
            },
        }
    };
    drop(upstream);
    pool.shutdown().await;
    result
}

struct PublishUplink {
    agent: Arc<AgentInner>,
    conn: Connection,
    client: ForwarderDataClient<tonic::transport::Channel>,
}

#[async_trait]
impl MessageHandler<UplinkEnvelope> for PublishUplink {
    async fn handle(&self, envelope: UplinkEnvelope) {
        let tenant_id = (self.agent.tenant_extractor)(&envelope.ctx);
        let req = PublishUplinkMessageRequest {
            forwarder_net_id: self.agent.net_id.to_number(),
            forwarder_tenant_id: tenant_id.clone(),
            forwarder_cluster_id: self.agent.cluster_id.clone(),
            message: Some(envelope.message),
        };

        match self.publish(req, &envelope.ctx.correlation_ids).await {
            Ok(message_id) => {
                debug!(
                    forwarder_tenant_id = %tenant_id,
                    message_id = %message_id,
                    "Published uplink message"
                );
                record_publish("ok");
            }
            Err(e) => {
                warn!(forwarder_tenant_id = %tenant_id, error = %e, "Failed to publish uplink message");
                record_publish("error");
            }
        }
    }
}

impl PublishUplink {
    async fn publish(
        &self,
        req: PublishUplinkMessageRequest,
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

/// Run one generation of `pb_subscribe_downlink`.
pub(super) async fn subscribe_downlink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let span = tracing::info_span!(
        "pb_subscribe_downlink",
        forwarder_net_id = %agent.net_id,
        forwarder_cluster_id = %agent.cluster_id,
    );
    run_subscribe_downlink(agent, cancel).instrument(span).await
}

async fn run_subscribe_downlink(
    agent: Arc<AgentInner>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let Some(role) = agent.forwarder.as_ref() else {
        return Ok(());
    };
    let conn = agent.dialer.dial(&cancel, "down").await?;
    let mut client = ForwarderDataClient::new(conn.channel());

    let tenant_id = (agent.tenant_extractor)(&MessageContext::default());
    let req = conn
        .request(
            SubscribeForwarderRequest {
                forwarder_net_id: agent.net_id.to_number(),
                forwarder_tenant_id: tenant_id,
                forwarder_cluster_id: agent.cluster_id.clone(),
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
    info!(group = %agent.cluster_id, "Subscribed as Forwarder");

    let handler = Arc::new(HandleDownlink {
        agent: agent.clone(),
    });
    let pool = WorkerPool::new(
        Pipeline::ForwarderSubscribe.task_id(),
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
                        debug!(message_id = %msg.id, "Skip downlink without message");
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

struct HandleDownlink {
    agent: Arc<AgentInner>,
}

#[async_trait]
impl MessageHandler<RoutedDownlinkMessage> for HandleDownlink {
    async fn handle(&self, msg: RoutedDownlinkMessage) {
        let span = tracing::debug_span!(
            "downlink",
            message_id = %msg.id,
            home_network_net_id = format_args!("{:06X}", msg.home_network_net_id),
            home_network_tenant_id = %msg.home_network_tenant_id,
            home_network_cluster_id = %msg.home_network_cluster_id,
        );
        async {
            debug!("Received downlink message");
            if let Err(e) = self.forward(&msg).await {
                warn!(error = %e, "Failed to handle downlink message");
            }
        }
        .instrument(span)
        .await
    }
}

impl HandleDownlink {
    async fn forward(&self, msg: &RoutedDownlinkMessage) -> Result<(), MessageError> {
        let agent = &self.agent;

        let mut ctx = MessageContext::default();
        if !msg.forwarder_tenant_id.is_empty() {
            ctx = ctx.with_tenant_id(msg.forwarder_tenant_id.clone());
        }
        let tenant_id = (agent.tenant_extractor)(&ctx);
        let ctx = fill_context(&agent.tenant_fillers, ctx, &tenant_id).await?;

        let (gateway_id, down) = convert::from_broker_downlink(msg, &agent.codec)?;
        let mut correlation_ids = ctx.correlation_ids;
        correlation_ids.extend(down.correlation_ids.iter().cloned());

        let channel = agent
            .peers
            .get_peer(
                ClusterRole::GatewayServer,
                &PeerIdentifiers::Gateway(gateway_id.clone()),
            )
            .await?;

        let request = down.request.clone().unwrap_or_default();
        let mut req = correlated_request(down, &correlation_ids);
        agent.cluster_auth.authorize(&mut req);
        let res = tokio::time::timeout(
            PUBLISH_MESSAGE_TIMEOUT,
            NsGsClient::new(channel).schedule_downlink(req),
        )
        .await
        .map_err(|_| MessageError::Timeout)??;

        let delay = res
            .into_inner()
            .delay
            .and_then(|d| Duration::try_from(d).ok())
            .unwrap_or_default();
        let rx1_delay = request
            .rx1_delay
            .and_then(|d| Duration::try_from(d).ok())
            .unwrap_or_default();
        debug!(
            gateway_id = %gateway_id,
            tenant_id = %tenant_id,
            rx1 = request.rx1_frequency != 0,
            rx2 = request.rx2_frequency != 0,
            class = request.class,
            priority = request.priority,
            frequency_plan_id = %request.frequency_plan_id,
            rx1_delay = ?rx1_delay,
            rx1_data_rate_index = request.rx1_data_rate_index,
            rx1_frequency = request.rx1_frequency,
            rx2_data_rate_index = request.rx2_data_rate_index,
            rx2_frequency = request.rx2_frequency,
            delay = ?delay,
            transmit_at = ?(SystemTime::now() + delay),
            "Scheduled downlink"
        );
        Ok(())
    }
}

fn record_publish(_outcome: &str) {
    #[cfg(feature = "otel")]
    {
        use crate::utils::metrics::{self, PUBLISH_TOTAL};
        PUBLISH_TOTAL.add(
            1,
            &[
                metrics::pool_attr(Pipeline::ForwarderPublish.task_id()),
                metrics::outcome_attr(_outcome),
            ],
        );
    }
}
