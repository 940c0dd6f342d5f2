//! Inbound gRPC services for local Gateway Servers and Network Servers.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use super::{AgentInner, DownlinkEnvelope, UplinkEnvelope};
use crate::convert;
use crate::proto::pba::gs_pba_server::GsPba;
use crate::proto::pba::ns_pba_server::NsPba;
use crate::proto::pba::{DownlinkMessage, UplinkMessage};
use crate::tenant::MessageContext;

fn enqueue_status<T>(e: TrySendError<T>) -> Status {
    match e {
        TrySendError::Full(_) => Status::resource_exhausted("capacity exceeded"),
        TrySendError::Closed(_) => Status::unavailable("agent is shutting down"),
    }
}

/// Accepts uplinks from Gateway Servers for the Forwarder role.
#[derive(Clone)]
pub struct GsPbaService {
    agent: Arc<AgentInner>,
}

impl GsPbaService {
    pub(crate) fn new(agent: Arc<AgentInner>) -> Self {
        Self { agent }
    }
}

#[tonic::async_trait]
impl GsPba for GsPbaService {
    async fn publish_uplink(
        &self,
        request: Request<UplinkMessage>,
    ) -> Result<Response<()>, Status> {
        let Some(role) = self.agent.forwarder.as_ref() else {
            return Err(Status::failed_precondition("Forwarder role is disabled"));
        };
        let ctx = MessageContext::from_metadata(request.metadata());
        let msg = request.into_inner();

        let mut message = convert::to_broker_uplink(&msg, &self.agent.codec)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        self.agent
            .encrypter
            .encrypt_uplink(&mut message)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        role.upstream
            .tx
            .try_send(UplinkEnvelope { ctx, message })
            .map_err(|e| {
                warn!("Uplink channel full, reject message");
                enqueue_status(e)
            })?;
        debug!("Enqueued uplink message");
        Ok(Response::new(()))
    }
}

/// Accepts downlinks from Network Servers for the Home Network role.
#[derive(Clone)]
pub struct NsPbaService {
    agent: Arc<AgentInner>,
}

impl NsPbaService {
    pub(crate) fn new(agent: Arc<AgentInner>) -> Self {
        Self { agent }
    }
}

#[tonic::async_trait]
impl NsPba for NsPbaService {
    async fn publish_downlink(
        &self,
        request: Request<DownlinkMessage>,
    ) -> Result<Response<()>, Status> {
        let Some(role) = self.agent.home_network.as_ref() else {
            return Err(Status::failed_precondition("Home Network role is disabled"));
        };
        let ctx = MessageContext::from_metadata(request.metadata());
        let msg = request.into_inner();

        let token = self
            .agent
            .codec
            .decrypt(&msg.agent_uplink_token)
            .map_err(|e| {
                warn!(error = %e, "Failed to decrypt agent uplink token");
                Status::invalid_argument("invalid agent uplink token")
            })?;
        let message = convert::to_broker_downlink(&msg)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let forwarder_net_id = token.forwarder_net_id;
        role.downstream
            .tx
            .try_send(DownlinkEnvelope {
                ctx,
                token,
                message,
            })
            .map_err(|e| {
                warn!(forwarder_net_id = %forwarder_net_id, "Downlink channel full, reject message");
                enqueue_status(e)
            })?;
        debug!(forwarder_net_id = %forwarder_net_id, "Enqueued downlink message");
        Ok(Response::new(()))
    }
}
