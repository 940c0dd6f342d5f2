//! Request-scoped metadata and tenant resolution hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;

use crate::correlation;

/// gRPC metadata key carrying the tenant of a local request.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Tenant and correlation metadata riding along with a message.
///
/// Travels by value through the ingress channels and worker pools, so it is
/// available to whichever worker ends up processing the message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub tenant_id: Option<String>,
    pub correlation_ids: Vec<String>,
}

impl MessageContext {
    /// Build a context from incoming request metadata.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let tenant_id = metadata
            .get(TENANT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Self {
            tenant_id,
            correlation_ids: correlation::correlation_ids(metadata),
        }
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("tenant `{tenant_id}`: {message}")]
pub struct TenantError {
    pub tenant_id: String,
    pub message: String,
}

/// Enriches a message context for the given tenant.
///
/// Fillers run in registration order; the first failure aborts processing of
/// the message.
#[async_trait]
pub trait TenantContextFiller: Send + Sync {
    async fn fill(&self, ctx: MessageContext, tenant_id: &str)
        -> Result<MessageContext, TenantError>;
}

/// Resolves the tenant ID of a message context.
pub type TenantExtractor = Arc<dyn Fn(&MessageContext) -> String + Send + Sync>;

/// Extractor returning the context tenant, or `default_tenant_id` when unset.
pub fn default_tenant_extractor(default_tenant_id: String) -> TenantExtractor {
    Arc::new(move |ctx: &MessageContext| {
        ctx.tenant_id
            .clone()
            .unwrap_or_else(|| default_tenant_id.clone())
    })
}

/// Filler that records the tenant on the context.
pub struct SetTenantFiller;

#[async_trait]
impl TenantContextFiller for SetTenantFiller {
    async fn fill(
        &self,
        ctx: MessageContext,
        tenant_id: &str,
    ) -> Result<MessageContext, TenantError> {
        Ok(ctx.with_tenant_id(tenant_id))
    }
}

/// Run `fillers` in order over `ctx`.
pub async fn fill_context(
    fillers: &[Arc<dyn TenantContextFiller>],
    mut ctx: MessageContext,
    tenant_id: &str,
) -> Result<MessageContext, TenantError> {
    for filler in fillers {
        ctx = filler.fill(ctx, tenant_id).await?;
    }
    Ok(ctx)
}
