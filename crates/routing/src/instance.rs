use async_trait::async_trait;
use tracing::{debug, info, warn};
use zaproute_core::error::RouteError;
use zaproute_core::store::CrmStore;
use zaproute_core::types::Conversation;

/// What the tiers may look at when choosing a gateway instance for a reply.
#[derive(Debug, Clone, Copy)]
pub struct InstanceQuery<'a> {
    pub conversation: &'a Conversation,
    pub sender_id: Option<&'a str>,
    /// Instance named in the send request itself.
    pub requested: Option<&'a str>,
}

/// One source of a gateway instance for an outbound reply.
#[async_trait]
pub trait InstanceTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(
        &self,
        store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>>;
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Instance the contact last wrote in on.
pub struct LastContactMessageTier;

#[async_trait]
impl InstanceTier for LastContactMessageTier {
    fn name(&self) -> &'static str {
        "last_contact_message"
    }

    async fn lookup(
        &self,
        store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>> {
        let instance = store
            .last_contact_message_instance(&query.conversation.id)
            .await?;
        Ok(non_empty(instance.as_deref()))
    }
}

pub struct ConversationTier;

#[async_trait]
impl InstanceTier for ConversationTier {
    fn name(&self) -> &'static str {
        "conversation"
    }

    async fn lookup(
        &self,
        _store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>> {
        Ok(non_empty(query.conversation.evolution_instance.as_deref()))
    }
}

/// Per-user instance assignment. No assignment table exists yet, so this
/// tier never yields a value.
pub struct UserDefaultTier;

#[async_trait]
impl InstanceTier for UserDefaultTier {
    fn name(&self) -> &'static str {
        "user_default"
    }

    async fn lookup(
        &self,
        _store: &dyn CrmStore,
        _query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

pub struct TenantDefaultTier;

#[async_trait]
impl InstanceTier for TenantDefaultTier {
    fn name(&self) -> &'static str {
        "tenant_default"
    }

    async fn lookup(
        &self,
        store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>> {
        let tenant = store.get_tenant(&query.conversation.tenant_id).await?;
        Ok(tenant.and_then(|t| non_empty(t.default_instance.as_deref())))
    }
}

/// Legacy callers name the instance in the request body.
pub struct RequestTier;

#[async_trait]
impl InstanceTier for RequestTier {
    fn name(&self) -> &'static str {
        "request"
    }

    async fn lookup(
        &self,
        _store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> anyhow::Result<Option<String>> {
        Ok(non_empty(query.requested))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInstance {
    pub instance: String,
    pub tier: &'static str,
}

/// Ordered tier list; the first tier with a value wins.
pub struct InstanceResolver {
    tiers: Vec<Box<dyn InstanceTier>>,
}

impl Default for InstanceResolver {
    fn default() -> Self {
        Self::new(vec![
            Box::new(LastContactMessageTier),
            Box::new(ConversationTier),
            Box::new(UserDefaultTier),
            Box::new(TenantDefaultTier),
            Box::new(RequestTier),
        ])
    }
}

impl InstanceResolver {
    pub fn new(tiers: Vec<Box<dyn InstanceTier>>) -> Self {
        Self { tiers }
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Walk the tiers without side effects.
    pub async fn first_match(
        &self,
        store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> Result<Option<ResolvedInstance>, RouteError> {
        for tier in &self.tiers {
            let found = tier
                .lookup(store, query)
                .await
                .map_err(RouteError::database)?;
            if let Some(instance) = found {
                debug!(tier = tier.name(), instance = %instance, "Instance tier matched");
                return Ok(Some(ResolvedInstance {
                    instance,
                    tier: tier.name(),
                }));
            }
        }
        Ok(None)
    }

    /// Resolve the instance for a reply and store it on the conversation when
    /// it differs from the cached one. No match is a hard error.
    pub async fn resolve(
        &self,
        store: &dyn CrmStore,
        query: &InstanceQuery<'_>,
    ) -> Result<ResolvedInstance, RouteError> {
        let conversation = query.conversation;
        let Some(resolved) = self.first_match(store, query).await? else {
            warn!(conversation_id = %conversation.id, "No gateway instance could be resolved");
            return Err(RouteError::InstanceNotResolved {
                conversation_id: conversation.id.clone(),
            });
        };

        if conversation.evolution_instance.as_deref() != Some(resolved.instance.as_str()) {
            store
                .set_conversation_instance(&conversation.id, &resolved.instance)
                .await
                .map_err(RouteError::database)?;
            info!(
                conversation_id = %conversation.id,
                previous = ?conversation.evolution_instance,
                instance = %resolved.instance,
                tier = resolved.tier,
                "Conversation instance updated"
            );
        }

        Ok(resolved)
    }
}
