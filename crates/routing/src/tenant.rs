use serde::Serialize;
use tracing::{debug, warn};
use zaproute_core::store::CrmStore;

/// Tenant (and connection, on the newer schema) owning a gateway instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResolution {
    pub tenant_id: Option<String>,
    pub connection_id: Option<String>,
}

impl TenantResolution {
    pub fn is_resolved(&self) -> bool {
        self.tenant_id.is_some()
    }
}

/// Map a gateway instance name to its tenant: connection table first, then
/// the legacy instance-token table. Unknown instances and lookup failures
/// resolve to nothing; callers log and carry on.
pub async fn resolve_tenant(store: &dyn CrmStore, instance: Option<&str>) -> TenantResolution {
    let Some(instance) = instance.map(str::trim).filter(|i| !i.is_empty()) else {
        warn!("Webhook event carries no instance name");
        return TenantResolution::default();
    };

    match store.find_connection_by_instance(instance).await {
        Ok(Some(connection)) => {
            debug!(instance, tenant_id = %connection.tenant_id, "Instance resolved via connection");
            return TenantResolution {
                tenant_id: Some(connection.tenant_id),
                connection_id: Some(connection.id),
            };
        }
        Ok(None) => {}
        Err(e) => warn!(instance, error = %e, "Connection lookup failed"),
    }

    match store.find_legacy_instance_tenant(instance).await {
        Ok(Some(tenant_id)) => {
            debug!(instance, tenant_id = %tenant_id, "Instance resolved via legacy token table");
            TenantResolution {
                tenant_id: Some(tenant_id),
                connection_id: None,
            }
        }
        Ok(None) => {
            warn!(instance, "No tenant owns this instance");
            TenantResolution::default()
        }
        Err(e) => {
            warn!(instance, error = %e, "Legacy instance lookup failed");
            TenantResolution::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::seeded_store;

    #[tokio::test]
    async fn connection_table_wins_over_legacy() {
        let (store, conn) = seeded_store().await;
        store
            .insert_legacy_instance("shop-01", "t2", None)
            .await
            .expect("legacy");

        let resolved = resolve_tenant(&store, Some("shop-01")).await;
        assert_eq!(resolved.tenant_id.as_deref(), Some("t1"));
        assert_eq!(resolved.connection_id.as_deref(), Some(conn.id.as_str()));
    }

    #[tokio::test]
    async fn legacy_table_has_no_connection() {
        let (store, _) = seeded_store().await;
        store
            .insert_legacy_instance("old-line", "t1", Some("tok"))
            .await
            .expect("legacy");

        let resolved = resolve_tenant(&store, Some("old-line")).await;
        assert_eq!(resolved.tenant_id.as_deref(), Some("t1"));
        assert_eq!(resolved.connection_id, None);
        assert!(resolved.is_resolved());
    }

    #[tokio::test]
    async fn unknown_or_missing_instance_is_unresolved() {
        let (store, _) = seeded_store().await;
        assert_eq!(resolve_tenant(&store, Some("ghost")).await, TenantResolution::default());
        assert!(!resolve_tenant(&store, Some("  ")).await.is_resolved());
        assert!(!resolve_tenant(&store, None).await.is_resolved());
    }
}
