//! Default-filling passes applied to [`Options`] before generation.

use anyhow::{anyhow, bail, Result};
use lokistack_core::stack::{LokiStackSizeType, ModeType};
use tracing::debug;

use crate::{Options, Sizing, TenantConfig};

/// Tenants served by the gateway in openshift-logging mode.
pub const OPENSHIFT_TENANTS: [&str; 3] = ["application", "infrastructure", "audit"];

const DEFAULT_GROUP_CLAIM: &str = "groups";
const DEFAULT_USERNAME_CLAIM: &str = "email";

/// Settings per size class; replication factor is the last column.
fn size_table(size: LokiStackSizeType) -> (Sizing, i32) {
    match size {
        LokiStackSizeType::OneXExtraSmall => (
            Sizing {
                ingester_replicas: 1,
                querier_replicas: 1,
                distributor_replicas: 1,
                ingestion_rate_mb: 2,
                ingestion_burst_size_mb: 4,
                max_global_streams_per_tenant: 5_000,
            },
            1,
        ),
        LokiStackSizeType::OneXSmall => (
            Sizing {
                ingester_replicas: 2,
                querier_replicas: 2,
                distributor_replicas: 2,
                ingestion_rate_mb: 4,
                ingestion_burst_size_mb: 6,
                max_global_streams_per_tenant: 10_000,
            },
            2,
        ),
        LokiStackSizeType::OneXMedium => (
            Sizing {
                ingester_replicas: 3,
                querier_replicas: 3,
                distributor_replicas: 2,
                ingestion_rate_mb: 4,
                ingestion_burst_size_mb: 6,
                max_global_streams_per_tenant: 10_000,
            },
            3,
        ),
    }
}

/// Fill sizing and replication defaults for the declared size.
pub fn apply_default_settings(opts: &mut Options) -> Result<()> {
    let (sizing, replication_factor) = size_table(opts.stack.size);
    let rf = *opts.stack.replication_factor.get_or_insert(replication_factor);
    if rf < 1 {
        bail!("replication factor must be at least 1, got {}", rf);
    }
    opts.sizing = sizing;
    debug!(size = opts.stack.size.as_str(), replication_factor = rf, "applied default settings");
    Ok(())
}

/// Fill gateway tenancy defaults. Tenant ids and cookie secrets already present
/// in `opts.tenants.configs` are kept; missing ones are generated.
pub fn apply_gateway_defaults(opts: &mut Options) -> Result<()> {
    let tenants = opts.stack.tenants.as_mut().ok_or_else(|| anyhow!("gateway defaults require a tenants spec"))?;
    match tenants.mode {
        ModeType::OpenshiftLogging => {
            if opts.gateway_base_domain.is_empty() {
                bail!("openshift-logging mode requires the cluster base domain");
            }
            for tenant in OPENSHIFT_TENANTS {
                let cfg = opts.tenants.configs.entry(tenant.to_string()).or_default();
                if cfg.id.is_empty() {
                    cfg.id = uuid::Uuid::new_v4().to_string();
                }
                if cfg.cookie_secret.is_none() {
                    cfg.cookie_secret = Some(uuid::Uuid::new_v4().simple().to_string());
                }
            }
        }
        ModeType::Static | ModeType::Dynamic => {
            for auth in tenants.authentication.iter_mut().flatten() {
                auth.oidc.group_claim.get_or_insert_with(|| DEFAULT_GROUP_CLAIM.to_string());
                auth.oidc.username_claim.get_or_insert_with(|| DEFAULT_USERNAME_CLAIM.to_string());
                opts.tenants
                    .configs
                    .insert(auth.tenant_name.clone(), TenantConfig { id: auth.tenant_id.clone(), cookie_secret: None });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::options;
    use lokistack_core::stack::{AuthenticationSpec, OidcSpec, TenantsSpec};

    #[test]
    fn replication_factor_defaults_per_size() {
        let mut opts = options();
        apply_default_settings(&mut opts).unwrap();
        assert_eq!(opts.stack.replication_factor, Some(2));
        assert_eq!(opts.sizing.ingester_replicas, 2);

        let mut opts = options();
        opts.stack.replication_factor = Some(0);
        assert!(apply_default_settings(&mut opts).is_err());
    }

    #[test]
    fn openshift_tenants_keep_prior_identity() {
        let mut opts = options();
        opts.stack.tenants = Some(TenantsSpec { mode: ModeType::OpenshiftLogging, ..Default::default() });
        opts.gateway_base_domain = "apps.example.com".into();
        opts.tenants.configs.insert(
            "application".into(),
            TenantConfig { id: "app-id".into(), cookie_secret: Some("cookie".into()) },
        );
        apply_gateway_defaults(&mut opts).unwrap();
        assert_eq!(opts.tenants.configs.len(), 3);
        assert_eq!(opts.tenants.configs["application"].id, "app-id");
        assert_eq!(opts.tenants.configs["application"].cookie_secret.as_deref(), Some("cookie"));
        assert!(!opts.tenants.configs["audit"].id.is_empty());
    }

    #[test]
    fn openshift_mode_needs_base_domain() {
        let mut opts = options();
        opts.stack.tenants = Some(TenantsSpec { mode: ModeType::OpenshiftLogging, ..Default::default() });
        assert!(apply_gateway_defaults(&mut opts).is_err());
    }

    #[test]
    fn static_mode_fills_oidc_claims() {
        let mut opts = options();
        opts.stack.tenants = Some(TenantsSpec {
            mode: ModeType::Static,
            authentication: Some(vec![AuthenticationSpec {
                tenant_name: "team-a".into(),
                tenant_id: "a-id".into(),
                oidc: OidcSpec { secret_name: "team-a-oidc".into(), issuer_url: "https://idp".into(), ..Default::default() },
            }]),
            authorization: None,
        });
        apply_gateway_defaults(&mut opts).unwrap();
        let auth = &opts.stack.tenants.as_ref().unwrap().authentication.as_ref().unwrap()[0];
        assert_eq!(auth.oidc.group_claim.as_deref(), Some("groups"));
        assert_eq!(opts.tenants.configs["team-a"].id, "a-id");
    }
}
