//! Gateway dependencies: tenancy mode checks, tenant OIDC secrets, the cluster
//! base domain and tenant identities from the previous run.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use lokistack_core::openshift::{CLUSTER_DNS_NAME, DNS};
use lokistack_core::prelude::*;
use lokistack_core::stack::TenantsSpec;
use lokistack_kubehub::{get_as, StoreClient, StoreError};
use lokistack_manifests::gateway::{gateway_name, parse_tenants_yaml, TENANTS_FILE};
use lokistack_manifests::{TenantConfig, TenantSecrets};

use crate::storage::{optional, required, secret_data};
use crate::ReconcileError;

/// A tenants spec that does not fit its mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{problem} for mode {}", .mode.as_str())]
pub struct ModeError {
    pub mode: ModeType,
    pub problem: &'static str,
}

/// Check that authentication and authorization are declared as `spec.mode` expects.
pub fn validate_modes(spec: &TenantsSpec) -> Result<(), ModeError> {
    let fail = |problem: &'static str| -> Result<(), ModeError> { Err(ModeError { mode: spec.mode, problem }) };
    let authz = spec.authorization.as_ref();
    match spec.mode {
        ModeType::Static => {
            if spec.authentication.is_none() {
                return fail("mandatory authentication configuration not provided");
            }
            let Some(authz) = authz else {
                return fail("mandatory authorization configuration not provided");
            };
            if authz.opa.is_some() {
                return fail("OPA authorization configuration must not be provided");
            }
            if authz.roles.is_none() {
                return fail("mandatory roles configuration not provided");
            }
            if authz.role_bindings.is_none() {
                return fail("mandatory role bindings configuration not provided");
            }
        }
        ModeType::Dynamic => {
            if spec.authentication.is_none() {
                return fail("mandatory authentication configuration not provided");
            }
            let Some(authz) = authz else {
                return fail("mandatory authorization configuration not provided");
            };
            if authz.opa.is_none() {
                return fail("mandatory OPA authorization configuration not provided");
            }
            if authz.roles.is_some() {
                return fail("static roles configuration must not be provided");
            }
            if authz.role_bindings.is_some() {
                return fail("static role bindings configuration must not be provided");
            }
        }
        ModeType::OpenshiftLogging => {
            if spec.authentication.is_some() {
                return fail("authentication configuration must not be provided");
            }
            if authz.is_some() {
                return fail("authorization configuration must not be provided");
            }
        }
    }
    Ok(())
}

/// OIDC client credentials of every tenant, read from their secrets.
pub async fn tenant_secrets(
    store: &dyn StoreClient,
    namespace: &str,
    spec: &TenantsSpec,
) -> Result<Vec<TenantSecrets>, ReconcileError> {
    let mut out = Vec::new();
    for auth in spec.authentication.iter().flatten() {
        let key = NamespacedName::new(namespace, &auth.oidc.secret_name);
        let secret: Secret = match get_as(store, Some(namespace), &key.name).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                return Err(DegradedError::new(
                    DegradedReason::MissingGatewayTenantSecret,
                    format!("Missing secrets for tenant {}", auth.tenant_name),
                )
                .into())
            }
            Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup lokistack gateway tenant secret", &key)),
        };
        let data = secret_data(&secret);
        let invalid = |e: crate::storage::SecretError| {
            DegradedError::new(
                DegradedReason::InvalidGatewayTenantSecret,
                format!("Invalid gateway tenant secret contents of {}: {}", auth.tenant_name, e),
            )
        };
        out.push(TenantSecrets {
            tenant_name: auth.tenant_name.clone(),
            client_id: required(&data, "clientID").map_err(invalid)?,
            client_secret: optional(&data, "clientSecret").map_err(invalid)?,
            issuer_ca_path: optional(&data, "issuerCAPath").map_err(invalid)?,
        });
    }
    Ok(out)
}

/// Base domain of the cluster ingress, needed for openshift-logging mode.
pub async fn openshift_base_domain(store: &dyn StoreClient) -> Result<String, ReconcileError> {
    let missing = || {
        DegradedError::new(
            DegradedReason::MissingGatewayOpenShiftBaseDomain,
            "Missing cluster DNS configuration to read base domain",
        )
    };
    let dns: DNS = match get_as(store, None, CLUSTER_DNS_NAME).await {
        Ok(dns) => dns,
        Err(e) if e.is_not_found() => return Err(missing().into()),
        Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup openshift dns config", CLUSTER_DNS_NAME)),
    };
    if dns.spec.base_domain.is_empty() {
        return Err(missing().into());
    }
    Ok(dns.spec.base_domain)
}

/// Tenant ids and cookie secrets rendered by the previous run; empty on the first one.
pub async fn tenant_configmap_data(
    store: &dyn StoreClient,
    req: &NamespacedName,
) -> Result<BTreeMap<String, TenantConfig>> {
    let name = gateway_name(&req.name);
    let cm: ConfigMap = match get_as(store, Some(&req.namespace), &name).await {
        Ok(cm) => cm,
        Err(StoreError::NotFound(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to lookup gateway config map {}/{}", req.namespace, name)),
    };
    match cm.data.as_ref().and_then(|d| d.get(TENANTS_FILE)) {
        Some(raw) => parse_tenants_yaml(raw),
        None => Ok(BTreeMap::new()),
    }
}
