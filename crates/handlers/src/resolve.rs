//! Dependency resolution: every input of a stack is fetched fresh, in a fixed
//! order, stopping at the first fatal problem.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use lokistack_core::prelude::*;
use lokistack_core::stack::RulesSpec;
use lokistack_kubehub::{get_as, StoreClient, StoreError};
use lokistack_manifests::{build_schema_config, ObjectStorage, RulerSecret, TenantConfig, TenantSecrets, TlsConfig};
use tracing::{debug, error, info};

use crate::{gateway, rules, storage, Context, ReconcileError};

/// Inputs of one reconciliation; optional parts are present only when their
/// feature is switched on.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub request: NamespacedName,
    pub stack: LokiStack,
    pub storage: ObjectStorage,
    pub tenancy: Option<Tenancy>,
    pub rules: Option<RuleMaterials>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Tenancy {
    pub base_domain: String,
    pub secrets: Vec<TenantSecrets>,
    pub configs: BTreeMap<String, TenantConfig>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RuleMaterials {
    pub alerting: Vec<AlertingRule>,
    pub recording: Vec<RecordingRule>,
    pub ruler_spec: Option<RulerConfigSpec>,
    pub ruler_secret: Option<RulerSecret>,
}

/// `None` when the stack is gone.
pub(crate) async fn resolve(
    ctx: &Context,
    req: &NamespacedName,
    now: DateTime<Utc>,
) -> Result<Option<Resolved>, ReconcileError> {
    let store = ctx.store.as_ref();
    let stack: LokiStack = match get_as(store, Some(&req.namespace), &req.name).await {
        Ok(stack) => stack,
        Err(e) if e.is_not_found() => {
            info!(name = %req, "could not find the requested loki stack");
            return Ok(None);
        }
        Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup lokistack", req)),
    };

    let storage = resolve_storage(store, req, &stack, now).await?;
    let tenancy = if ctx.flags.enable_gateway { Some(resolve_tenancy(store, req, &stack).await?) } else { None };
    let rules = match stack.spec.rules.as_ref().filter(|r| r.enabled) {
        Some(spec) => Some(resolve_rules(store, req, spec).await?),
        None => None,
    };
    debug!(tls = storage.tls.is_some(), tenancy = tenancy.is_some(), rules = rules.is_some(), "dependencies resolved");

    Ok(Some(Resolved { request: req.clone(), stack, storage, tenancy, rules }))
}

async fn resolve_storage(
    store: &dyn StoreClient,
    req: &NamespacedName,
    stack: &LokiStack,
    now: DateTime<Utc>,
) -> Result<ObjectStorage, ReconcileError> {
    let spec = &stack.spec.storage;
    let key = NamespacedName::new(&req.namespace, &spec.secret.name);
    let secret: Secret = match get_as(store, Some(&key.namespace), &key.name).await {
        Ok(s) => s,
        Err(e) if e.is_not_found() => {
            return Err(DegradedError::new(DegradedReason::MissingObjectStorageSecret, "Missing object storage secret").into())
        }
        Err(StoreError::Decode { source, .. }) => {
            return Err(invalid_storage_secret(source).into());
        }
        Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup lokistack storage secret", &key)),
    };
    let backend = storage::extract_secret(&secret, spec.secret.kind).map_err(invalid_storage_secret)?;

    let applied = stack.status.as_ref().map(|s| s.storage.clone()).unwrap_or_default();
    let schemas = build_schema_config(now, spec, &applied).map_err(|e| {
        DegradedError::new(
            DegradedReason::InvalidObjectStorageSchema,
            format!("Invalid object storage schema contents: {}", e),
        )
    })?;

    let tls = match &spec.tls {
        Some(tls) => Some(resolve_ca(store, req, &tls.ca_name).await?),
        None => None,
    };

    Ok(ObjectStorage { secret_name: spec.secret.name.clone(), backend, schemas, tls })
}

fn invalid_storage_secret(e: impl std::fmt::Display) -> DegradedError {
    DegradedError::new(
        DegradedReason::InvalidObjectStorageSecret,
        format!("Invalid object storage secret contents: {}", e),
    )
}

async fn resolve_ca(store: &dyn StoreClient, req: &NamespacedName, ca_name: &str) -> Result<TlsConfig, ReconcileError> {
    let key = NamespacedName::new(&req.namespace, ca_name);
    let cm: ConfigMap = match get_as(store, Some(&key.namespace), &key.name).await {
        Ok(cm) => cm,
        Err(e) if e.is_not_found() => {
            return Err(DegradedError::new(
                DegradedReason::MissingObjectStorageCAConfigMap,
                "Missing object storage CA config map",
            )
            .into())
        }
        Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup lokistack object storage CA config map", &key)),
    };
    if !storage::is_valid_ca_configmap(&cm) {
        return Err(DegradedError::new(
            DegradedReason::InvalidObjectStorageCAConfigMap,
            "Invalid object storage CA configmap contents: missing key `service-ca.crt` or no contents",
        )
        .into());
    }
    Ok(TlsConfig { ca: ca_name.to_string() })
}

async fn resolve_tenancy(store: &dyn StoreClient, req: &NamespacedName, stack: &LokiStack) -> Result<Tenancy, ReconcileError> {
    let Some(tenants) = &stack.spec.tenants else {
        return Err(DegradedError::new(
            DegradedReason::InvalidTenantsConfiguration,
            "Invalid tenants configuration - TenantsSpec cannot be nil when gateway flag is enabled",
        )
        .into());
    };
    gateway::validate_modes(tenants).map_err(|e| {
        DegradedError::new(DegradedReason::InvalidTenantsConfiguration, format!("Invalid tenants configuration: {}", e))
    })?;

    let mut tenancy = Tenancy::default();
    match tenants.mode {
        ModeType::OpenshiftLogging => tenancy.base_domain = gateway::openshift_base_domain(store).await?,
        ModeType::Static | ModeType::Dynamic => {
            tenancy.secrets = gateway::tenant_secrets(store, &req.namespace, tenants).await?
        }
    }

    // Prior tenant ids and cookie secrets; fresh ones are generated when this fails.
    match gateway::tenant_configmap_data(store, req).await {
        Ok(configs) => tenancy.configs = configs,
        Err(e) => error!(error = %format!("{:#}", e), "error in getting tenant config map data"),
    }
    Ok(tenancy)
}

async fn resolve_rules(store: &dyn StoreClient, req: &NamespacedName, spec: &RulesSpec) -> Result<RuleMaterials, ReconcileError> {
    let mut materials = RuleMaterials::default();
    match rules::list(store, &req.namespace, spec).await {
        Ok((alerting, recording)) => {
            materials.alerting = alerting;
            materials.recording = recording;
        }
        Err(e) => error!(error = %format!("{:#}", e), "failed to lookup rules"),
    }
    match rules::get_ruler_config(store, req).await {
        Ok(cfg) => materials.ruler_spec = cfg,
        Err(e) => error!(error = %format!("{:#}", e), key = %req, "failed to lookup ruler config"),
    }

    let client = materials
        .ruler_spec
        .as_ref()
        .and_then(|s| s.remote_write.as_ref())
        .and_then(|rw| rw.client.as_ref());
    if let Some(client) = client {
        materials.ruler_secret = Some(rules::ruler_secret(store, &req.namespace, client).await?);
    }
    Ok(materials)
}
