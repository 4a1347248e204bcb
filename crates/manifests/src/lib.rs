//! LokiStack manifests: the resolved configuration of a stack and the generator
//! turning it into the ordered list of objects to apply.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use kube::core::DynamicObject;
use lokistack_core::prelude::*;
use serde::{Deserialize, Serialize};

mod components;
pub mod config;
pub mod defaults;
pub mod gateway;
pub mod rules;
pub mod storage;

pub use storage::{build_schema_config, ObjectStorage, StorageBackend, TlsConfig};

pub const ENV_RELATED_IMAGE_LOKI: &str = "RELATED_IMAGE_LOKI";
pub const ENV_RELATED_IMAGE_GATEWAY: &str = "RELATED_IMAGE_GATEWAY";
pub const DEFAULT_CONTAINER_IMAGE: &str = "docker.io/grafana/loki:2.4.2";
pub const DEFAULT_GATEWAY_IMAGE: &str = "quay.io/observatorium/api:latest";

/// Container images used by generated objects; read once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Images {
    pub loki: String,
    pub gateway: String,
}

impl Default for Images {
    fn default() -> Self {
        Self { loki: DEFAULT_CONTAINER_IMAGE.to_string(), gateway: DEFAULT_GATEWAY_IMAGE.to_string() }
    }
}

impl Images {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Resolve overrides through `lookup`; unset or empty values fall back to the built-in images.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let pick = |key: &str, default: &str| lookup(key).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string());
        Self {
            loki: pick(ENV_RELATED_IMAGE_LOKI, DEFAULT_CONTAINER_IMAGE),
            gateway: pick(ENV_RELATED_IMAGE_GATEWAY, DEFAULT_GATEWAY_IMAGE),
        }
    }
}

/// Remote-write credentials of the ruler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulerSecret {
    Basic { username: String, password: String },
    Header { bearer_token: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ruler {
    pub spec: Option<RulerConfigSpec>,
    pub secret: Option<RulerSecret>,
}

/// OIDC client credentials of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSecrets {
    pub tenant_name: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub issuer_ca_path: Option<String>,
}

/// Tenant identity carried over between reconciliations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    pub cookie_secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tenants {
    pub secrets: Vec<TenantSecrets>,
    /// Keyed by tenant name.
    pub configs: BTreeMap<String, TenantConfig>,
}

/// Per-size settings filled in by [`defaults::apply_default_settings`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub ingester_replicas: i32,
    pub querier_replicas: i32,
    pub distributor_replicas: i32,
    pub ingestion_rate_mb: i32,
    pub ingestion_burst_size_mb: i32,
    pub max_global_streams_per_tenant: i32,
}

/// Everything the generator needs to render a stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub gateway_image: String,
    pub gateway_base_domain: String,
    pub stack: LokiStackSpec,
    pub flags: FeatureFlags,
    pub object_storage: ObjectStorage,
    pub alerting_rules: Vec<AlertingRule>,
    pub recording_rules: Vec<RecordingRule>,
    pub ruler: Ruler,
    pub tenants: Tenants,
    pub sizing: Sizing,
}

impl Options {
    pub fn rules_enabled(&self) -> bool {
        self.stack.rules.as_ref().map(|r| r.enabled).unwrap_or(false)
    }
}

/// Default-filling passes plus the desired-state generator.
///
/// `build_all` must be deterministic: the same options always yield the same
/// objects in the same order.
pub trait ManifestBuilder: Send + Sync {
    fn apply_default_settings(&self, opts: &mut Options) -> Result<()>;
    fn apply_gateway_defaults(&self, opts: &mut Options) -> Result<()>;
    fn build_all(&self, opts: &Options) -> Result<Vec<DynamicObject>>;
}

/// Built-in generator: config, services, rules and gateway objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackManifests;

impl ManifestBuilder for StackManifests {
    fn apply_default_settings(&self, opts: &mut Options) -> Result<()> {
        defaults::apply_default_settings(opts)
    }

    fn apply_gateway_defaults(&self, opts: &mut Options) -> Result<()> {
        defaults::apply_gateway_defaults(opts)
    }

    fn build_all(&self, opts: &Options) -> Result<Vec<DynamicObject>> {
        let mut out = vec![config::build_config_map(opts)?];
        if opts.rules_enabled() {
            out.push(rules::build_rules_config_map(opts)?);
            if let Some(secret) = rules::build_remote_write_secret(opts)? {
                out.push(secret);
            }
        }
        out.extend(components::build_services(opts)?);
        if opts.flags.enable_gateway {
            out.extend(gateway::build_gateway(opts)?);
        }
        Ok(out)
    }
}

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Labels shared by every object of a stack component.
pub fn component_labels(stack_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), "lokistack".to_string()),
        (LABEL_INSTANCE.to_string(), stack_name.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_MANAGED_BY.to_string(), "lokistack-operator".to_string()),
    ])
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use lokistack_core::stack::{ObjectStorageSchemaVersion, ObjectStorageSecretSpec, ObjectStorageSpec};

    pub fn options() -> Options {
        let schema = ObjectStorageSchema { version: ObjectStorageSchemaVersion::V12, effective_date: "2022-06-01".into() };
        Options {
            name: "dev".into(),
            namespace: "obs".into(),
            image: DEFAULT_CONTAINER_IMAGE.into(),
            gateway_image: DEFAULT_GATEWAY_IMAGE.into(),
            stack: LokiStackSpec {
                size: LokiStackSizeType::OneXSmall,
                storage: ObjectStorageSpec {
                    schemas: vec![schema.clone()],
                    secret: ObjectStorageSecretSpec { kind: ObjectStorageSecretType::S3, name: "loki-s3".into() },
                    tls: None,
                },
                ..Default::default()
            },
            object_storage: ObjectStorage {
                secret_name: "loki-s3".into(),
                backend: StorageBackend::S3 {
                    endpoint: "https://s3.example.com".into(),
                    buckets: "loki".into(),
                    region: None,
                },
                schemas: vec![schema],
                tls: None,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_fall_back_when_unset_or_empty() {
        let images = Images::from_lookup(|k| (k == ENV_RELATED_IMAGE_GATEWAY).then(String::new));
        assert_eq!(images, Images::default());

        let images = Images::from_lookup(|k| (k == ENV_RELATED_IMAGE_LOKI).then(|| "registry/loki:v3".to_string()));
        assert_eq!(images.loki, "registry/loki:v3");
        assert_eq!(images.gateway, DEFAULT_GATEWAY_IMAGE);
    }

    #[test]
    fn build_all_is_deterministic() {
        let mut opts = testing::options();
        StackManifests.apply_default_settings(&mut opts).unwrap();
        let a = serde_json::to_value(StackManifests.build_all(&opts).unwrap()).unwrap();
        let b = serde_json::to_value(StackManifests.build_all(&opts).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gateway_objects_only_with_flag() {
        let mut opts = testing::options();
        StackManifests.apply_default_settings(&mut opts).unwrap();
        let kinds = |objs: Vec<DynamicObject>| -> Vec<String> {
            objs.into_iter().filter_map(|o| o.types.map(|t| t.kind)).collect()
        };
        let without = kinds(StackManifests.build_all(&opts).unwrap());
        assert!(!without.iter().any(|k| k == "ClusterRole"));

        opts.flags.enable_gateway = true;
        opts.stack.tenants = Some(lokistack_core::stack::TenantsSpec { mode: ModeType::OpenshiftLogging, ..Default::default() });
        opts.gateway_base_domain = "apps.example.com".into();
        StackManifests.apply_gateway_defaults(&mut opts).unwrap();
        let with = kinds(StackManifests.build_all(&opts).unwrap());
        assert!(with.iter().any(|k| k == "ClusterRole"));
        assert!(with.iter().any(|k| k == "ClusterRoleBinding"));
    }
}
