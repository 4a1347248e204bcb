//! Rendered Loki configuration shared by every component.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::{DynamicObject, ObjectMeta};
use lokistack_kubehub::to_dynamic;
use serde_json::{json, Value as Json};

use crate::{component_labels, Options, RulerSecret, StorageBackend};

pub const LOKI_CONFIG_FILE: &str = "config.yaml";
pub const LOKI_RUNTIME_CONFIG_FILE: &str = "runtime-config.yaml";
pub const CA_MOUNT_DIR: &str = "/var/run/ca";
pub const RULES_MOUNT_DIR: &str = "/tmp/rules";

pub fn config_map_name(stack_name: &str) -> String {
    format!("{}-config", stack_name)
}

fn storage_section(opts: &Options) -> Json {
    let mut section = match &opts.object_storage.backend {
        StorageBackend::S3 { endpoint, buckets, region } => json!({
            "s3": {
                "endpoint": endpoint,
                "bucketnames": buckets,
                "region": region,
                "access_key_id": "${AWS_ACCESS_KEY_ID}",
                "secret_access_key": "${AWS_ACCESS_KEY_SECRET}",
                "s3forcepathstyle": true,
            }
        }),
        StorageBackend::Azure { environment, container, account_name } => json!({
            "azure": {
                "environment": environment,
                "container_name": container,
                "account_name": account_name,
                "account_key": "${AZURE_STORAGE_ACCOUNT_KEY}",
            }
        }),
        StorageBackend::Gcs { bucket } => json!({ "gcs": { "bucket_name": bucket } }),
        StorageBackend::Swift { auth_url, container, region } => json!({
            "swift": {
                "auth_url": auth_url,
                "container_name": container,
                "region_name": region,
                "username": "${SWIFT_USERNAME}",
                "password": "${SWIFT_PASSWORD}",
            }
        }),
    };
    if let Some(tls) = &opts.object_storage.tls {
        let backend = opts.object_storage.backend.object_store();
        section[backend]["http_config"] = json!({ "ca_file": format!("{}/{}/service-ca.crt", CA_MOUNT_DIR, tls.ca) });
    }
    section
}

fn ruler_section(opts: &Options) -> Json {
    let mut ruler = json!({
        "enable_api": true,
        "rule_path": RULES_MOUNT_DIR,
        "storage": { "type": "local", "local": { "directory": RULES_MOUNT_DIR } },
    });
    if let Some(spec) = &opts.ruler.spec {
        if let Some(interval) = &spec.evaluation_interval {
            ruler["evaluation_interval"] = json!(interval);
        }
        if let Some(interval) = &spec.poll_interval {
            ruler["poll_interval"] = json!(interval);
        }
        if let Some(client) = spec.remote_write.as_ref().filter(|rw| rw.enabled).and_then(|rw| rw.client.as_ref()) {
            let auth = match &opts.ruler.secret {
                Some(RulerSecret::Basic { .. }) => json!({ "basic_auth": { "username": "${REMOTE_WRITE_USERNAME}", "password": "${REMOTE_WRITE_PASSWORD}" } }),
                Some(RulerSecret::Header { .. }) => json!({ "authorization": { "credentials": "${REMOTE_WRITE_BEARER_TOKEN}" } }),
                None => json!({}),
            };
            let mut c = json!({ "name": client.name, "url": client.url });
            if let (Some(c), Some(a)) = (c.as_object_mut(), auth.as_object()) {
                c.extend(a.clone());
            }
            ruler["remote_write"] = json!({ "enabled": true, "client": c });
        }
    }
    ruler
}

/// Loki configuration document for the stack.
pub fn render_config(opts: &Options) -> Json {
    let object_store = opts.object_storage.backend.object_store();
    let schema_configs: Vec<Json> = opts
        .object_storage
        .schemas
        .iter()
        .map(|s| {
            json!({
                "from": s.effective_date,
                "store": "boltdb-shipper",
                "object_store": object_store,
                "schema": s.version.as_str(),
                "index": { "prefix": "index_", "period": "24h" },
            })
        })
        .collect();

    let mut cfg = json!({
        "auth_enabled": true,
        "common": {
            "replication_factor": opts.stack.replication_factor.unwrap_or(1),
            "storage": storage_section(opts),
        },
        "schema_config": { "configs": schema_configs },
        "limits_config": {
            "ingestion_rate_mb": opts.sizing.ingestion_rate_mb,
            "ingestion_burst_size_mb": opts.sizing.ingestion_burst_size_mb,
            "max_global_streams_per_user": opts.sizing.max_global_streams_per_tenant,
        },
        "runtime_config": { "file": format!("/etc/loki/config/{}", LOKI_RUNTIME_CONFIG_FILE) },
    });
    if opts.rules_enabled() {
        cfg["ruler"] = ruler_section(opts);
    }
    cfg
}

pub fn build_config_map(opts: &Options) -> Result<DynamicObject> {
    let config = serde_yaml::to_string(&render_config(opts)).context("rendering loki config")?;
    let runtime = serde_yaml::to_string(&json!({ "overrides": {} })).context("rendering runtime config")?;
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&opts.name)),
            namespace: Some(opts.namespace.clone()),
            labels: Some(component_labels(&opts.name, "config")),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (LOKI_CONFIG_FILE.to_string(), config),
            (LOKI_RUNTIME_CONFIG_FILE.to_string(), runtime),
        ])),
        ..Default::default()
    };
    Ok(to_dynamic(&cm)?)
}
