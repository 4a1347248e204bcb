//! Rule files for the ruler and its remote-write credentials.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::core::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use lokistack_kubehub::to_dynamic;
use serde::Serialize;

use crate::{component_labels, Options, RulerSecret};

pub fn rules_config_map_name(stack_name: &str) -> String {
    format!("{}-rules", stack_name)
}

pub fn remote_write_secret_name(stack_name: &str) -> String {
    format!("{}-ruler-remote-write", stack_name)
}

#[derive(Serialize)]
struct RuleFile<'a, G> {
    tenant: &'a str,
    groups: &'a [G],
}

/// File name of one rule object. `_` never occurs in namespace or object
/// names, so keys of different kinds or namespaces cannot collide.
fn rule_key(kind: &str, namespace: Option<String>, name: &str) -> String {
    format!("{}_{}_{}.yaml", kind, namespace.unwrap_or_default(), name)
}

/// Config map with one file per rule object, keyed `<kind>_<namespace>_<name>.yaml`.
pub fn build_rules_config_map(opts: &Options) -> Result<DynamicObject> {
    let mut data = BTreeMap::new();
    for rule in &opts.alerting_rules {
        let file = RuleFile { tenant: &rule.spec.tenant_id, groups: &rule.spec.groups };
        let body = serde_yaml::to_string(&file).with_context(|| format!("rendering alerting rule {}", rule.name_any()))?;
        data.insert(rule_key("alerting", rule.namespace(), &rule.name_any()), body);
    }
    for rule in &opts.recording_rules {
        let file = RuleFile { tenant: &rule.spec.tenant_id, groups: &rule.spec.groups };
        let body = serde_yaml::to_string(&file).with_context(|| format!("rendering recording rule {}", rule.name_any()))?;
        data.insert(rule_key("recording", rule.namespace(), &rule.name_any()), body);
    }
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(rules_config_map_name(&opts.name)),
            namespace: Some(opts.namespace.clone()),
            labels: Some(component_labels(&opts.name, "ruler")),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    Ok(to_dynamic(&cm)?)
}

/// Secret mounted into the ruler when remote write is configured.
pub fn build_remote_write_secret(opts: &Options) -> Result<Option<DynamicObject>> {
    let Some(secret) = &opts.ruler.secret else {
        return Ok(None);
    };
    let entries: Vec<(&str, &str)> = match secret {
        RulerSecret::Basic { username, password } => vec![("username", username.as_str()), ("password", password.as_str())],
        RulerSecret::Header { bearer_token } => vec![("bearer_token", bearer_token.as_str())],
    };
    let data = entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    let obj = Secret {
        metadata: ObjectMeta {
            name: Some(remote_write_secret_name(&opts.name)),
            namespace: Some(opts.namespace.clone()),
            labels: Some(component_labels(&opts.name, "ruler")),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    Ok(Some(to_dynamic(&obj)?))
}
