//! Gateway objects: tenant configuration and the cluster RBAC it needs to
//! review tokens.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::core::{DynamicObject, ObjectMeta};
use lokistack_core::stack::{ModeType, TenantsSpec};
use lokistack_kubehub::to_dynamic;
use serde::{Deserialize, Serialize};

use crate::{component_labels, Options, TenantConfig};

pub const TENANTS_FILE: &str = "tenants.yaml";
pub const RBAC_FILE: &str = "rbac.yaml";

pub fn gateway_name(stack_name: &str) -> String {
    format!("{}-gateway", stack_name)
}

/// Name of the cluster-scoped gateway RBAC objects; unique per stack across namespaces.
pub fn gateway_cluster_name(namespace: &str, stack_name: &str) -> String {
    format!("{}-{}-gateway", namespace, stack_name)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenShiftEntry {
    cookie_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OidcEntry {
    #[serde(rename = "clientID")]
    client_id: String,
    #[serde(rename = "issuerURL")]
    issuer_url: String,
    #[serde(default, rename = "redirectURL", skip_serializing_if = "Option::is_none")]
    redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username_claim: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TenantEntry {
    name: String,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    openshift: Option<OpenShiftEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oidc: Option<OidcEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opa: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: Vec<TenantEntry>,
}

/// Read tenant ids and cookie secrets back from a rendered `tenants.yaml`.
pub fn parse_tenants_yaml(raw: &str) -> Result<BTreeMap<String, TenantConfig>> {
    let file: TenantsFile = serde_yaml::from_str(raw).context("decoding tenants.yaml")?;
    Ok(file
        .tenants
        .into_iter()
        .map(|t| {
            let cfg = TenantConfig { id: t.id, cookie_secret: t.openshift.map(|o| o.cookie_secret) };
            (t.name, cfg)
        })
        .collect())
}

fn tenant_entries(opts: &Options, spec: &TenantsSpec) -> Vec<TenantEntry> {
    match spec.mode {
        ModeType::OpenshiftLogging => opts
            .tenants
            .configs
            .iter()
            .map(|(name, cfg)| TenantEntry {
                name: name.clone(),
                id: cfg.id.clone(),
                openshift: cfg.cookie_secret.clone().map(|cookie_secret| OpenShiftEntry { cookie_secret }),
                ..Default::default()
            })
            .collect(),
        ModeType::Static | ModeType::Dynamic => {
            let opa = spec
                .authorization
                .as_ref()
                .and_then(|a| a.opa.as_ref())
                .map(|o| BTreeMap::from([("url".to_string(), o.url.clone())]));
            spec.authentication
                .iter()
                .flatten()
                .map(|auth| {
                    let client_id = opts
                        .tenants
                        .secrets
                        .iter()
                        .find(|s| s.tenant_name == auth.tenant_name)
                        .map(|s| s.client_id.clone())
                        .unwrap_or_default();
                    TenantEntry {
                        name: auth.tenant_name.clone(),
                        id: auth.tenant_id.clone(),
                        openshift: None,
                        oidc: Some(OidcEntry {
                            client_id,
                            issuer_url: auth.oidc.issuer_url.clone(),
                            redirect_url: auth.oidc.redirect_url.clone(),
                            group_claim: auth.oidc.group_claim.clone(),
                            username_claim: auth.oidc.username_claim.clone(),
                        }),
                        opa: opa.clone(),
                    }
                })
                .collect()
        }
    }
}

fn rbac_yaml(spec: &TenantsSpec) -> Result<Option<String>> {
    if spec.mode != ModeType::Static {
        return Ok(None);
    }
    let Some(authz) = &spec.authorization else {
        return Ok(None);
    };
    let doc = serde_json::json!({
        "roles": authz.roles.clone().unwrap_or_default(),
        "roleBindings": authz.role_bindings.clone().unwrap_or_default(),
    });
    Ok(Some(serde_yaml::to_string(&doc).context("rendering rbac.yaml")?))
}

/// Gateway config map, cluster role and binding.
pub(crate) fn build_gateway(opts: &Options) -> Result<Vec<DynamicObject>> {
    let spec = opts.stack.tenants.clone().unwrap_or_default();
    let name = gateway_name(&opts.name);
    let labels = component_labels(&opts.name, "gateway");

    let tenants = TenantsFile { tenants: tenant_entries(opts, &spec) };
    let mut data = BTreeMap::from([(
        TENANTS_FILE.to_string(),
        serde_yaml::to_string(&tenants).context("rendering tenants.yaml")?,
    )]);
    if let Some(rbac) = rbac_yaml(&spec)? {
        data.insert(RBAC_FILE.to_string(), rbac);
    }
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(opts.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let cluster_name = gateway_cluster_name(&opts.namespace, &opts.name);
    let role = ClusterRole {
        metadata: ObjectMeta { name: Some(cluster_name.clone()), labels: Some(labels.clone()), ..Default::default() },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["authentication.k8s.io".into()]),
                resources: Some(vec!["tokenreviews".into()]),
                verbs: vec!["create".into()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["authorization.k8s.io".into()]),
                resources: Some(vec!["subjectaccessreviews".into()]),
                verbs: vec!["create".into()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let binding = ClusterRoleBinding {
        metadata: ObjectMeta { name: Some(cluster_name.clone()), labels: Some(labels), ..Default::default() },
        role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "ClusterRole".into(), name: cluster_name },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name,
            namespace: Some(opts.namespace.clone()),
            ..Default::default()
        }]),
    };

    let mut out = vec![to_dynamic(&cm)?, to_dynamic(&role)?, to_dynamic(&binding)?];
    if opts.flags.enable_gateway_route && !opts.gateway_base_domain.is_empty() {
        out.push(build_route(opts)?);
    }
    Ok(out)
}

/// OpenShift route exposing the gateway service under the cluster base domain.
fn build_route(opts: &Options) -> Result<DynamicObject> {
    let name = gateway_name(&opts.name);
    let route = serde_json::json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": {
            "name": name,
            "namespace": opts.namespace,
            "labels": component_labels(&opts.name, "gateway"),
        },
        "spec": {
            "host": format!("{}-{}.{}", name, opts.namespace, opts.gateway_base_domain),
            "to": { "kind": "Service", "name": name },
            "port": { "targetPort": "public" },
            "tls": { "termination": "reencrypt" },
        },
    });
    serde_json::from_value(route).context("building gateway route")
}
