//! `LokiStack` custom resource (loki.grafana.com/v1beta1).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declared desired state of a Loki deployment.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "loki.grafana.com",
    version = "v1beta1",
    kind = "LokiStack",
    namespaced,
    status = "LokiStackStatus",
    shortname = "lokistack"
)]
#[serde(rename_all = "camelCase")]
pub struct LokiStackSpec {
    #[serde(default)]
    pub size: LokiStackSizeType,
    pub storage: ObjectStorageSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<RulesSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenants: Option<TenantsSpec>,
}

/// Sizing class of a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum LokiStackSizeType {
    /// Development only; never reported in operator metrics.
    #[default]
    #[serde(rename = "1x.extra-small")]
    OneXExtraSmall,
    #[serde(rename = "1x.small")]
    OneXSmall,
    #[serde(rename = "1x.medium")]
    OneXMedium,
}

impl LokiStackSizeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneXExtraSmall => "1x.extra-small",
            Self::OneXSmall => "1x.small",
            Self::OneXMedium => "1x.medium",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageSpec {
    #[serde(default)]
    pub schemas: Vec<ObjectStorageSchema>,
    pub secret: ObjectStorageSecretSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ObjectStorageTlsSpec>,
}

/// One entry of the index schema timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageSchema {
    pub version: ObjectStorageSchemaVersion,
    /// UTC date (`YYYY-MM-DD`) from which the version applies.
    pub effective_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ObjectStorageSchemaVersion {
    #[serde(rename = "v11")]
    V11,
    #[serde(rename = "v12")]
    V12,
}

impl ObjectStorageSchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V11 => "v11",
            Self::V12 => "v12",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageSecretSpec {
    #[serde(rename = "type")]
    pub kind: ObjectStorageSecretType,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStorageSecretType {
    Azure,
    Gcs,
    #[default]
    S3,
    Swift,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageTlsSpec {
    /// Name of the config map carrying `service-ca.crt`.
    pub ca_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RulesSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Labels a rule object must carry to be picked up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<std::collections::BTreeMap<String, String>>,
    /// Labels of the namespaces searched for rules; the stack namespace when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<std::collections::BTreeMap<String, String>>,
}

/// Tenancy mode of the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ModeType {
    #[default]
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "dynamic")]
    Dynamic,
    /// Platform-managed tenants and authentication.
    #[serde(rename = "openshift-logging")]
    OpenshiftLogging,
}

impl ModeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::OpenshiftLogging => "openshift-logging",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantsSpec {
    pub mode: ModeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Vec<AuthenticationSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    pub tenant_name: String,
    pub tenant_id: String,
    pub oidc: OidcSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcSpec {
    /// Secret carrying `clientID`, and optionally `clientSecret` and `issuerCAPath`.
    pub secret_name: String,
    pub issuer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_claim: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opa: Option<OpaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_bindings: Option<Vec<RoleBindingSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpaSpec {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub tenants: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingSpec {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Status sub-record, owned by the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LokiStackStatus {
    #[serde(default)]
    pub conditions: Vec<StackCondition>,
    #[serde(default)]
    pub storage: LokiStackStorageStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LokiStackStorageStatus {
    /// Schemas the running components were last configured with.
    #[serde(default)]
    pub schemas: Vec<ObjectStorageSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackCondition {
    /// Ready, Pending, Failed or Degraded.
    pub r#type: String,
    /// True, False or Unknown.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC3339 timestamp of the last status flip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
