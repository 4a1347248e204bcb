//! Cluster DNS config (config.openshift.io/v1), source of the gateway base domain.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton DNS config object.
pub const CLUSTER_DNS_NAME: &str = "cluster";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "config.openshift.io", version = "v1", kind = "DNS")]
#[serde(rename_all = "camelCase")]
pub struct DNSSpec {
    #[serde(default)]
    pub base_domain: String,
}
