//! LokiStack core types: custom resources, feature flags and degraded reasons.

#![forbid(unsafe_code)]

use std::fmt;

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

pub mod openshift;
pub mod rules;
pub mod stack;

pub use stack::{LokiStack, LokiStackSpec, LokiStackStatus};

pub mod prelude {
    pub use super::{DegradedError, DegradedReason, FeatureFlags, NamespacedName};
    pub use super::rules::{AlertingRule, RecordingRule, RulerConfig, RulerConfigSpec};
    pub use super::stack::{
        LokiStack, LokiStackSizeType, LokiStackSpec, LokiStackStatus, ModeType, ObjectStorageSchema,
        ObjectStorageSecretType,
    };
}

/// Identity of a namespaced object as handed over by the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of a namespaced resource; `None` for objects without a namespace.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let ns = obj.namespace()?;
        Some(Self { namespace: ns, name: obj.name_any() })
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operator-wide feature switches, fixed at process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Deploy the multi-tenant gateway in front of the stack.
    pub enable_gateway: bool,
    /// Expose the gateway through an OpenShift route.
    pub enable_gateway_route: bool,
    /// Label services for ServiceMonitor discovery.
    pub enable_service_monitors: bool,
}

/// Machine-readable reason attached to a degraded stack condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DegradedReason {
    MissingObjectStorageSecret,
    InvalidObjectStorageSecret,
    InvalidObjectStorageSchema,
    MissingObjectStorageCAConfigMap,
    InvalidObjectStorageCAConfigMap,
    MissingRulerSecret,
    InvalidRulerSecret,
    MissingGatewayTenantSecret,
    InvalidGatewayTenantSecret,
    MissingGatewayOpenShiftBaseDomain,
    InvalidTenantsConfiguration,
}

impl DegradedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingObjectStorageSecret => "MissingObjectStorageSecret",
            Self::InvalidObjectStorageSecret => "InvalidObjectStorageSecret",
            Self::InvalidObjectStorageSchema => "InvalidObjectStorageSchema",
            Self::MissingObjectStorageCAConfigMap => "MissingObjectStorageCAConfigMap",
            Self::InvalidObjectStorageCAConfigMap => "InvalidObjectStorageCAConfigMap",
            Self::MissingRulerSecret => "MissingRulerSecret",
            Self::InvalidRulerSecret => "InvalidRulerSecret",
            Self::MissingGatewayTenantSecret => "MissingGatewayTenantSecret",
            Self::InvalidGatewayTenantSecret => "InvalidGatewayTenantSecret",
            Self::MissingGatewayOpenShiftBaseDomain => "MissingGatewayOpenShiftBaseDomain",
            Self::InvalidTenantsConfiguration => "InvalidTenantsConfiguration",
        }
    }
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized, user-actionable misconfiguration of a stack.
///
/// The caller records it on the stack status and uses `requeue` to decide
/// whether retrying without user intervention makes sense.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct DegradedError {
    pub message: String,
    pub reason: DegradedReason,
    pub requeue: bool,
}

impl DegradedError {
    /// Degraded value that waits for the user to fix the input.
    pub fn new(reason: DegradedReason, message: impl Into<String>) -> Self {
        Self { message: message.into(), reason, requeue: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_name_displays_as_path() {
        let n = NamespacedName::new("observability", "lokistack-dev");
        assert_eq!(n.to_string(), "observability/lokistack-dev");
    }

    #[test]
    fn degraded_error_does_not_requeue_by_default() {
        let d = DegradedError::new(DegradedReason::MissingObjectStorageSecret, "Missing object storage secret");
        assert!(!d.requeue);
        assert_eq!(d.to_string(), "MissingObjectStorageSecret: Missing object storage secret");
    }

    #[test]
    fn namespaced_name_of_cluster_scoped_object_is_none() {
        let dns = openshift::DNS::new("cluster", openshift::DNSSpec::default());
        assert!(NamespacedName::of(&dns).is_none());
        let mut stack = LokiStack::new("dev", LokiStackSpec::default());
        stack.metadata.namespace = Some("obs".into());
        assert_eq!(NamespacedName::of(&stack), Some(NamespacedName::new("obs", "dev")));
    }
}
