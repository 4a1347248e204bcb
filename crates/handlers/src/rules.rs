//! Rule discovery and ruler remote-write credentials.

use anyhow::{Context as _, Result};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;
use lokistack_core::prelude::*;
use lokistack_core::rules::{RemoteWriteAuthType, RemoteWriteClientSpec};
use lokistack_core::stack::RulesSpec;
use lokistack_kubehub::{get_as, list_as, StoreClient};
use lokistack_manifests::RulerSecret;
use tracing::debug;

use crate::storage::{required, secret_data, SecretError};
use crate::ReconcileError;

/// Namespaces searched for rules: those matching the namespace selector, or
/// the stack namespace alone.
async fn rule_namespaces(store: &dyn StoreClient, namespace: &str, spec: &RulesSpec) -> Result<Vec<String>> {
    let Some(selector) = spec.namespace_selector.as_ref() else {
        return Ok(vec![namespace.to_string()]);
    };
    let namespaces: Vec<Namespace> = list_as(store, None, Some(selector)).await.context("listing rule namespaces")?;
    Ok(namespaces.iter().map(|ns| ns.name_any()).collect())
}

/// Alerting and recording rules selected by `spec`, ordered by namespace.
pub async fn list(
    store: &dyn StoreClient,
    namespace: &str,
    spec: &RulesSpec,
) -> Result<(Vec<AlertingRule>, Vec<RecordingRule>)> {
    let namespaces = rule_namespaces(store, namespace, spec).await?;
    let selector = spec.selector.as_ref();

    let alerting = try_join_all(namespaces.iter().map(|ns| list_as::<AlertingRule>(store, Some(ns), selector)))
        .await
        .context("listing alerting rules")?;
    let recording = try_join_all(namespaces.iter().map(|ns| list_as::<RecordingRule>(store, Some(ns), selector)))
        .await
        .context("listing recording rules")?;

    let alerting: Vec<_> = alerting.into_iter().flatten().collect();
    let recording: Vec<_> = recording.into_iter().flatten().collect();
    debug!(namespaces = namespaces.len(), alerting = alerting.len(), recording = recording.len(), "rules listed");
    Ok((alerting, recording))
}

/// Ruler settings from the `RulerConfig` named like the stack, if any.
pub async fn get_ruler_config(store: &dyn StoreClient, req: &NamespacedName) -> Result<Option<RulerConfigSpec>> {
    match get_as::<RulerConfig>(store, Some(&req.namespace), &req.name).await {
        Ok(cfg) => Ok(Some(cfg.spec)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lookup ruler config {}", req)),
    }
}

/// Credentials for the remote-write client in the shape its auth type needs.
pub fn extract_ruler_secret(secret: &Secret, auth: RemoteWriteAuthType) -> Result<RulerSecret, SecretError> {
    let data = secret_data(secret);
    Ok(match auth {
        RemoteWriteAuthType::Basic => {
            RulerSecret::Basic { username: required(&data, "username")?, password: required(&data, "password")? }
        }
        RemoteWriteAuthType::Header => RulerSecret::Header { bearer_token: required(&data, "bearer_token")? },
    })
}

pub(crate) async fn ruler_secret(
    store: &dyn StoreClient,
    namespace: &str,
    client: &RemoteWriteClientSpec,
) -> Result<RulerSecret, ReconcileError> {
    let key = NamespacedName::new(namespace, &client.authorization_secret_name);
    let secret: Secret = match get_as(store, Some(namespace), &key.name).await {
        Ok(s) => s,
        Err(e) if e.is_not_found() => {
            return Err(DegradedError::new(
                DegradedReason::MissingRulerSecret,
                "Missing ruler remote write authorization secret",
            )
            .into())
        }
        Err(e) => return Err(ReconcileError::lookup(e, "failed to lookup lokistack ruler secret", &key)),
    };
    extract_ruler_secret(&secret, client.authorization).map_err(|_| {
        DegradedError::new(DegradedReason::InvalidRulerSecret, "Invalid ruler remote write authorization secret contents")
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(pairs.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn basic_auth_needs_both_fields() {
        let ok = secret(&[("username", "loki"), ("password", "pw")]);
        assert_eq!(
            extract_ruler_secret(&ok, RemoteWriteAuthType::Basic).unwrap(),
            RulerSecret::Basic { username: "loki".into(), password: "pw".into() }
        );
        let partial = secret(&[("username", "loki")]);
        assert_eq!(
            extract_ruler_secret(&partial, RemoteWriteAuthType::Basic),
            Err(SecretError::MissingField("password".into()))
        );
    }

    #[test]
    fn header_auth_needs_token() {
        assert!(extract_ruler_secret(&secret(&[("username", "x")]), RemoteWriteAuthType::Header).is_err());
        assert_eq!(
            extract_ruler_secret(&secret(&[("bearer_token", "t")]), RemoteWriteAuthType::Header).unwrap(),
            RulerSecret::Header { bearer_token: "t".into() }
        );
    }
}
