//! Object storage secret and CA config map checks.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use lokistack_core::stack::ObjectStorageSecretType;
use lokistack_manifests::StorageBackend;

/// Key the CA bundle must be stored under.
pub const CA_BUNDLE_KEY: &str = "service-ca.crt";

/// Shape problem of a referenced secret.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("missing secret field: {0}")]
    MissingField(String),
    #[error("secret field {0} is not valid utf-8")]
    NotUtf8(String),
}

/// Required, non-empty UTF-8 value of `key`.
pub(crate) fn required(data: &BTreeMap<String, ByteString>, key: &str) -> Result<String, SecretError> {
    match optional(data, key)? {
        Some(v) => Ok(v),
        None => Err(SecretError::MissingField(key.to_string())),
    }
}

/// UTF-8 value of `key`; absent and empty both read as `None`.
pub(crate) fn optional(data: &BTreeMap<String, ByteString>, key: &str) -> Result<Option<String>, SecretError> {
    let Some(raw) = data.get(key) else {
        return Ok(None);
    };
    let v = String::from_utf8(raw.0.clone()).map_err(|_| SecretError::NotUtf8(key.to_string()))?;
    Ok((!v.is_empty()).then_some(v))
}

pub(crate) fn secret_data(secret: &Secret) -> BTreeMap<String, ByteString> {
    secret.data.clone().unwrap_or_default()
}

/// Validate the storage secret against the declared backend and keep its
/// non-secret connection settings.
pub fn extract_secret(secret: &Secret, kind: ObjectStorageSecretType) -> Result<StorageBackend, SecretError> {
    let data = secret_data(secret);
    let backend = match kind {
        ObjectStorageSecretType::S3 => {
            let endpoint = required(&data, "endpoint")?;
            let buckets = required(&data, "bucketnames")?;
            required(&data, "access_key_id")?;
            required(&data, "access_key_secret")?;
            StorageBackend::S3 { endpoint, buckets, region: optional(&data, "region")? }
        }
        ObjectStorageSecretType::Azure => {
            let environment = required(&data, "environment")?;
            let container = required(&data, "container")?;
            let account_name = required(&data, "account_name")?;
            required(&data, "account_key")?;
            StorageBackend::Azure { environment, container, account_name }
        }
        ObjectStorageSecretType::Gcs => {
            let bucket = required(&data, "bucketname")?;
            required(&data, "key.json")?;
            StorageBackend::Gcs { bucket }
        }
        ObjectStorageSecretType::Swift => {
            let auth_url = required(&data, "auth_url")?;
            for key in ["username", "user_domain_name", "user_domain_id", "user_id", "password", "domain_id", "domain_name"] {
                required(&data, key)?;
            }
            let container = required(&data, "container_name")?;
            StorageBackend::Swift { auth_url, container, region: optional(&data, "region")? }
        }
    };
    Ok(backend)
}

/// A CA config map is usable when it carries a non-empty `service-ca.crt`.
pub fn is_valid_ca_configmap(cm: &ConfigMap) -> bool {
    cm.data
        .as_ref()
        .and_then(|d| d.get(CA_BUNDLE_KEY))
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}
