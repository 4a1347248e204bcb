//! LokiStack kubehub: the store client seam and its kube-rs backed implementation.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Address of one object: kind plus optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Key of a statically typed resource.
    pub fn of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> Self {
        Self::new(gvk_of::<K>(), namespace, name)
    }

    /// Key of a dynamic object; fails when type meta or name are missing.
    pub fn for_object(obj: &DynamicObject) -> Result<Self, StoreError> {
        let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
        Ok(Self::new(parse_api_version(&types.api_version, &types.kind), obj.metadata.namespace.as_deref(), name))
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.gvk)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Split an `apiVersion` into group and version.
pub fn parse_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((g, v)) => GroupVersionKind::gvk(g, v, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Render a `key=value,...` label selector; `None` for an empty map.
pub fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("conflict writing {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error("decoding {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Live object store the reconciler reads from and writes to.
///
/// Updates are version-checked through `metadata.resourceVersion`; concurrent
/// writers are expected to surface as [`StoreError::Conflict`].
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError>;

    /// List objects of `gvk`, in `namespace` or cluster-wide, optionally filtered by a label selector.
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Merge `status` into the status subresource of the object at `key`.
    async fn patch_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<(), StoreError>;
}

/// Convert a dynamic object into a typed resource.
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, StoreError> {
    let key = obj.metadata.name.clone().unwrap_or_default();
    let v = serde_json::to_value(obj).map_err(|source| StoreError::Decode { key: key.clone(), source })?;
    serde_json::from_value(v).map_err(|source| StoreError::Decode { key, source })
}

/// Convert a typed resource into a dynamic object (type meta included).
pub fn to_dynamic<K: Resource<DynamicType = ()> + Serialize>(obj: &K) -> Result<DynamicObject, StoreError> {
    let key = obj.meta().name.clone().unwrap_or_default();
    let mut v = serde_json::to_value(obj).map_err(|source| StoreError::Decode { key: key.clone(), source })?;
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), serde_json::Value::String(K::api_version(&()).into_owned()));
        map.insert("kind".into(), serde_json::Value::String(K::kind(&()).into_owned()));
    }
    serde_json::from_value(v).map_err(|source| StoreError::Decode { key, source })
}

pub async fn get_as<K>(store: &dyn StoreClient, namespace: Option<&str>, name: &str) -> Result<K, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let obj = store.get(&ObjectKey::of::<K>(namespace, name)).await?;
    from_dynamic(obj)
}

pub async fn list_as<K>(
    store: &dyn StoreClient,
    namespace: Option<&str>,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<Vec<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let selector = labels.and_then(label_selector);
    let items = store.list(&gvk_of::<K>(), namespace, selector.as_deref()).await?;
    items.into_iter().map(from_dynamic).collect()
}

/// Store client talking to the API server.
pub struct KubeStore {
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Resolve (and cache) the api resource and scope for a GVK.
    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
        let key = gvk_key(gvk);
        let mut cache = self.resources.lock().await;
        if let Some(found) = cache.get(&key) {
            return Ok(found.clone());
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, plural = %ar.plural, namespaced, "resolved api resource");
        cache.insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn classify(err: kube::Error, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { key: key.clone(), message: ae.message },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl StoreClient for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        let api = self.api(&key.gvk, key.namespace.as_deref()).await?;
        api.get(&key.name).await.map_err(|e| classify(e, key))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let api = self.api(&key.gvk, key.namespace.as_deref()).await?;
        api.create(&PostParams::default(), obj).await.map_err(|e| classify(e, &key))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let api = self.api(&key.gvk, key.namespace.as_deref()).await?;
        api.replace(&key.name, &PostParams::default(), obj).await.map_err(|e| classify(e, &key))
    }

    async fn patch_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<(), StoreError> {
        let api = self.api(&key.gvk, key.namespace.as_deref()).await?;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::api::rbac::v1::ClusterRole;

    #[test]
    fn gvk_keys_follow_core_group_convention() {
        assert_eq!(ObjectKey::of::<ConfigMap>(Some("ns"), "cm").gvk_key(), "v1/ConfigMap");
        assert_eq!(
            ObjectKey::of::<ClusterRole>(None, "r").gvk_key(),
            "rbac.authorization.k8s.io/v1/ClusterRole"
        );
    }

    #[test]
    fn object_key_display_includes_scope() {
        assert_eq!(ObjectKey::of::<ConfigMap>(Some("ns"), "cm").to_string(), "v1/ConfigMap ns/cm");
        assert_eq!(ObjectKey::of::<ClusterRole>(None, "r").to_string(), "rbac.authorization.k8s.io/v1/ClusterRole r");
    }

    #[test]
    fn typed_objects_round_trip_through_dynamic() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cfg".into());
        cm.metadata.namespace = Some("ns".into());
        cm.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let dynamic = to_dynamic(&cm).unwrap();
        let key = ObjectKey::for_object(&dynamic).unwrap();
        assert_eq!(key, ObjectKey::of::<ConfigMap>(Some("ns"), "cfg"));
        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back.data.unwrap().get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn label_selector_is_sorted_and_comma_joined() {
        let labels = BTreeMap::from([("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())]);
        assert_eq!(label_selector(&labels).as_deref(), Some("a=1,b=2"));
        assert_eq!(label_selector(&BTreeMap::new()), None);
    }

    #[test]
    fn api_version_without_group_maps_to_core() {
        let gvk = parse_api_version("v1", "Secret");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        let gvk = parse_api_version("loki.grafana.com/v1beta1", "LokiStack");
        assert_eq!(gvk.group, "loki.grafana.com");
    }
}
