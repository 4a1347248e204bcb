//! LokiStack in-RAM store: a version-checked object map behind the `StoreClient` seam.
//!
//! Every write is journaled in order so callers can assert what a reconcile pass
//! touched. Faults can be injected per object name, per key (reads) or for the
//! status subresource.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::{
    core::{DynamicObject, GroupVersionKind},
    Resource,
};
use lokistack_kubehub::{gvk_key, to_dynamic, ObjectKey, StoreClient, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Created,
    Updated,
    StatusPatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    pub kind: WriteKind,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Faults {
    writes: FxHashSet<String>,
    reads: FxHashSet<ObjectKey>,
    lists: FxHashSet<GroupVersionKind>,
    status: bool,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, DynamicObject>,
    next_rv: u64,
    journal: Vec<StoreWrite>,
    reads: Vec<ObjectKey>,
    faults: Faults,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// In-memory [`StoreClient`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a typed object, bypassing the journal. Assigns uid and resourceVersion.
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, obj: &K) -> Result<DynamicObject, StoreError> {
        self.insert_dynamic(to_dynamic(obj)?)
    }

    pub fn insert_dynamic(&self, mut obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(&obj)?;
        let mut inner = self.lock();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Make every create/update of objects named `name` fail.
    pub fn fail_writes_named(&self, name: &str) {
        self.lock().faults.writes.insert(name.to_string());
    }

    /// Make reads of `key` fail with a non-"not found" error.
    pub fn fail_reads_of(&self, key: ObjectKey) {
        self.lock().faults.reads.insert(key);
    }

    /// Make every list of `gvk` fail.
    pub fn fail_lists_of(&self, gvk: GroupVersionKind) {
        self.lock().faults.lists.insert(gvk);
    }

    pub fn fail_status_patches(&self) {
        self.lock().faults.status = true;
    }

    pub fn journal(&self) -> Vec<StoreWrite> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Keys of objects written with `kind`, in journal order.
    pub fn writes(&self, kind: WriteKind) -> Vec<ObjectKey> {
        self.lock().journal.iter().filter(|w| w.kind == kind).map(|w| w.key.clone()).collect()
    }

    /// Keys passed to `get`, in call order.
    pub fn reads(&self) -> Vec<ObjectKey> {
        self.lock().reads.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current copy of an object without recording a read.
    pub fn peek(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }
}

fn labels_match(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(sel) = selector else { return true };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    sel.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(|lv| lv == v).unwrap_or(false),
        None => labels.contains_key(term),
    })
}

fn merge_status(obj: &mut DynamicObject, patch: Json) {
    if !obj.data.is_object() {
        obj.data = Json::Object(serde_json::Map::new());
    }
    let Some(map) = obj.data.as_object_mut() else { return };
    let status = map.entry("status").or_insert_with(|| Json::Object(serde_json::Map::new()));
    match (status.as_object_mut(), patch) {
        (Some(cur), Json::Object(p)) => {
            for (k, v) in p {
                cur.insert(k, v);
            }
        }
        (_, p) => *status = p,
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.reads.push(key.clone());
        if inner.faults.reads.contains(key) {
            return Err(StoreError::Request(format!("injected read failure for {}", key)));
        }
        inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        if inner.faults.lists.contains(gvk) {
            return Err(StoreError::Request(format!("injected list failure for {}", gvk_key(gvk))));
        }
        let mut out: Vec<(&ObjectKey, &DynamicObject)> = inner
            .objects
            .iter()
            .filter(|(k, _)| &k.gvk == gvk)
            .filter(|(k, _)| namespace.map(|ns| k.namespace.as_deref() == Some(ns)).unwrap_or(true))
            .filter(|(_, o)| labels_match(o, label_selector))
            .collect();
        out.sort_by(|a, b| a.0.namespace.cmp(&b.0.namespace).then(a.0.name.cmp(&b.0.name)));
        Ok(out.into_iter().map(|(_, o)| o.clone()).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let mut inner = self.lock();
        if inner.faults.writes.contains(&key.name) {
            return Err(StoreError::Request(format!("injected write failure for {}", key)));
        }
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict { key, message: "already exists".into() });
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(key.clone(), stored.clone());
        debug!(key = %key, "memory store create");
        inner.journal.push(StoreWrite { kind: WriteKind::Created, key });
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let mut inner = self.lock();
        if inner.faults.writes.contains(&key.name) {
            return Err(StoreError::Request(format!("injected write failure for {}", key)));
        }
        let current = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict {
                    key,
                    message: format!(
                        "resourceVersion {} is stale (current {})",
                        rv,
                        current.metadata.resource_version.unwrap_or_default()
                    ),
                });
            }
        }
        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(inner.bump());
        // Status is a subresource; a plain update never changes it.
        if let Some(map) = stored.data.as_object_mut() {
            map.remove("status");
            if let Some(status) = current.data.get("status") {
                map.insert("status".into(), status.clone());
            }
        }
        inner.objects.insert(key.clone(), stored.clone());
        debug!(key = %key, "memory store update");
        inner.journal.push(StoreWrite { kind: WriteKind::Updated, key });
        Ok(stored)
    }

    async fn patch_status(&self, key: &ObjectKey, status: Json) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.faults.status {
            return Err(StoreError::Request(format!("injected status failure for {}", key)));
        }
        let rv = inner.bump();
        let obj = inner.objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        merge_status(obj, status);
        obj.metadata.resource_version = Some(rv);
        inner.journal.push(StoreWrite { kind: WriteKind::StatusPatched, key: key.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    fn cm(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("ns".into());
        if !labels.is_empty() {
            cm.metadata.labels =
                Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
        }
        cm
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let seeded = store.insert(&cm("a", &[])).unwrap();
        let mut first = seeded.clone();
        first.data["data"] = serde_json::json!({ "k": "1" });
        store.update(&first).await.unwrap();

        let mut stale = seeded;
        stale.data["data"] = serde_json::json!({ "k": "2" });
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "err={}", err);
    }

    #[tokio::test]
    async fn missing_objects_report_not_found() {
        let store = MemoryStore::new();
        let err = store.get(&ObjectKey::of::<ConfigMap>(Some("ns"), "nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryStore::new();
        store.insert(&cm("b", &[("team", "logs")])).unwrap();
        store.insert(&cm("a", &[("team", "logs")])).unwrap();
        store.insert(&cm("c", &[("team", "metrics")])).unwrap();
        let gvk = ObjectKey::of::<ConfigMap>(None, "").gvk;
        let hits = store.list(&gvk, Some("ns"), Some("team=logs")).await.unwrap();
        let names: Vec<_> = hits.iter().filter_map(|o| o.metadata.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(store.list(&gvk, Some("other"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_patch_merges_and_survives_updates() {
        let store = MemoryStore::new();
        store.insert(&cm("a", &[])).unwrap();
        let key = ObjectKey::of::<ConfigMap>(Some("ns"), "a");
        store.patch_status(&key, serde_json::json!({ "phase": "Ready" })).await.unwrap();
        let live = store.get(&key).await.unwrap();
        store.update(&live).await.unwrap();
        assert_eq!(store.peek(&key).unwrap().data["status"]["phase"], "Ready");
        let kinds: Vec<_> = store.journal().iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WriteKind::StatusPatched, WriteKind::Updated]);
    }

    #[tokio::test]
    async fn injected_faults_fire() {
        let store = MemoryStore::new();
        store.fail_writes_named("a");
        let obj = to_dynamic(&cm("a", &[])).unwrap();
        assert!(store.create(&obj).await.is_err());
        assert!(store.journal().is_empty());

        let key = ObjectKey::of::<ConfigMap>(Some("ns"), "b");
        store.fail_reads_of(key.clone());
        let err = store.get(&key).await.unwrap_err();
        assert!(!err.is_not_found());

        store.fail_lists_of(key.gvk.clone());
        assert!(store.list(&key.gvk, None, None).await.is_err());
    }
}
