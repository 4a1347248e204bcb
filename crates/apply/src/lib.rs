//! LokiStack apply: ownership, merge functions and idempotent create-or-update of target objects.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use kube::{
    core::{DynamicObject, GroupVersionKind},
    Resource, ResourceExt,
};
use lokistack_kubehub::{ObjectKey, StoreClient};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error, info};

/// What `create_or_update` did to the live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Unchanged,
    Created,
    Updated,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-scoped kinds the stack emits; everything else lives in the stack namespace.
pub fn is_namespace_scoped(gvk: &GroupVersionKind) -> bool {
    !(gvk.group == "rbac.authorization.k8s.io" && matches!(gvk.kind.as_str(), "ClusterRole" | "ClusterRoleBinding"))
}

/// Make `owner` the controlling owner of `child`.
///
/// Fails when the owner has no uid yet or the child is already controlled by another object.
pub fn set_owner_reference<O>(owner: &O, child: &mut DynamicObject) -> Result<()>
where
    O: Resource<DynamicType = ()>,
{
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow!("owner {} has no uid", owner.name_any()))?;
    let refs = child.metadata.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner_ref.uid) {
        bail!("object is already owned by another controller {}/{}", other.kind, other.name);
    }
    refs.retain(|r| r.uid != owner_ref.uid);
    refs.push(owner_ref);
    Ok(())
}

/// Label prefixes this operator owns; live keys under them that are no longer
/// desired are removed.
const MANAGED_LABEL_PREFIXES: &[&str] = &["loki.grafana.com/"];

fn merge_string_map(live: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    if let Some(desired) = desired {
        let dst = live.get_or_insert_with(BTreeMap::new);
        for (k, v) in desired {
            dst.insert(k.clone(), v.clone());
        }
    }
}

fn merge_labels(live: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    if let Some(dst) = live.as_mut() {
        dst.retain(|k, _| {
            !MANAGED_LABEL_PREFIXES.iter().any(|p| k.starts_with(p)) || desired.is_some_and(|d| d.contains_key(k))
        });
    }
    merge_string_map(live, desired);
}

const CONFIG_MAP_FIELDS: &[&[&str]] = &[&["data"], &["binaryData"]];
const SECRET_FIELDS: &[&[&str]] = &[&["data"]];
const SERVICE_FIELDS: &[&[&str]] = &[&["spec", "ports"], &["spec", "selector"]];
const CLUSTER_ROLE_FIELDS: &[&[&str]] = &[&["rules"]];
const CLUSTER_ROLE_BINDING_FIELDS: &[&[&str]] = &[&["subjects"], &["roleRef"]];

/// Payload paths the generator owns for well-known kinds. Everything else on
/// the live object, including server defaults, is left alone.
fn owned_fields(api_version: &str, kind: &str) -> Option<&'static [&'static [&'static str]]> {
    match (api_version, kind) {
        ("v1", "ConfigMap") => Some(CONFIG_MAP_FIELDS),
        ("v1", "Secret") => Some(SECRET_FIELDS),
        ("v1", "Service") => Some(SERVICE_FIELDS),
        ("rbac.authorization.k8s.io/v1", "ClusterRole") => Some(CLUSTER_ROLE_FIELDS),
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => Some(CLUSTER_ROLE_BINDING_FIELDS),
        _ => None,
    }
}

fn lookup<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, seg| cur.get(*seg))
}

/// Set `path` in `live` to `value`, or remove it when `value` is `None`.
fn replace_path(live: &mut Json, path: &[&str], value: Option<&Json>) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if !live.is_object() {
        if value.is_none() {
            return;
        }
        *live = Json::Object(serde_json::Map::new());
    }
    let Some(obj) = live.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                obj.insert(first.to_string(), v.clone());
            }
            None => {
                obj.remove(*first);
            }
        }
        return;
    }
    if value.is_none() && !obj.contains_key(*first) {
        return;
    }
    let child = obj.entry(first.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()));
    replace_path(child, rest, value);
}

/// Merge `desired` into `live`: objects key by key, everything else replaced.
fn merge_json(live: &mut Json, desired: &Json) {
    match (live, desired) {
        (Json::Object(dst), Json::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        dst.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

/// Merge function turning a live object into the state to persist for `desired`.
///
/// Labels and annotations are merged (desired wins, stale operator labels are
/// dropped) and owner references replaced. For kinds listed in
/// [`owned_fields`] only those payload paths are overwritten; other kinds get
/// a recursive merge of the desired payload, so server-defaulted fields such
/// as a Service `clusterIP` or a Route `to.weight` survive.
pub fn mutate_func_for(desired: DynamicObject) -> impl FnOnce(&mut DynamicObject) -> Result<()> + Send {
    move |live: &mut DynamicObject| {
        merge_labels(&mut live.metadata.labels, desired.metadata.labels.as_ref());
        merge_string_map(&mut live.metadata.annotations, desired.metadata.annotations.as_ref());
        if desired.metadata.owner_references.is_some() {
            live.metadata.owner_references = desired.metadata.owner_references.clone();
        }

        if !desired.data.is_object() {
            bail!("desired payload of {} is not an object", desired.name_any());
        }
        let owned = desired.types.as_ref().and_then(|t| owned_fields(&t.api_version, &t.kind));
        match owned {
            Some(paths) => {
                for path in paths {
                    replace_path(&mut live.data, path, lookup(&desired.data, path));
                }
            }
            None => {
                let mut payload = desired.data.clone();
                if let Some(obj) = payload.as_object_mut() {
                    obj.remove("status");
                }
                if !live.data.is_object() {
                    live.data = Json::Object(serde_json::Map::new());
                }
                merge_json(&mut live.data, &payload);
            }
        }
        Ok(())
    }
}

/// Create the object when absent; otherwise apply `mutate` to the live copy and
/// update only when the result differs.
pub async fn create_or_update<F>(store: &dyn StoreClient, obj: DynamicObject, mutate: F) -> Result<OperationResult>
where
    F: FnOnce(&mut DynamicObject) -> Result<()>,
{
    let t0 = Instant::now();
    let key = ObjectKey::for_object(&obj)?;
    let op = match store.get(&key).await {
        Err(e) if e.is_not_found() => {
            let mut obj = obj;
            mutate(&mut obj)?;
            ensure_same_identity(&key, &obj)?;
            store.create(&obj).await.with_context(|| format!("creating {}", key))?;
            OperationResult::Created
        }
        Err(e) => return Err(e).with_context(|| format!("fetching {}", key)),
        Ok(live) => {
            let mut next = live.clone();
            mutate(&mut next)?;
            ensure_same_identity(&key, &next)?;
            let before = strip_noisy(serde_json::to_value(&live)?);
            let after = strip_noisy(serde_json::to_value(&next)?);
            if before == after {
                OperationResult::Unchanged
            } else {
                let summary = diff_summary(&after, &before);
                debug!(key = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updating live object");
                store.update(&next).await.with_context(|| format!("updating {}", key))?;
                OperationResult::Updated
            }
        }
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64, "op" => op.as_str());
    Ok(op)
}

fn ensure_same_identity(key: &ObjectKey, obj: &DynamicObject) -> Result<()> {
    let after = ObjectKey::for_object(obj)?;
    if &after != key {
        bail!("merge function changed object identity from {} to {}", key, after);
    }
    Ok(())
}

/// Outcome of one target object in a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectResult {
    pub kind: String,
    pub name: String,
    pub op: OperationResult,
}

/// Per-object results of a sync pass plus the number of objects that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub applied: Vec<ObjectResult>,
    pub failures: usize,
}

impl SyncReport {
    pub fn count(&self, op: OperationResult) -> usize {
        self.applied.iter().filter(|r| r.op == op).count()
    }
}

/// Sync every object in order, isolating failures to the object that caused them.
///
/// Namespace-scoped objects are stamped with the owner's namespace and a
/// controller reference to `owner`; cluster-scoped objects get neither.
pub async fn sync_all<O>(store: &dyn StoreClient, owner: &O, objects: Vec<DynamicObject>) -> SyncReport
where
    O: Resource<DynamicType = ()>,
{
    let mut report = SyncReport::default();
    let namespace = owner.namespace();
    for mut obj in objects {
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        let name = obj.name_any();
        let gvk = match ObjectKey::for_object(&obj) {
            Ok(key) => key.gvk,
            Err(e) => {
                error!(object_name = %name, object_kind = %kind, error = %e, "failed to identify resource");
                report.failures += 1;
                continue;
            }
        };

        if is_namespace_scoped(&gvk) {
            obj.metadata.namespace = namespace.clone();
            if let Err(e) = set_owner_reference(owner, &mut obj) {
                error!(object_name = %name, object_kind = %kind, error = %e, "failed to set controller owner reference to resource");
                report.failures += 1;
                continue;
            }
        } else {
            obj.metadata.namespace = None;
        }

        let desired = obj.clone();
        match create_or_update(store, obj, mutate_func_for(desired)).await {
            Ok(op) => {
                info!(object_name = %name, object_kind = %kind, op = %op, "resource has been {}", op);
                report.applied.push(ObjectResult { kind, name, op });
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                error!(object_name = %name, object_kind = %kind, error = %format!("{:#}", e), "failed to configure resource");
                report.failures += 1;
            }
        }
    }
    report
}

/// Leaf-level change counts between two payloads, for the update log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    fn walk(&mut self, target: &Json, base: &Json) {
        match (target, base) {
            (Json::Object(t), Json::Object(b)) => {
                for (k, tv) in t {
                    match b.get(k) {
                        Some(bv) if tv != bv => self.walk(tv, bv),
                        Some(_) => {}
                        None => self.adds += 1,
                    }
                }
                self.removes += b.keys().filter(|k| !t.contains_key(*k)).count();
            }
            (Json::Array(t), Json::Array(b)) => {
                self.updates += t.iter().zip(b).filter(|(tv, bv)| tv != bv).count();
                self.adds += t.len().saturating_sub(b.len());
                self.removes += b.len().saturating_sub(t.len());
            }
            (tv, bv) if tv != bv => self.updates += 1,
            _ => {}
        }
    }
}

/// Server-managed metadata and status never count as drift.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub(crate) fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut summary = DiffSummary::default();
    summary.walk(target, base);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(v: Json) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
    }

    #[test]
    fn cluster_rbac_kinds_are_cluster_scoped() {
        assert!(!is_namespace_scoped(&GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole")));
        assert!(!is_namespace_scoped(&GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding")));
        assert!(is_namespace_scoped(&GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "Role")));
        assert!(is_namespace_scoped(&GroupVersionKind::gvk("", "v1", "ConfigMap")));
    }

    #[test]
    fn merge_keeps_server_assigned_cluster_ip() {
        let mut live = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns", "labels": { "extra": "keep" } },
            "spec": { "clusterIP": "10.0.0.7", "ports": [{ "port": 80 }] }
        }));
        let desired = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns", "labels": { "app": "loki" } },
            "spec": { "ports": [{ "port": 3100 }] }
        }));
        mutate_func_for(desired)(&mut live).unwrap();
        assert_eq!(live.data["spec"]["clusterIP"], "10.0.0.7");
        assert_eq!(live.data["spec"]["ports"][0]["port"], 3100);
        let labels = live.metadata.labels.unwrap();
        assert_eq!(labels.get("extra").map(String::as_str), Some("keep"));
        assert_eq!(labels.get("app").map(String::as_str), Some("loki"));
    }

    #[test]
    fn merge_keeps_route_defaults() {
        let mut live = dynamic(serde_json::json!({
            "apiVersion": "route.openshift.io/v1", "kind": "Route",
            "metadata": { "name": "gw", "namespace": "ns" },
            "spec": {
                "host": "old.example.com",
                "to": { "kind": "Service", "name": "gw", "weight": 100 },
                "wildcardPolicy": "None"
            }
        }));
        let desired = dynamic(serde_json::json!({
            "apiVersion": "route.openshift.io/v1", "kind": "Route",
            "metadata": { "name": "gw", "namespace": "ns" },
            "spec": { "host": "new.example.com", "to": { "kind": "Service", "name": "gw" } }
        }));
        mutate_func_for(desired)(&mut live).unwrap();
        assert_eq!(live.data["spec"]["host"], "new.example.com");
        assert_eq!(live.data["spec"]["to"]["weight"], 100);
        assert_eq!(live.data["spec"]["wildcardPolicy"], "None");
    }

    #[test]
    fn stale_operator_labels_are_dropped() {
        let mut live = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {
                "name": "svc", "namespace": "ns",
                "labels": { "loki.grafana.com/service-monitor": "true", "team": "logs", "app": "loki" }
            },
            "spec": { "ports": [{ "port": 3100 }] }
        }));
        let desired = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns", "labels": { "app": "loki" } },
            "spec": { "ports": [{ "port": 3100 }] }
        }));
        mutate_func_for(desired)(&mut live).unwrap();
        let labels = live.metadata.labels.unwrap();
        assert!(!labels.contains_key("loki.grafana.com/service-monitor"));
        assert_eq!(labels.get("team").map(String::as_str), Some("logs"));
    }

    #[test]
    fn cluster_role_binding_replaces_subjects_only() {
        let mut live = dynamic(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
            "metadata": { "name": "b" },
            "roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "b" },
            "subjects": [{ "kind": "ServiceAccount", "name": "old", "namespace": "a" }]
        }));
        let desired = dynamic(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
            "metadata": { "name": "b" },
            "roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "b" },
            "subjects": [{ "kind": "ServiceAccount", "name": "new", "namespace": "a" }]
        }));
        mutate_func_for(desired)(&mut live).unwrap();
        assert_eq!(live.data["subjects"].as_array().unwrap().len(), 1);
        assert_eq!(live.data["subjects"][0]["name"], "new");
    }

    #[test]
    fn merge_replaces_config_map_data() {
        let mut live = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns" },
            "data": { "old": "1" }
        }));
        let desired = dynamic(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns" },
            "data": { "new": "2" }
        }));
        mutate_func_for(desired)(&mut live).unwrap();
        assert_eq!(live.data["data"], serde_json::json!({ "new": "2" }));
    }
}
