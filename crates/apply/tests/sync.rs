#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::core::DynamicObject;
use lokistack_apply::{create_or_update, mutate_func_for, sync_all, OperationResult};
use lokistack_core::{LokiStack, LokiStackSpec};
use lokistack_kubehub::{ObjectKey, StoreClient};
use lokistack_store::{MemoryStore, WriteKind};

fn stack(store: &MemoryStore) -> LokiStack {
    let mut s = LokiStack::new("dev", LokiStackSpec::default());
    s.metadata.namespace = Some("obs".into());
    let seeded = store.insert(&s).unwrap();
    s.metadata.uid = seeded.metadata.uid;
    s
}

fn config_map(name: &str, value: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name },
        "data": { "value": value }
    }))
    .unwrap()
}

fn cluster_role(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": { "name": name },
        "rules": [{ "apiGroups": ["authentication.k8s.io"], "resources": ["tokenreviews"], "verbs": ["create"] }]
    }))
    .unwrap()
}

#[tokio::test]
async fn failed_object_does_not_stop_the_batch() {
    let store = MemoryStore::new();
    let owner = stack(&store);
    store.fail_writes_named("b");

    let objects = vec![config_map("a", "1"), config_map("b", "2"), config_map("c", "3")];
    let report = sync_all(&store, &owner, objects).await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.count(OperationResult::Created), 2);
    let created: Vec<_> = store.writes(WriteKind::Created).into_iter().map(|k| k.name).collect();
    assert_eq!(created, vec!["a", "c"]);
}

#[tokio::test]
async fn scope_decides_namespace_and_owner_reference() {
    let store = MemoryStore::new();
    let owner = stack(&store);
    let report = sync_all(&store, &owner, vec![config_map("cfg", "1"), cluster_role("obs-dev-gateway")]).await;
    assert_eq!(report.failures, 0);

    let cm = store.peek(&ObjectKey::of::<ConfigMap>(Some("obs"), "cfg")).unwrap();
    let refs = cm.metadata.owner_references.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].kind, "LokiStack");
    assert_eq!(refs[0].controller, Some(true));

    let cr = store
        .peek(&ObjectKey::of::<ClusterRole>(None, "obs-dev-gateway"))
        .unwrap();
    assert!(cr.metadata.namespace.is_none());
    assert!(cr.metadata.owner_references.is_none());
}

#[tokio::test]
async fn owner_without_uid_fails_only_namespaced_objects() {
    let store = MemoryStore::new();
    let mut owner = LokiStack::new("dev", LokiStackSpec::default());
    owner.metadata.namespace = Some("obs".into());

    let report = sync_all(&store, &owner, vec![config_map("cfg", "1"), cluster_role("obs-dev-gateway")]).await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].kind, "ClusterRole");
}

#[tokio::test]
async fn second_pass_is_unchanged() {
    let store = MemoryStore::new();
    let owner = stack(&store);
    let objects = vec![config_map("a", "1"), cluster_role("r")];

    let first = sync_all(&store, &owner, objects.clone()).await;
    assert_eq!(first.count(OperationResult::Created), 2);
    store.clear_journal();

    let second = sync_all(&store, &owner, objects).await;
    assert_eq!(second.count(OperationResult::Unchanged), 2);
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn changed_payload_is_updated() {
    let store = MemoryStore::new();
    let mut obj = config_map("a", "1");
    obj.metadata.namespace = Some("obs".into());
    let op = create_or_update(&store, obj.clone(), mutate_func_for(obj)).await.unwrap();
    assert_eq!(op, OperationResult::Created);

    let mut changed = config_map("a", "2");
    changed.metadata.namespace = Some("obs".into());
    let op = create_or_update(&store, changed.clone(), mutate_func_for(changed)).await.unwrap();
    assert_eq!(op, OperationResult::Updated);

    let live = store.get(&ObjectKey::of::<ConfigMap>(Some("obs"), "a")).await.unwrap();
    assert_eq!(live.data["data"]["value"], "2");
}

fn service(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": "obs", "labels": { "app": "loki" } },
        "spec": {
            "selector": { "app": "loki" },
            "ports": [{ "name": "http", "port": 3100, "protocol": "TCP", "targetPort": 3100 }]
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn server_defaults_on_services_are_kept() {
    let store = MemoryStore::new();
    let desired = service("dev-querier");
    let op = create_or_update(&store, desired.clone(), mutate_func_for(desired.clone())).await.unwrap();
    assert_eq!(op, OperationResult::Created);

    // What the API server fills in after admission.
    let key = ObjectKey::of::<Service>(Some("obs"), "dev-querier");
    let mut live = store.get(&key).await.unwrap();
    let spec = live.data["spec"].as_object_mut().unwrap();
    spec.insert("type".into(), "ClusterIP".into());
    spec.insert("sessionAffinity".into(), "None".into());
    spec.insert("clusterIP".into(), "10.0.0.7".into());
    spec.insert("ipFamilies".into(), serde_json::json!(["IPv4"]));
    spec.insert("ipFamilyPolicy".into(), "SingleStack".into());
    spec.insert("internalTrafficPolicy".into(), "Cluster".into());
    store.update(&live).await.unwrap();
    store.clear_journal();

    for _ in 0..3 {
        let op = create_or_update(&store, desired.clone(), mutate_func_for(desired.clone())).await.unwrap();
        assert_eq!(op, OperationResult::Unchanged);
    }
    assert!(store.journal().is_empty());

    let mut changed = desired.clone();
    changed.data["spec"]["ports"][0]["port"] = 3101.into();
    let op = create_or_update(&store, changed.clone(), mutate_func_for(changed)).await.unwrap();
    assert_eq!(op, OperationResult::Updated);
    let live = store.get(&key).await.unwrap();
    assert_eq!(live.data["spec"]["ports"][0]["port"], 3101);
    assert_eq!(live.data["spec"]["type"], "ClusterIP");
    assert_eq!(live.data["spec"]["clusterIP"], "10.0.0.7");
    assert_eq!(live.data["spec"]["ipFamilies"][0], "IPv4");
}
