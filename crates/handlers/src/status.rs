//! Stack status writes: applied storage schemas and the condition set.

use anyhow::{Context as _, Result};
use chrono::{SecondsFormat, Utc};
use lokistack_core::prelude::*;
use lokistack_core::stack::StackCondition;
use lokistack_kubehub::{get_as, ObjectKey, StoreClient};
use serde_json::json;
use tracing::debug;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PENDING: &str = "Pending";
pub const CONDITION_FAILED: &str = "Failed";
pub const CONDITION_DEGRADED: &str = "Degraded";

pub const REASON_READY_COMPONENTS: &str = "ReadyComponents";
pub const REASON_FAILED_COMPONENTS: &str = "FailedComponents";

fn stack_key(req: &NamespacedName) -> ObjectKey {
    ObjectKey::of::<LokiStack>(Some(&req.namespace), &req.name)
}

/// Record the schemas the components are about to be configured with.
pub async fn set_storage_schema_status(
    store: &dyn StoreClient,
    req: &NamespacedName,
    schemas: &[ObjectStorageSchema],
) -> Result<()> {
    store
        .patch_status(&stack_key(req), json!({ "storage": { "schemas": schemas } }))
        .await
        .with_context(|| format!("failed to update storage schema status of {}", req))
}

pub async fn set_ready_condition(store: &dyn StoreClient, req: &NamespacedName) -> Result<()> {
    set_condition(store, req, condition(CONDITION_READY, REASON_READY_COMPONENTS, "All components ready")).await
}

pub async fn set_degraded_condition(
    store: &dyn StoreClient,
    req: &NamespacedName,
    message: &str,
    reason: DegradedReason,
) -> Result<()> {
    set_condition(store, req, condition(CONDITION_DEGRADED, reason.as_str(), message)).await
}

pub async fn set_failed_condition(store: &dyn StoreClient, req: &NamespacedName, message: &str) -> Result<()> {
    set_condition(store, req, condition(CONDITION_FAILED, REASON_FAILED_COMPONENTS, message)).await
}

fn condition(kind: &str, reason: &str, message: &str) -> StackCondition {
    StackCondition {
        r#type: kind.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: None,
    }
}

async fn set_condition(store: &dyn StoreClient, req: &NamespacedName, next: StackCondition) -> Result<()> {
    let stack: LokiStack = match get_as(store, Some(&req.namespace), &req.name).await {
        Ok(stack) => stack,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("failed to lookup lokistack {}", req)),
    };
    let mut conditions = stack.status.map(|s| s.conditions).unwrap_or_default();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    if !upsert_condition(&mut conditions, next, &now) {
        debug!(stack = %req, "conditions unchanged");
        return Ok(());
    }
    store
        .patch_status(&stack_key(req), json!({ "conditions": conditions }))
        .await
        .with_context(|| format!("failed to update conditions of {}", req))
}

/// Make `next` the only true condition. Returns false when it already is.
pub fn upsert_condition(conditions: &mut Vec<StackCondition>, mut next: StackCondition, now: &str) -> bool {
    let current = conditions.iter().any(|c| {
        c.r#type == next.r#type && c.status == next.status && c.reason == next.reason && c.message == next.message
    });
    let others_true = conditions.iter().any(|c| c.r#type != next.r#type && c.status == "True");
    if current && !others_true {
        return false;
    }

    for c in conditions.iter_mut().filter(|c| c.r#type != next.r#type && c.status == "True") {
        c.status = "False".to_string();
        c.last_transition_time = Some(now.to_string());
    }
    if current {
        return true;
    }
    next.last_transition_time = Some(now.to_string());
    match conditions.iter_mut().find(|c| c.r#type == next.r#type) {
        Some(c) => *c = next,
        None => conditions.push(next),
    }
    true
}
