//! Controller wiring: one reconciliation per LokiStack event, outcome mapped to
//! status conditions and the next requeue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use lokistack_core::prelude::*;
use lokistack_handlers::{create_or_update_lokistack, status, Context, Outcome};
use metrics::counter;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("lokistack {0} has no namespace")]
    MissingNamespace(String),
    #[error("reconcile failed: {0:#}")]
    Reconcile(anyhow::Error),
}

/// Requeue periods, fixed at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub resync: Duration,
    pub degraded_retry: Duration,
    pub error_backoff: Duration,
}

pub struct State {
    pub ctx: Context,
    pub timings: Timings,
}

/// Next action for a degraded stack: wait for a change unless the condition asks for a retry.
pub fn degraded_action(d: &DegradedError, timings: &Timings) -> Action {
    if d.requeue {
        Action::requeue(timings.degraded_retry)
    } else {
        Action::await_change()
    }
}

pub async fn reconcile(stack: Arc<LokiStack>, state: Arc<State>) -> Result<Action, OperatorError> {
    let req = NamespacedName::of(stack.as_ref()).ok_or_else(|| OperatorError::MissingNamespace(stack.name_any()))?;
    let store = state.ctx.store.as_ref();

    let outcome = create_or_update_lokistack(&state.ctx, &req).await;
    counter!("lokistack_reconcile_total", 1u64, "outcome" => outcome.as_str());
    match outcome {
        Outcome::Success(report) => {
            debug!(stack = %req, applied = report.applied.len(), "stack converged");
            if let Err(e) = status::set_ready_condition(store, &req).await {
                warn!(stack = %req, error = %format!("{:#}", e), "failed to set ready condition");
            }
            Ok(Action::requeue(state.timings.resync))
        }
        Outcome::Degraded(d) => {
            if let Err(e) = status::set_degraded_condition(store, &req, &d.message, d.reason).await {
                warn!(stack = %req, error = %format!("{:#}", e), "failed to set degraded condition");
            }
            Ok(degraded_action(&d, &state.timings))
        }
        Outcome::Error(e) => {
            if let Err(se) = status::set_failed_condition(store, &req, &format!("{:#}", e)).await {
                warn!(stack = %req, error = %format!("{:#}", se), "failed to set failed condition");
            }
            Err(OperatorError::Reconcile(e))
        }
    }
}

pub fn error_policy(stack: Arc<LokiStack>, err: &OperatorError, state: Arc<State>) -> Action {
    warn!(stack = %stack.name_any(), error = %err, "reconcile error; backing off");
    Action::requeue(state.timings.error_backoff)
}

/// Run the controller until a termination signal arrives.
pub async fn run(client: Client, namespace: Option<String>, state: Arc<State>) {
    let stacks: Api<LokiStack> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let (config_maps, services): (Api<ConfigMap>, Api<Service>) = match namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    info!(namespace = namespace.as_deref().unwrap_or("*"), "starting lokistack controller");
    Controller::new(stacks, WatcherConfig::default())
        .owns(config_maps, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(stack = %obj.name, ?action, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;
    info!("lokistack controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> Timings {
        Timings {
            resync: Duration::from_secs(300),
            degraded_retry: Duration::from_secs(30),
            error_backoff: Duration::from_secs(10),
        }
    }

    #[test]
    fn degraded_waits_for_change_unless_requeue_is_set() {
        let mut d = DegradedError::new(DegradedReason::MissingRulerSecret, "Missing ruler remote write authorization secret");
        assert_eq!(degraded_action(&d, &timings()), Action::await_change());
        d.requeue = true;
        assert_eq!(degraded_action(&d, &timings()), Action::requeue(Duration::from_secs(30)));
    }
}
