//! Deployment metrics of reconciled stacks.

use lokistack_core::stack::LokiStackSpec;
use metrics::gauge;
use tracing::debug;

/// Sink called once per successful reconciliation of a non-development stack.
pub trait StackCollector: Send + Sync {
    fn collect(&self, spec: &LokiStackSpec, stack_name: &str);
}

/// Publishes stack shape gauges through the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl StackCollector for MetricsCollector {
    fn collect(&self, spec: &LokiStackSpec, stack_name: &str) {
        let stack_id = stack_name.to_string();
        gauge!("lokistack_deployment_metrics", 1.0, "stack_id" => stack_id.clone(), "size" => spec.size.as_str());
        gauge!(
            "lokistack_replication_factor",
            f64::from(spec.replication_factor.unwrap_or(1)),
            "stack_id" => stack_id.clone()
        );

        let mode = spec.tenants.as_ref().map(|t| t.mode.as_str()).unwrap_or("none");
        gauge!("lokistack_tenancy_mode", 1.0, "stack_id" => stack_id.clone(), "mode" => mode);

        let rules = spec.rules.as_ref().map(|r| r.enabled).unwrap_or(false);
        gauge!("lokistack_rules_enabled", if rules { 1.0 } else { 0.0 }, "stack_id" => stack_id);
        debug!(stack = stack_name, size = spec.size.as_str(), mode, rules, "collected stack metrics");
    }
}
