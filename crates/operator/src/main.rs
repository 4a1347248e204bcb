#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand};
use kube::CustomResourceExt;
use lokistack_core::openshift::DNS;
use lokistack_core::prelude::*;
use lokistack_handlers::Context;
use lokistack_kubehub::KubeStore;
use lokistack_manifests::Images;
use tracing::info;

mod controller;

#[derive(Parser, Debug)]
#[command(name = "lokistack-operator", version, about = "LokiStack operator")]
struct Cli {
    /// Deploy the multi-tenant gateway in front of every stack
    #[arg(long, env = "LOKI_OPERATOR_ENABLE_GATEWAY", action = ArgAction::SetTrue)]
    enable_gateway: bool,

    /// Expose the gateway through an OpenShift route
    #[arg(long, env = "LOKI_OPERATOR_ENABLE_GATEWAY_ROUTE", action = ArgAction::SetTrue)]
    enable_gateway_route: bool,

    /// Label services for ServiceMonitor discovery
    #[arg(long, env = "LOKI_OPERATOR_ENABLE_SERVICE_MONITORS", action = ArgAction::SetTrue)]
    enable_service_monitors: bool,

    /// Only watch stacks in this namespace (default: all namespaces)
    #[arg(long = "ns", env = "LOKI_OPERATOR_WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between resyncs of a converged stack
    #[arg(long, env = "LOKI_OPERATOR_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Seconds before retrying a degraded stack that asked for a retry
    #[arg(long, env = "LOKI_OPERATOR_DEGRADED_RETRY_SECS", default_value_t = 30)]
    degraded_retry_secs: u64,

    /// Seconds to back off after a failed reconciliation
    #[arg(long, env = "LOKI_OPERATOR_ERROR_BACKOFF_SECS", default_value_t = 10)]
    error_backoff_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default)
    Run,
    /// Print the custom resource definitions the operator serves
    Crds,
}

impl Cli {
    fn flags(&self) -> FeatureFlags {
        FeatureFlags {
            enable_gateway: self.enable_gateway,
            enable_gateway_route: self.enable_gateway_route,
            enable_service_monitors: self.enable_service_monitors,
        }
    }

    fn timings(&self) -> controller::Timings {
        controller::Timings {
            resync: Duration::from_secs(self.resync_secs),
            degraded_retry: Duration::from_secs(self.degraded_retry_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("LOKI_OPERATOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOKI_OPERATOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LOKI_OPERATOR_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_crds() -> Result<()> {
    let crds = [LokiStack::crd(), AlertingRule::crd(), RecordingRule::crd(), RulerConfig::crd(), DNS::crd()];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).context("rendering crd")?);
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(Commands::Crds) = cli.command {
        return print_crds();
    }

    init_metrics();
    let images = Images::from_env();
    let flags = cli.flags();
    info!(loki = %images.loki, gateway = %images.gateway, ?flags, "starting lokistack operator");

    let client = kube::Client::try_default().await.context("building kube client")?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let state = Arc::new(controller::State { ctx: Context::new(store, images, flags), timings: cli.timings() });
    controller::run(client, cli.namespace.clone(), state).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_off_and_parse_from_args() {
        let cli = Cli::parse_from(["lokistack-operator"]);
        assert_eq!(cli.flags(), FeatureFlags::default());
        assert_eq!(cli.timings().resync, Duration::from_secs(300));

        let cli = Cli::parse_from(["lokistack-operator", "--enable-gateway", "--ns", "logging", "crds"]);
        assert!(cli.flags().enable_gateway);
        assert_eq!(cli.namespace.as_deref(), Some("logging"));
        assert!(matches!(cli.command, Some(Commands::Crds)));
    }
}
