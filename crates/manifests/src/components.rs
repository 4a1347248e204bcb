use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::{DynamicObject, ObjectMeta};
use lokistack_kubehub::to_dynamic;

use anyhow::Result;

use crate::{component_labels, Options};

pub const HTTP_PORT: i32 = 3100;
pub const GRPC_PORT: i32 = 9095;
pub const GATEWAY_HTTP_PORT: i32 = 8080;

/// Label picked up by the ServiceMonitor selecting stack services.
pub const LABEL_SERVICE_MONITOR: &str = "loki.grafana.com/service-monitor";

const CORE_COMPONENTS: [&str; 6] = ["distributor", "ingester", "querier", "query-frontend", "compactor", "index-gateway"];

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: number,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(number)),
        ..Default::default()
    }
}

fn service(opts: &Options, component: &str, ports: Vec<ServicePort>) -> Result<DynamicObject> {
    let selector = component_labels(&opts.name, component);
    let mut labels = selector.clone();
    if opts.flags.enable_service_monitors {
        labels.insert(LABEL_SERVICE_MONITOR.to_string(), "true".to_string());
    }
    let svc = Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", opts.name, component)),
            namespace: Some(opts.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec { selector: Some(selector), ports: Some(ports), ..Default::default() }),
        ..Default::default()
    };
    Ok(to_dynamic(&svc)?)
}

/// One service per running component, in a fixed order.
pub(crate) fn build_services(opts: &Options) -> Result<Vec<DynamicObject>> {
    let mut components: Vec<&str> = CORE_COMPONENTS.to_vec();
    if opts.rules_enabled() {
        components.push("ruler");
    }
    let mut out = components
        .into_iter()
        .map(|c| service(opts, c, vec![port("http", HTTP_PORT), port("grpc", GRPC_PORT)]))
        .collect::<Result<Vec<_>>>()?;
    if opts.flags.enable_gateway {
        out.push(service(opts, "gateway", vec![port("public", GATEWAY_HTTP_PORT)])?);
    }
    Ok(out)
}
