//! Service syncer
//!
//! Spec flows down, status (load balancer ingress) flows up. Allocations
//! made by the physical API server (cluster IPs, node ports, IP families)
//! are never overwritten with virtual values. A pod selector is narrowed to
//! the instance and virtual namespace so it only picks this tenant's pods.

use k8s_openapi::api::core::v1::Service;
use kube::discovery::ApiResource;
use serde_json::Value;

use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::syncer::RegisteredSyncer;
use crate::translate::{get_path, set_path, FieldPath, NameTranslator, RewriteContext, Translator};

/// Syncer name
pub const NAME: &str = "services";

const HEADLESS: &str = "None";
const CLUSTER_IP: FieldPath = &["spec", "clusterIP"];
const CLUSTER_IPS: FieldPath = &["spec", "clusterIPs"];

fn is_headless(spec: Option<&Value>) -> bool {
    spec.and_then(|s| s.get("clusterIP"))
        .and_then(Value::as_str)
        == Some(HEADLESS)
}

fn port_identity(port: &Value) -> (Option<&Value>, Option<&Value>, Option<&Value>) {
    (port.get("name"), port.get("port"), port.get("protocol"))
}

/// Scope the selector and keep physical allocations: cluster IPs and per-port node ports
fn rewrite(ctx: &RewriteContext<'_>, data: &mut Value) {
    let headless = is_headless(data.get("spec"));

    // an empty selector means manually managed endpoints
    if let Some(selector) = data.pointer_mut("/spec/selector").and_then(Value::as_object_mut) {
        if !selector.is_empty() {
            ctx.scope_selector(selector);
        }
    }

    match ctx.current {
        None => {
            if !headless {
                set_path(data, CLUSTER_IP, None);
                set_path(data, CLUSTER_IPS, None);
            }
            if let Some(ports) = data.pointer_mut("/spec/ports").and_then(Value::as_array_mut) {
                for port in ports {
                    if let Some(port) = port.as_object_mut() {
                        port.remove("nodePort");
                    }
                }
            }
        }
        Some(current) => {
            for path in [CLUSTER_IP, CLUSTER_IPS] {
                set_path(data, path, get_path(current, path).cloned());
            }

            let current_ports: Vec<Value> = current
                .pointer("/spec/ports")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(ports) = data.pointer_mut("/spec/ports").and_then(Value::as_array_mut) {
                for port in ports {
                    let allocated = current_ports
                        .iter()
                        .find(|p| port_identity(p) == port_identity(port))
                        .and_then(|p| p.get("nodePort"))
                        .cloned();
                    if let Some(port) = port.as_object_mut() {
                        match allocated {
                            Some(node_port) => {
                                port.insert("nodePort".to_string(), node_port);
                            }
                            None => {
                                port.remove("nodePort");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Translation rules for Services
pub fn translator(names: NameTranslator) -> Result<Translator> {
    Translator::builder(NAME, ApiResource::erase::<Service>(&()), names)
        .spec(&["spec"])
        .status(&["status"])
        .server_owned(&["spec", "ipFamilies"])
        .server_owned(&["spec", "ipFamilyPolicy"])
        .server_owned(&["spec", "healthCheckNodePort"])
        .rewrite(rewrite)
        .build()
}

/// Build the Service syncer
pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
    let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
    Ok(GenericSyncer::register(ctx, translator(names)?))
}
