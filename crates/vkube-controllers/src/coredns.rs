//! Keeps the CoreDNS `NodeHosts` entry in sync with the virtual nodes

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use vkube_common::retry::{retry_on_conflict, RetryConfig};
use vkube_common::Result;
use vkube_syncer::manager::WATCH_TIMEOUT_SECS;
use vkube_syncer::RegisterContext;

use crate::runner::{error_policy, ignore_not_found, log_reconcile_result, until_cancelled};

/// Runnable name
pub const NAME: &str = "coredns-nodehosts";

const NAMESPACE: &str = "kube-system";
const CONFIGMAP: &str = "coredns";
const NODE_HOSTS_KEY: &str = "NodeHosts";

/// Sorted `"{InternalIP} {name}"` lines; nodes without an internal address are skipped
pub fn compile_node_hosts(nodes: &[Node]) -> String {
    let mut lines: Vec<String> = nodes
        .iter()
        .filter_map(|node| {
            let ip = node
                .status
                .as_ref()?
                .addresses
                .as_ref()?
                .iter()
                .find(|a| a.type_ == "InternalIP")?
                .address
                .clone();
            Some(format!("{ip} {}", node.name_any()))
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

struct Context {
    client: Client,
}

/// Patch `hosts` into a freshly read ConfigMap, pinned to its resourceVersion.
///
/// Returns whether a write happened.
async fn try_write_node_hosts(api: &Api<ConfigMap>, hosts: &str) -> Result<bool> {
    let Some(cm) = api.get_opt(CONFIGMAP).await? else {
        return Ok(false);
    };
    if cm.data.as_ref().and_then(|d| d.get(NODE_HOSTS_KEY)).map(String::as_str) == Some(hosts) {
        return Ok(false);
    }
    let patch = json!({
        "metadata": { "resourceVersion": cm.resource_version() },
        "data": { NODE_HOSTS_KEY: hosts },
    });
    ignore_not_found(
        api.patch(CONFIGMAP, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Into::into),
    )?;
    Ok(true)
}

#[instrument(skip(cm, ctx))]
async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let hosts = compile_node_hosts(&nodes.list(&ListParams::default()).await?.items);

    let current = cm.data.as_ref().and_then(|d| d.get(NODE_HOSTS_KEY));
    if current == Some(&hosts) {
        debug!("NodeHosts up to date");
        return Ok(Action::await_change());
    }

    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), NAMESPACE);
    let config = RetryConfig::with_max_attempts(5);
    if retry_on_conflict(&config, NAME, || try_write_node_hosts(&api, &hosts)).await? {
        info!(entries = hosts.lines().count(), "updated CoreDNS NodeHosts");
    }
    Ok(Action::await_change())
}

/// Add the NodeHosts controller to the virtual manager
pub fn register(ctx: &RegisterContext) -> Result<()> {
    let client = ctx.virtual_manager.client();
    let controller = Controller::new(
        Api::<ConfigMap>::namespaced(client.clone(), NAMESPACE),
        WatcherConfig::default()
            .fields(&format!("metadata.name={CONFIGMAP}"))
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        Api::<Node>::all(client.clone()),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        |_node| Some(ObjectRef::<ConfigMap>::new(CONFIGMAP).within(NAMESPACE)),
    )
    .run(reconcile, error_policy, Arc::new(Context { client }))
    .for_each(log_reconcile_result("CoreDNS"));

    ctx.virtual_manager
        .add_runnable(NAME, until_cancelled(controller, ctx.cancel.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;

    fn node(name: &str, addresses: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn story_node_hosts_are_sorted_internal_addresses() {
        let nodes = vec![
            node("worker-2", &[("Hostname", "worker-2"), ("InternalIP", "10.0.0.12")]),
            node("worker-1", &[("ExternalIP", "34.1.1.1"), ("InternalIP", "10.0.0.11")]),
        ];
        assert_eq!(compile_node_hosts(&nodes), "10.0.0.11 worker-1\n10.0.0.12 worker-2");
    }

    #[test]
    fn test_nodes_without_internal_ip_are_skipped() {
        let nodes = vec![
            node("fake", &[]),
            Node::default(),
            node("worker-1", &[("InternalIP", "10.0.0.11")]),
        ];
        assert_eq!(compile_node_hosts(&nodes), "10.0.0.11 worker-1");
        assert_eq!(compile_node_hosts(&[]), "");
    }
}
