use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::{Error, Result, FAKE_NODE_LABEL, MIRRORED_NODE_LABEL};

use super::{node_resource, NodeSelector, NAME};
use crate::context::RegisterContext;
use crate::object::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::queue::ReconcileAction;
use crate::syncer::{RegisteredSyncer, Syncer};

/// Mirrors physical nodes matching a selector into the virtual cluster.
///
/// Only labels and status are mirrored; node names are kept. Virtual nodes
/// carrying neither the mirrored nor the fake marker are never touched.
pub struct NodeSyncer {
    selector: NodeSelector,
    virtual_nodes: Arc<dyn ObjectClient>,
    physical_nodes: Arc<dyn ObjectClient>,
}

impl NodeSyncer {
    /// Syncer over explicit clients
    pub fn new(
        selector: NodeSelector,
        virtual_nodes: Arc<dyn ObjectClient>,
        physical_nodes: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            selector,
            virtual_nodes,
            physical_nodes,
        }
    }

    /// Build the node syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let selector = match &ctx.options.node_selector {
            Some(s) => s.parse()?,
            None => NodeSelector::default(),
        };
        let syncer = Self::new(
            selector,
            Arc::new(KubeObjectClient::new(ctx.virtual_manager.clone(), node_resource(), None)),
            Arc::new(KubeObjectClient::new(ctx.physical_manager.clone(), node_resource(), None)),
        );
        Ok(RegisteredSyncer::real(Arc::new(syncer)))
    }

    fn desired_labels(pnode: &DynamicObject) -> BTreeMap<String, String> {
        let mut labels = pnode.labels().clone();
        labels.remove(FAKE_NODE_LABEL);
        labels.insert(MIRRORED_NODE_LABEL.to_string(), "true".to_string());
        labels
    }

    async fn mirror_status(&self, vnode: DynamicObject, pnode: &DynamicObject) -> Result<()> {
        let Some(status) = pnode.data.get("status").cloned() else {
            return Ok(());
        };
        if vnode.data.get("status") == Some(&status) {
            return Ok(());
        }
        let mut updated = vnode;
        updated.data["status"] = status;
        self.virtual_nodes.replace_status(&updated).await?;
        record_write(NAME, ClusterSide::Virtual, "update_status");
        Ok(())
    }
}

#[async_trait]
impl Syncer for NodeSyncer {
    fn name(&self) -> &str {
        NAME
    }

    fn virtual_resource(&self) -> ApiResource {
        node_resource()
    }

    fn physical_resource(&self) -> ApiResource {
        node_resource()
    }

    fn physical_namespace(&self) -> Option<String> {
        None
    }

    fn virtual_keys_for_physical(&self, pobj: &DynamicObject) -> Vec<ObjectKey> {
        vec![ObjectKey::cluster(pobj.name_any())]
    }

    #[instrument(skip(self), fields(syncer = NAME))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let pnode = self
            .physical_nodes
            .get(key)
            .await?
            .filter(|p| p.metadata.deletion_timestamp.is_none() && self.selector.matches(p.labels()));
        let vnode = self.virtual_nodes.get(key).await?;

        match (pnode, vnode) {
            (None, None) => {}
            (None, Some(vnode)) => {
                if vnode.labels().contains_key(MIRRORED_NODE_LABEL) {
                    self.virtual_nodes.delete(&vnode).await?;
                    record_write(NAME, ClusterSide::Virtual, "delete");
                    info!(node = %key, "removed mirrored node");
                }
            }
            (Some(pnode), None) => {
                let mut vnode = DynamicObject::new(&key.name, &node_resource());
                vnode.metadata.labels = Some(Self::desired_labels(&pnode));
                let created = self.virtual_nodes.create(&vnode).await?;
                record_write(NAME, ClusterSide::Virtual, "create");
                info!(node = %key, "mirrored physical node");
                self.mirror_status(created, &pnode).await?;
            }
            (Some(pnode), Some(vnode)) => {
                let labels = vnode.labels();
                if !labels.contains_key(MIRRORED_NODE_LABEL) && !labels.contains_key(FAKE_NODE_LABEL) {
                    return Err(Error::ownership(
                        format!("Node {key}"),
                        "virtual node exists and was not created by vkube",
                    ));
                }
                let desired = Self::desired_labels(&pnode);
                let vnode = if labels != &desired {
                    let mut updated = vnode.clone();
                    updated.metadata.labels = Some(desired);
                    let replaced = self.virtual_nodes.replace(&updated).await?;
                    record_write(NAME, ClusterSide::Virtual, "update");
                    debug!(node = %key, "updated mirrored node labels");
                    replaced
                } else {
                    vnode
                };
                self.mirror_status(vnode, &pnode).await?;
            }
        }
        Ok(ReconcileAction::AwaitChange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MockObjectClient;
    use serde_json::json;

    fn node(name: &str, labels: &[(&str, &str)], status: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &node_resource()).data(json!({ "status": status }));
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj
    }

    fn syncer(selector: &str, v: MockObjectClient, p: MockObjectClient) -> NodeSyncer {
        NodeSyncer::new(selector.parse().unwrap(), Arc::new(v), Arc::new(p))
    }

    #[tokio::test]
    async fn story_matching_physical_node_is_mirrored_with_status() {
        let mut p = MockObjectClient::new();
        p.expect_get()
            .returning(|_| Ok(Some(node("worker-1", &[("pool", "tenants")], json!({ "phase": "Running" })))));

        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(None));
        v.expect_create()
            .withf(|obj: &DynamicObject| {
                obj.labels().get(MIRRORED_NODE_LABEL).map(String::as_str) == Some("true")
                    && obj.labels().get("pool").map(String::as_str) == Some("tenants")
            })
            .times(1)
            .returning(|obj| Ok(obj.clone()));
        v.expect_replace_status()
            .withf(|obj: &DynamicObject| obj.data["status"]["phase"] == "Running")
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        syncer("pool=tenants", v, p)
            .reconcile(&ObjectKey::cluster("worker-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_node_leaving_the_selector_is_removed_virtually() {
        let mut p = MockObjectClient::new();
        p.expect_get()
            .returning(|_| Ok(Some(node("worker-1", &[("pool", "system")], json!({})))));

        let mut v = MockObjectClient::new();
        v.expect_get()
            .returning(|_| Ok(Some(node("worker-1", &[(MIRRORED_NODE_LABEL, "true")], json!({})))));
        v.expect_delete().times(1).returning(|_| Ok(()));

        syncer("pool=tenants", v, p)
            .reconcile(&ObjectKey::cluster("worker-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_foreign_virtual_node_is_an_ownership_error() {
        let mut p = MockObjectClient::new();
        p.expect_get().returning(|_| Ok(Some(node("worker-1", &[], json!({})))));

        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(node("worker-1", &[], json!({})))));
        v.expect_replace().never();
        v.expect_delete().never();

        let err = syncer("", v, p)
            .reconcile(&ObjectKey::cluster("worker-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
    }

    #[tokio::test]
    async fn test_fake_node_is_adopted_when_physical_node_appears() {
        let mut p = MockObjectClient::new();
        p.expect_get().returning(|_| Ok(Some(node("worker-1", &[], json!({ "phase": "Running" })))));

        let mut v = MockObjectClient::new();
        v.expect_get()
            .returning(|_| Ok(Some(node("worker-1", &[(FAKE_NODE_LABEL, "true")], json!({})))));
        v.expect_replace()
            .withf(|obj: &DynamicObject| {
                !obj.labels().contains_key(FAKE_NODE_LABEL) && obj.labels().contains_key(MIRRORED_NODE_LABEL)
            })
            .times(1)
            .returning(|obj| Ok(obj.clone()));
        v.expect_replace_status().times(1).returning(|obj| Ok(obj.clone()));

        syncer("", v, p)
            .reconcile(&ObjectKey::cluster("worker-1"))
            .await
            .unwrap();
    }
}
