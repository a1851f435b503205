use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::{Result, FAKE_NODE_LABEL};

use super::quantity::{format_quantity, parse_quantity};
use super::{node_resource, FAKE_NAME};
use crate::context::RegisterContext;
use crate::index::IndexSpec;
use crate::object::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::queue::ReconcileAction;
use crate::syncer::{FakeSyncer, FakeTrigger, IndicesRegisterer, RegisteredSyncer};

/// Virtual pod index from `spec.nodeName` to pods
pub const POD_NODE_NAME_INDEX: &str = "fake-nodes/spec.nodeName";

/// Refresh interval for synthesized capacity
pub const CAPACITY_REFRESH: Duration = Duration::from_secs(60);

/// Aggregated resources and whether each renders with binary suffixes
const AGGREGATED_RESOURCES: &[(&str, bool)] = &[
    ("cpu", false),
    ("ephemeral-storage", true),
    ("memory", true),
    ("pods", false),
];

/// Status keys owned by the fake node syncer
const SYNTHESIZED_STATUS_KEYS: &[&str] = &["allocatable", "capacity", "conditions", "nodeInfo"];

fn pod_node_name(pod: &DynamicObject) -> Option<String> {
    pod.data
        .pointer("/spec/nodeName")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// Sum of allocatable cpu, memory, pods and ephemeral-storage across nodes.
///
/// Unparseable quantities are skipped with a warning.
pub fn aggregate_capacity(nodes: &[DynamicObject]) -> BTreeMap<String, String> {
    let mut totals: BTreeMap<&str, i128> = AGGREGATED_RESOURCES.iter().map(|(r, _)| (*r, 0)).collect();
    for node in nodes {
        let Some(allocatable) = node.data.pointer("/status/allocatable") else {
            continue;
        };
        for (resource, _) in AGGREGATED_RESOURCES {
            let Some(raw) = allocatable.get(*resource).and_then(Value::as_str) else {
                continue;
            };
            match parse_quantity(raw) {
                Ok(v) => *totals.entry(*resource).or_default() += v,
                Err(e) => warn!(node = %node.name_any(), resource = *resource, error = %e, "skipping allocatable quantity"),
            }
        }
    }
    AGGREGATED_RESOURCES
        .iter()
        .map(|(r, binary)| (r.to_string(), format_quantity(totals[r], *binary)))
        .collect()
}

/// Deterministic placeholder node: identical inputs yield identical JSON
pub fn synthesize_node(name: &str, capacity: &BTreeMap<String, String>) -> DynamicObject {
    let mut node = DynamicObject::new(name, &node_resource()).data(json!({
        "spec": {},
        "status": {
            "allocatable": capacity,
            "capacity": capacity,
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "reason": "KubeletReady",
                "message": "kubelet is posting ready status"
            }],
            "nodeInfo": {
                "architecture": "amd64",
                "operatingSystem": "linux"
            }
        }
    }));
    node.metadata.labels = Some(BTreeMap::from([
        (FAKE_NODE_LABEL.to_string(), "true".to_string()),
        ("kubernetes.io/arch".to_string(), "amd64".to_string()),
        ("kubernetes.io/hostname".to_string(), name.to_string()),
        ("kubernetes.io/os".to_string(), "linux".to_string()),
    ]));
    node
}

/// Synthesizes a Ready node for every node name virtual pods are bound to
pub struct FakeNodeSyncer {
    virtual_nodes: Arc<dyn ObjectClient>,
    virtual_pods: Arc<dyn ObjectClient>,
    physical_nodes: Arc<dyn ObjectClient>,
}

impl FakeNodeSyncer {
    /// Syncer over explicit clients
    pub fn new(
        virtual_nodes: Arc<dyn ObjectClient>,
        virtual_pods: Arc<dyn ObjectClient>,
        physical_nodes: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            virtual_nodes,
            virtual_pods,
            physical_nodes,
        }
    }

    /// Build the fake node syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let syncer = Arc::new(Self::new(
            Arc::new(KubeObjectClient::new(ctx.virtual_manager.clone(), node_resource(), None)),
            Arc::new(KubeObjectClient::new(
                ctx.virtual_manager.clone(),
                ApiResource::erase::<Pod>(&()),
                None,
            )),
            Arc::new(KubeObjectClient::new(ctx.physical_manager.clone(), node_resource(), None)),
        ));
        Ok(RegisteredSyncer::fake(syncer.clone()).with_indices(syncer))
    }

    fn status_diverges(current: &DynamicObject, desired: &DynamicObject) -> bool {
        SYNTHESIZED_STATUS_KEYS.iter().any(|k| {
            current.data.pointer(&format!("/status/{k}")) != desired.data.pointer(&format!("/status/{k}"))
        })
    }

    async fn write_status(&self, mut current: DynamicObject, desired: &DynamicObject) -> Result<()> {
        if !Self::status_diverges(&current, desired) {
            return Ok(());
        }
        for k in SYNTHESIZED_STATUS_KEYS {
            current.data["status"][*k] = desired.data["status"][*k].clone();
        }
        self.virtual_nodes.replace_status(&current).await?;
        record_write(FAKE_NAME, ClusterSide::Virtual, "update_status");
        Ok(())
    }
}

#[async_trait]
impl FakeSyncer for FakeNodeSyncer {
    fn name(&self) -> &str {
        FAKE_NAME
    }

    fn virtual_resource(&self) -> ApiResource {
        node_resource()
    }

    fn triggers(&self) -> Vec<FakeTrigger> {
        vec![FakeTrigger {
            resource: ApiResource::erase::<Pod>(&()),
            map: Arc::new(|pod: &DynamicObject| {
                pod_node_name(pod).map(ObjectKey::cluster).into_iter().collect()
            }),
        }]
    }

    #[instrument(skip(self), fields(syncer = FAKE_NAME))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let pods = self.virtual_pods.lookup(POD_NODE_NAME_INDEX, &key.name);
        let vnode = self.virtual_nodes.get(key).await?;
        let is_fake = |n: &DynamicObject| n.labels().get(FAKE_NODE_LABEL).is_some_and(|v| v == "true");

        if pods.is_empty() {
            if let Some(vnode) = vnode.filter(is_fake) {
                self.virtual_nodes.delete(&vnode).await?;
                record_write(FAKE_NAME, ClusterSide::Virtual, "delete");
                info!(node = %key, "removed unused fake node");
            }
            return Ok(ReconcileAction::AwaitChange);
        }

        let capacity = aggregate_capacity(&self.physical_nodes.list().await?);
        let desired = synthesize_node(&key.name, &capacity);

        match vnode {
            None => {
                let created = self.virtual_nodes.create(&desired).await?;
                record_write(FAKE_NAME, ClusterSide::Virtual, "create");
                info!(node = %key, pods = pods.len(), "created fake node");
                self.write_status(created, &desired).await?;
            }
            Some(vnode) if is_fake(&vnode) => self.write_status(vnode, &desired).await?,
            Some(_) => debug!(node = %key, "virtual node is not fake, leaving it alone"),
        }
        Ok(ReconcileAction::RequeueAfter(CAPACITY_REFRESH))
    }
}

impl IndicesRegisterer for FakeNodeSyncer {
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()> {
        ctx.virtual_manager.register_index(IndexSpec::new(
            POD_NODE_NAME_INDEX,
            ApiResource::erase::<Pod>(&()),
            None,
            Arc::new(|pod: &DynamicObject| pod_node_name(pod).into_iter().collect()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MockObjectClient;

    fn physical_node(name: &str, cpu: &str, memory: &str) -> DynamicObject {
        DynamicObject::new(name, &node_resource()).data(json!({
            "status": { "allocatable": { "cpu": cpu, "memory": memory, "pods": "110" } }
        }))
    }

    fn cluster() -> Vec<DynamicObject> {
        vec![
            physical_node("a", "3500m", "8Gi"),
            physical_node("b", "4", "8192Mi"),
        ]
    }

    #[test]
    fn test_capacity_is_summed_over_physical_nodes() {
        let capacity = aggregate_capacity(&cluster());
        assert_eq!(capacity["cpu"], "7500m");
        assert_eq!(capacity["memory"], "16Gi");
        assert_eq!(capacity["pods"], "220");
        assert_eq!(capacity["ephemeral-storage"], "0");
    }

    #[test]
    fn story_synthesis_is_byte_for_byte_deterministic() {
        let first = synthesize_node("worker-1", &aggregate_capacity(&cluster()));
        let second = synthesize_node("worker-1", &aggregate_capacity(&cluster()));
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first.data["status"]["conditions"][0]["type"], "Ready");
        assert!(first.data["status"]["conditions"][0].get("lastHeartbeatTime").is_none());
        assert_eq!(first.labels()[FAKE_NODE_LABEL], "true");
    }

    #[tokio::test]
    async fn story_fake_node_created_for_pod_binding() {
        let mut pods = MockObjectClient::new();
        pods.expect_lookup().returning(|index, value| {
            assert_eq!(index, POD_NODE_NAME_INDEX);
            assert_eq!(value, "worker-1");
            vec![ObjectKey::namespaced("default", "web-0")]
        });

        let mut physical = MockObjectClient::new();
        physical.expect_list().returning(|| Ok(cluster()));

        let mut nodes = MockObjectClient::new();
        nodes.expect_get().returning(|_| Ok(None));
        nodes
            .expect_create()
            .times(1)
            .returning(|obj| {
                // the API server drops status on create
                let mut created = obj.clone();
                created.data["status"] = json!({});
                Ok(created)
            });
        nodes
            .expect_replace_status()
            .withf(|obj: &DynamicObject| obj.data["status"]["allocatable"]["cpu"] == "7500m")
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        let syncer = FakeNodeSyncer::new(Arc::new(nodes), Arc::new(pods), Arc::new(physical));
        let action = syncer.reconcile(&ObjectKey::cluster("worker-1")).await.unwrap();
        assert_eq!(action, ReconcileAction::RequeueAfter(CAPACITY_REFRESH));
    }

    #[tokio::test]
    async fn story_unchanged_capacity_writes_nothing() {
        let mut pods = MockObjectClient::new();
        pods.expect_lookup()
            .returning(|_, _| vec![ObjectKey::namespaced("default", "web-0")]);
        let mut physical = MockObjectClient::new();
        physical.expect_list().returning(|| Ok(cluster()));

        let mut nodes = MockObjectClient::new();
        nodes
            .expect_get()
            .returning(|_| Ok(Some(synthesize_node("worker-1", &aggregate_capacity(&cluster())))));
        nodes.expect_create().never();
        nodes.expect_replace_status().never();

        let syncer = FakeNodeSyncer::new(Arc::new(nodes), Arc::new(pods), Arc::new(physical));
        syncer.reconcile(&ObjectKey::cluster("worker-1")).await.unwrap();
    }

    #[tokio::test]
    async fn story_unreferenced_fake_node_is_deleted_but_real_nodes_are_not() {
        let mut pods = MockObjectClient::new();
        pods.expect_lookup().returning(|_, _| Vec::new());
        let mut nodes = MockObjectClient::new();
        nodes
            .expect_get()
            .returning(|_| Ok(Some(synthesize_node("worker-1", &BTreeMap::new()))));
        nodes.expect_delete().times(1).returning(|_| Ok(()));

        let syncer = FakeNodeSyncer::new(
            Arc::new(nodes),
            Arc::new(pods),
            Arc::new(MockObjectClient::new()),
        );
        syncer.reconcile(&ObjectKey::cluster("worker-1")).await.unwrap();

        let mut pods = MockObjectClient::new();
        pods.expect_lookup().returning(|_, _| Vec::new());
        let mut nodes = MockObjectClient::new();
        nodes
            .expect_get()
            .returning(|_| Ok(Some(physical_node("worker-2", "1", "1Gi"))));
        nodes.expect_delete().never();

        let syncer = FakeNodeSyncer::new(
            Arc::new(nodes),
            Arc::new(pods),
            Arc::new(MockObjectClient::new()),
        );
        syncer.reconcile(&ObjectKey::cluster("worker-2")).await.unwrap();
    }

    #[test]
    fn test_pod_trigger_maps_bound_pods_only() {
        let syncer = FakeNodeSyncer::new(
            Arc::new(MockObjectClient::new()),
            Arc::new(MockObjectClient::new()),
            Arc::new(MockObjectClient::new()),
        );
        let trigger = &syncer.triggers()[0];
        let bound = DynamicObject::new("web-0", &trigger.resource)
            .within("default")
            .data(json!({ "spec": { "nodeName": "worker-1" } }));
        let pending = DynamicObject::new("web-1", &trigger.resource)
            .within("default")
            .data(json!({ "spec": {} }));
        assert_eq!((trigger.map)(&bound), vec![ObjectKey::cluster("worker-1")]);
        assert!((trigger.map)(&pending).is_empty());
    }
}
