use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::{Result, FAKE_PERSISTENT_VOLUME_LABEL};

use super::{claim_ref_value, volume_resource, FAKE_NAME};
use crate::context::RegisterContext;
use crate::index::IndexSpec;
use crate::object::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::queue::ReconcileAction;
use crate::resources::persistentvolumeclaims::{claim_resource, volume_name};
use crate::syncer::{FakeSyncer, FakeTrigger, IndicesRegisterer, RegisteredSyncer};

/// Virtual claim index from `spec.volumeName` to claims
pub const CLAIM_VOLUME_NAME_INDEX: &str = "fake-persistentvolumes/spec.volumeName";

const BOUND: &str = "Bound";

/// Placeholder volume for a bound virtual claim.
///
/// Capacity is the claim's bound capacity, or its request while the status
/// has not caught up. The volume source is a `fake` flex driver nothing in
/// the virtual cluster can mount.
pub fn synthesize_volume(name: &str, claim: &DynamicObject) -> DynamicObject {
    let spec_of = |field: &str| claim.data.get("spec").and_then(|s| s.get(field)).cloned();
    let storage = claim
        .data
        .pointer("/status/capacity/storage")
        .or_else(|| claim.data.pointer("/spec/resources/requests/storage"))
        .cloned()
        .unwrap_or_else(|| json!("0"));

    let mut spec = Map::new();
    spec.insert(
        "accessModes".to_string(),
        spec_of("accessModes").unwrap_or_else(|| json!(["ReadWriteOnce"])),
    );
    spec.insert("capacity".to_string(), json!({ "storage": storage }));
    spec.insert(
        "claimRef".to_string(),
        claim_ref_value(&ObjectKey::from_object(claim), claim.metadata.uid.as_deref()),
    );
    spec.insert("flexVolume".to_string(), json!({ "driver": "fake" }));
    spec.insert("persistentVolumeReclaimPolicy".to_string(), json!("Retain"));
    for field in ["storageClassName", "volumeMode"] {
        if let Some(value) = spec_of(field) {
            spec.insert(field.to_string(), value);
        }
    }

    let mut volume = DynamicObject::new(name, &volume_resource())
        .data(json!({ "spec": spec, "status": { "phase": BOUND } }));
    volume.metadata.labels = Some(BTreeMap::from([(
        FAKE_PERSISTENT_VOLUME_LABEL.to_string(),
        "true".to_string(),
    )]));
    volume
}

/// Synthesizes a bound volume for every volume name virtual claims point at
pub struct FakePersistentVolumeSyncer {
    virtual_volumes: Arc<dyn ObjectClient>,
    virtual_claims: Arc<dyn ObjectClient>,
}

impl FakePersistentVolumeSyncer {
    /// Syncer over explicit clients
    pub fn new(virtual_volumes: Arc<dyn ObjectClient>, virtual_claims: Arc<dyn ObjectClient>) -> Self {
        Self {
            virtual_volumes,
            virtual_claims,
        }
    }

    /// Build the fake persistent volume syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let syncer = Arc::new(Self::new(
            Arc::new(KubeObjectClient::new(ctx.virtual_manager.clone(), volume_resource(), None)),
            Arc::new(KubeObjectClient::new(ctx.virtual_manager.clone(), claim_resource(), None)),
        ));
        Ok(RegisteredSyncer::fake(syncer.clone()).with_indices(syncer))
    }

    /// First live claim bound to `volume`
    async fn bound_claim(&self, volume: &str) -> Result<Option<DynamicObject>> {
        for key in self.virtual_claims.lookup(CLAIM_VOLUME_NAME_INDEX, volume) {
            let claim = self
                .virtual_claims
                .get(&key)
                .await?
                .filter(|c| c.metadata.deletion_timestamp.is_none() && volume_name(c) == Some(volume));
            if claim.is_some() {
                return Ok(claim);
            }
        }
        Ok(None)
    }

    async fn mark_bound(&self, mut volume: DynamicObject) -> Result<()> {
        if volume.data.pointer("/status/phase").and_then(Value::as_str) == Some(BOUND) {
            return Ok(());
        }
        volume.data["status"] = json!({ "phase": BOUND });
        self.virtual_volumes.replace_status(&volume).await?;
        record_write(FAKE_NAME, ClusterSide::Virtual, "update_status");
        Ok(())
    }
}

#[async_trait]
impl FakeSyncer for FakePersistentVolumeSyncer {
    fn name(&self) -> &str {
        FAKE_NAME
    }

    fn virtual_resource(&self) -> ApiResource {
        volume_resource()
    }

    fn triggers(&self) -> Vec<FakeTrigger> {
        vec![FakeTrigger {
            resource: claim_resource(),
            map: Arc::new(|claim: &DynamicObject| {
                volume_name(claim).map(ObjectKey::cluster).into_iter().collect()
            }),
        }]
    }

    #[instrument(skip(self), fields(syncer = FAKE_NAME))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let claim = self.bound_claim(&key.name).await?;
        let vvolume = self.virtual_volumes.get(key).await?;
        let is_fake = |v: &DynamicObject| {
            v.labels()
                .get(FAKE_PERSISTENT_VOLUME_LABEL)
                .is_some_and(|l| l == "true")
        };

        let Some(claim) = claim else {
            if let Some(vvolume) = vvolume.filter(is_fake) {
                self.virtual_volumes.delete(&vvolume).await?;
                record_write(FAKE_NAME, ClusterSide::Virtual, "delete");
                info!(volume = %key, "removed unused fake volume");
            }
            return Ok(ReconcileAction::AwaitChange);
        };

        match vvolume {
            None => {
                let created = self
                    .virtual_volumes
                    .create(&synthesize_volume(&key.name, &claim))
                    .await?;
                record_write(FAKE_NAME, ClusterSide::Virtual, "create");
                info!(volume = %key, claim = %ObjectKey::from_object(&claim), "created fake volume");
                self.mark_bound(created).await?;
            }
            Some(vvolume) if is_fake(&vvolume) => self.mark_bound(vvolume).await?,
            Some(_) => debug!(volume = %key, "virtual volume is not fake, leaving it alone"),
        }
        Ok(ReconcileAction::AwaitChange)
    }
}

impl IndicesRegisterer for FakePersistentVolumeSyncer {
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()> {
        ctx.virtual_manager.register_index(IndexSpec::new(
            CLAIM_VOLUME_NAME_INDEX,
            claim_resource(),
            None,
            Arc::new(|claim: &DynamicObject| volume_name(claim).map(str::to_string).into_iter().collect()),
        ))
    }
}
