use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::{Error, Result, FAKE_PERSISTENT_VOLUME_LABEL, MIRRORED_PERSISTENT_VOLUME_LABEL};

use super::{claim_ref, claim_ref_value, volume_resource, NAME};
use crate::context::RegisterContext;
use crate::object::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::queue::ReconcileAction;
use crate::resources::persistentvolumeclaims::{self, claim_resource};
use crate::syncer::{RegisteredSyncer, Syncer};
use crate::translate::{NameTranslator, Translator};

/// Mirrors physical volumes bound to this instance's claims into the
/// virtual cluster, with the claim reference pointing at the virtual claim.
///
/// Virtual volumes carrying neither the mirrored nor the fake marker are
/// never touched.
pub struct PersistentVolumeSyncer {
    claims: Translator,
    virtual_volumes: Arc<dyn ObjectClient>,
    physical_volumes: Arc<dyn ObjectClient>,
    physical_claims: Arc<dyn ObjectClient>,
}

impl PersistentVolumeSyncer {
    /// Syncer over explicit clients; `claims` resolves physical claims back to virtual ones
    pub fn new(
        claims: Translator,
        virtual_volumes: Arc<dyn ObjectClient>,
        physical_volumes: Arc<dyn ObjectClient>,
        physical_claims: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            claims,
            virtual_volumes,
            physical_volumes,
            physical_claims,
        }
    }

    /// Build the persistent volume syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
        let syncer = Self::new(
            persistentvolumeclaims::translator(names)?,
            Arc::new(KubeObjectClient::new(ctx.virtual_manager.clone(), volume_resource(), None)),
            Arc::new(KubeObjectClient::new(ctx.physical_manager.clone(), volume_resource(), None)),
            Arc::new(KubeObjectClient::new(
                ctx.physical_manager.clone(),
                claim_resource(),
                Some(ctx.options.target_namespace.clone()),
            )),
        );
        Ok(RegisteredSyncer::real(Arc::new(syncer)))
    }

    fn claimed_here(&self, pvolume: &DynamicObject) -> Option<ObjectKey> {
        claim_ref(pvolume).filter(|c| c.namespace_or_empty() == self.claims.names().target_namespace())
    }

    /// Virtual claim a physical volume serves, if it is bound to one of ours
    async fn virtual_claim_of(&self, pvolume: &DynamicObject) -> Result<Option<ObjectKey>> {
        let Some(pclaim_key) = self.claimed_here(pvolume) else {
            return Ok(None);
        };
        Ok(self
            .physical_claims
            .get(&pclaim_key)
            .await?
            .and_then(|pclaim| self.claims.virtual_key_of(&pclaim)))
    }

    fn desired_labels(pvolume: &DynamicObject) -> BTreeMap<String, String> {
        let mut labels = pvolume.labels().clone();
        labels.remove(FAKE_PERSISTENT_VOLUME_LABEL);
        labels.insert(MIRRORED_PERSISTENT_VOLUME_LABEL.to_string(), "true".to_string());
        labels
    }

    /// Physical spec with the claim reference pointed at `vclaim`.
    ///
    /// A virtual reference to the same claim is kept as is, so the uid the
    /// virtual binder recorded survives.
    fn desired_spec(pvolume: &DynamicObject, vclaim: &ObjectKey, vvolume: Option<&DynamicObject>) -> Value {
        let mut spec = pvolume.data.get("spec").cloned().unwrap_or_else(|| json!({}));
        let reference = match vvolume {
            Some(v) if claim_ref(v).as_ref() == Some(vclaim) => v.data["spec"]["claimRef"].clone(),
            _ => claim_ref_value(vclaim, None),
        };
        if let Some(spec) = spec.as_object_mut() {
            spec.insert("claimRef".to_string(), reference);
        }
        spec
    }

    async fn mirror_status(&self, vvolume: DynamicObject, pvolume: &DynamicObject) -> Result<()> {
        let Some(status) = pvolume.data.get("status").cloned() else {
            return Ok(());
        };
        if vvolume.data.get("status") == Some(&status) {
            return Ok(());
        }
        let mut updated = vvolume;
        updated.data["status"] = status;
        self.virtual_volumes.replace_status(&updated).await?;
        record_write(NAME, ClusterSide::Virtual, "update_status");
        Ok(())
    }
}

#[async_trait]
impl Syncer for PersistentVolumeSyncer {
    fn name(&self) -> &str {
        NAME
    }

    fn virtual_resource(&self) -> ApiResource {
        volume_resource()
    }

    fn physical_resource(&self) -> ApiResource {
        volume_resource()
    }

    fn physical_namespace(&self) -> Option<String> {
        None
    }

    fn virtual_keys_for_physical(&self, pobj: &DynamicObject) -> Vec<ObjectKey> {
        self.claimed_here(pobj)
            .map(|_| ObjectKey::cluster(pobj.name_any()))
            .into_iter()
            .collect()
    }

    #[instrument(skip(self), fields(syncer = NAME))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let pvolume = self
            .physical_volumes
            .get(key)
            .await?
            .filter(|p| p.metadata.deletion_timestamp.is_none());
        let mirrored = match pvolume {
            Some(pvolume) => self
                .virtual_claim_of(&pvolume)
                .await?
                .map(|vclaim| (pvolume, vclaim)),
            None => None,
        };
        let vvolume = self.virtual_volumes.get(key).await?;

        match (mirrored, vvolume) {
            (None, None) => {}
            (None, Some(vvolume)) => {
                if vvolume.labels().contains_key(MIRRORED_PERSISTENT_VOLUME_LABEL) {
                    self.virtual_volumes.delete(&vvolume).await?;
                    record_write(NAME, ClusterSide::Virtual, "delete");
                    info!(volume = %key, "removed mirrored volume");
                }
            }
            (Some((pvolume, vclaim)), None) => {
                let mut vvolume = DynamicObject::new(&key.name, &volume_resource())
                    .data(json!({ "spec": Self::desired_spec(&pvolume, &vclaim, None) }));
                vvolume.metadata.labels = Some(Self::desired_labels(&pvolume));
                let created = self.virtual_volumes.create(&vvolume).await?;
                record_write(NAME, ClusterSide::Virtual, "create");
                info!(volume = %key, claim = %vclaim, "mirrored physical volume");
                self.mirror_status(created, &pvolume).await?;
            }
            (Some((pvolume, vclaim)), Some(vvolume)) => {
                let labels = vvolume.labels();
                if !labels.contains_key(MIRRORED_PERSISTENT_VOLUME_LABEL)
                    && !labels.contains_key(FAKE_PERSISTENT_VOLUME_LABEL)
                {
                    return Err(Error::ownership(
                        format!("PersistentVolume {key}"),
                        "virtual volume exists and was not created by vkube",
                    ));
                }
                let desired_labels = Self::desired_labels(&pvolume);
                let desired_spec = Self::desired_spec(&pvolume, &vclaim, Some(&vvolume));
                let vvolume = if labels != &desired_labels || vvolume.data.get("spec") != Some(&desired_spec) {
                    let mut updated = vvolume.clone();
                    updated.metadata.labels = Some(desired_labels);
                    updated.data["spec"] = desired_spec;
                    let replaced = self.virtual_volumes.replace(&updated).await?;
                    record_write(NAME, ClusterSide::Virtual, "update");
                    debug!(volume = %key, "updated mirrored volume");
                    replaced
                } else {
                    vvolume
                };
                self.mirror_status(vvolume, &pvolume).await?;
            }
        }
        Ok(ReconcileAction::AwaitChange)
    }
}
