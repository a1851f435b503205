//! PersistentVolumeClaim syncer
//!
//! Claims are provisioned physically. Once the physical claim is bound the
//! virtual claim is pointed at the same volume name, which the persistent
//! volume syncers (real or fake) then materialize in the virtual cluster.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::Value;
use tracing::{info, instrument};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::object::ObjectKey;
use crate::queue::ReconcileAction;
use crate::resources::namespace::EnsureTargetNamespace;
use crate::syncer::{IndicesRegisterer, RegisteredSyncer, Syncer};
use crate::translate::{NameTranslator, Ownership, Translator};

/// Syncer name
pub const NAME: &str = "persistentvolumeclaims";

pub(crate) fn claim_resource() -> ApiResource {
    ApiResource::erase::<PersistentVolumeClaim>(&())
}

/// Bound volume name of a claim, if any
pub fn volume_name(claim: &DynamicObject) -> Option<&str> {
    claim
        .data
        .pointer("/spec/volumeName")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
}

/// Translation rules for PersistentVolumeClaims
pub fn translator(names: NameTranslator) -> Result<Translator> {
    Translator::builder(NAME, claim_resource(), names)
        .spec(&["spec", "accessModes"])
        .spec(&["spec", "resources"])
        .spec(&["spec", "storageClassName"])
        .spec(&["spec", "volumeMode"])
        .status(&["status"])
        .build()
}

/// Generic claim projection plus the virtual volume binding
pub struct PersistentVolumeClaimSyncer {
    inner: GenericSyncer,
}

impl PersistentVolumeClaimSyncer {
    /// Wrap a generic syncer built from [`translator`]
    pub fn new(inner: GenericSyncer) -> Self {
        Self { inner }
    }

    /// Build the claim syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
        let syncer = Arc::new(Self::new(GenericSyncer::from_context(ctx, translator(names)?)));
        Ok(RegisteredSyncer::real(syncer.clone())
            .with_indices(syncer)
            .with_initializer(Arc::new(EnsureTargetNamespace::new(ctx))))
    }
}

#[async_trait]
impl Syncer for PersistentVolumeClaimSyncer {
    fn name(&self) -> &str {
        NAME
    }

    fn virtual_resource(&self) -> ApiResource {
        self.inner.virtual_resource()
    }

    fn physical_resource(&self) -> ApiResource {
        self.inner.physical_resource()
    }

    fn physical_namespace(&self) -> Option<String> {
        self.inner.physical_namespace()
    }

    fn virtual_keys_for_physical(&self, pobj: &DynamicObject) -> Vec<ObjectKey> {
        self.inner.virtual_keys_for_physical(pobj)
    }

    #[instrument(skip(self), fields(syncer = NAME))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let action = self.inner.reconcile(key).await?;

        let Some(vclaim) = self
            .inner
            .virtual_client()
            .get(key)
            .await?
            .filter(|c| c.metadata.deletion_timestamp.is_none())
        else {
            return Ok(action);
        };
        // the volume name of a bound claim is immutable
        if volume_name(&vclaim).is_some() {
            return Ok(action);
        }
        let Some(pclaim) = self
            .inner
            .find_physical(key)
            .await?
            .filter(|p| self.inner.translator().ownership(p, key) == Ownership::Owned)
        else {
            return Ok(action);
        };
        let Some(volume) = volume_name(&pclaim).map(str::to_string) else {
            return Ok(action);
        };

        let mut updated = vclaim;
        updated.data["spec"]["volumeName"] = Value::String(volume.clone());
        self.inner.virtual_client().replace(&updated).await?;
        record_write(NAME, ClusterSide::Virtual, "update");
        info!(claim = %key, volume = %volume, "virtual claim bound to physical volume name");
        Ok(action)
    }
}

impl IndicesRegisterer for PersistentVolumeClaimSyncer {
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()> {
        self.inner.register_indices(ctx)
    }
}
