//! Generic real syncer driven by a [`Translator`]
//!
//! Per virtual key the pass is:
//!
//! | virtual        | physical          | action                          |
//! |----------------|-------------------|---------------------------------|
//! | absent/deleted | absent            | nothing                         |
//! | absent/deleted | owned             | delete with preconditions       |
//! | absent/deleted | not owned         | nothing (never touch)           |
//! | live           | absent            | create with ownership marker    |
//! | live           | owned             | update spec, mirror status      |
//! | live           | not owned         | ownership error + Warning event |

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info, instrument, warn};

use vkube_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::{Error, Result};

use crate::context::RegisterContext;
use crate::index::IndexSpec;
use crate::object::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::queue::ReconcileAction;
use crate::resources::namespace::EnsureTargetNamespace;
use crate::syncer::{IndicesRegisterer, RegisteredSyncer, Syncer};
use crate::translate::{Ownership, Translator};

/// Reporting controller name on Events
pub const EVENT_CONTROLLER: &str = "vkube-syncer";

/// Name of the physical index from owning virtual key to physical object
pub fn virtual_ref_index(syncer: &str) -> String {
    format!("{syncer}/virtual-ref")
}

/// Name of the virtual index from translated physical key to virtual object
pub fn physical_name_index(syncer: &str) -> String {
    format!("{syncer}/physical-name")
}

/// Real syncer for kinds fully described by a [`Translator`]
pub struct GenericSyncer {
    translator: Arc<Translator>,
    virtual_client: Arc<dyn ObjectClient>,
    physical_client: Arc<dyn ObjectClient>,
    events: Arc<dyn EventPublisher>,
}

impl GenericSyncer {
    /// Syncer over explicit clients
    pub fn new(
        translator: Translator,
        virtual_client: Arc<dyn ObjectClient>,
        physical_client: Arc<dyn ObjectClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            translator: Arc::new(translator),
            virtual_client,
            physical_client,
            events,
        }
    }

    /// Syncer over the managers in `ctx`
    pub fn from_context(ctx: &RegisterContext, translator: Translator) -> Self {
        let virtual_client = Arc::new(KubeObjectClient::new(
            ctx.virtual_manager.clone(),
            translator.virtual_resource().clone(),
            None,
        ));
        let physical_client = Arc::new(KubeObjectClient::new(
            ctx.physical_manager.clone(),
            translator.physical_resource().clone(),
            Some(ctx.options.target_namespace.clone()),
        ));
        let events = Arc::new(KubeEventPublisher::new(
            ctx.virtual_manager.client(),
            EVENT_CONTROLLER,
        ));
        Self::new(translator, virtual_client, physical_client, events)
    }

    /// Build the syncer against the managers in `ctx`, with its index
    /// registration and target namespace initializer attached
    pub fn register(ctx: &RegisterContext, translator: Translator) -> RegisteredSyncer {
        let syncer = Arc::new(Self::from_context(ctx, translator));
        RegisteredSyncer::real(syncer.clone())
            .with_indices(syncer)
            .with_initializer(Arc::new(EnsureTargetNamespace::new(ctx)))
    }

    /// Translation rules in use
    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub(crate) fn virtual_client(&self) -> &Arc<dyn ObjectClient> {
        &self.virtual_client
    }

    pub(crate) fn physical_client(&self) -> &Arc<dyn ObjectClient> {
        &self.physical_client
    }

    /// Physical counterpart of `vkey`: index hit first, translated name second
    pub(crate) async fn find_physical(&self, vkey: &ObjectKey) -> Result<Option<DynamicObject>> {
        let indexed = self
            .physical_client
            .lookup(&virtual_ref_index(self.translator.name()), &vkey.to_string());
        for pkey in indexed {
            if let Some(pobj) = self.physical_client.get(&pkey).await? {
                return Ok(Some(pobj));
            }
        }
        self.physical_client
            .get(&self.translator.physical_key(vkey))
            .await
    }

    async fn delete_physical(&self, vkey: &ObjectKey, pobj: DynamicObject) -> Result<ReconcileAction> {
        let pkey = ObjectKey::from_object(&pobj);
        match self.translator.ownership(&pobj, vkey) {
            Ownership::Owned => {
                self.physical_client.delete(&pobj).await?;
                record_write(self.translator.name(), ClusterSide::Physical, "delete");
                info!(syncer = self.translator.name(), object = %vkey, physical = %pkey, "deleted physical object");
            }
            other => {
                debug!(syncer = self.translator.name(), object = %vkey, physical = %pkey, ownership = ?other, "leaving unowned physical object");
            }
        }
        Ok(ReconcileAction::AwaitChange)
    }

    async fn create_physical(&self, vkey: &ObjectKey, vobj: &DynamicObject) -> Result<ReconcileAction> {
        let pobj = self.translator.translate_new(vobj);
        let created = self.physical_client.create(&pobj).await?;
        record_write(self.translator.name(), ClusterSide::Physical, "create");
        info!(syncer = self.translator.name(), object = %vkey, physical = %ObjectKey::from_object(&created), "created physical object");
        self.mirror_status(vkey, vobj, &created).await
    }

    async fn update_physical(
        &self,
        vkey: &ObjectKey,
        vobj: &DynamicObject,
        pobj: DynamicObject,
    ) -> Result<ReconcileAction> {
        let pobj = match self.translator.translate_update(&pobj, vobj) {
            Some(updated) => {
                let replaced = self.physical_client.replace(&updated).await?;
                record_write(self.translator.name(), ClusterSide::Physical, "update");
                debug!(syncer = self.translator.name(), object = %vkey, "updated physical object");
                replaced
            }
            None => pobj,
        };
        self.mirror_status(vkey, vobj, &pobj).await
    }

    async fn mirror_status(
        &self,
        vkey: &ObjectKey,
        vobj: &DynamicObject,
        pobj: &DynamicObject,
    ) -> Result<ReconcileAction> {
        if let Some(updated) = self.translator.translate_status(vobj, pobj) {
            self.virtual_client.replace_status(&updated).await?;
            record_write(self.translator.name(), ClusterSide::Virtual, "update_status");
            debug!(syncer = self.translator.name(), object = %vkey, "mirrored status to virtual object");
        }
        Ok(ReconcileAction::AwaitChange)
    }

    async fn report_conflict(
        &self,
        vkey: &ObjectKey,
        vobj: &DynamicObject,
        pobj: &DynamicObject,
        ownership: Ownership,
    ) -> Error {
        let pkey = ObjectKey::from_object(pobj);
        let message = match ownership {
            Ownership::Unmanaged => format!("physical object {pkey} exists and is not managed by vkube"),
            Ownership::OtherInstance(instance) => {
                format!("physical object {pkey} is managed by virtual cluster {instance:?}")
            }
            Ownership::OtherObject(owner) => {
                format!("physical object {pkey} already belongs to virtual object {owner}")
            }
            Ownership::Owned => format!("physical object {pkey} is owned"),
        };
        warn!(syncer = self.translator.name(), object = %vkey, %message, "ownership conflict");

        let reference = vobj.object_ref(self.translator.virtual_resource());
        self.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::SYNC_CONFLICT,
                actions::SYNC,
                Some(message.clone()),
            )
            .await;
        Error::ownership(format!("{} {pkey}", self.translator.physical_resource().kind), message)
    }
}

#[async_trait]
impl Syncer for GenericSyncer {
    fn name(&self) -> &str {
        self.translator.name()
    }

    fn virtual_resource(&self) -> ApiResource {
        self.translator.virtual_resource().clone()
    }

    fn physical_resource(&self) -> ApiResource {
        self.translator.physical_resource().clone()
    }

    fn physical_namespace(&self) -> Option<String> {
        Some(self.translator.names().target_namespace().to_string())
    }

    fn virtual_keys_for_physical(&self, pobj: &DynamicObject) -> Vec<ObjectKey> {
        let pkey = ObjectKey::from_object(pobj);
        let mut keys = self
            .virtual_client
            .lookup(&physical_name_index(self.translator.name()), &pkey.to_string());
        // back-reference fallback so orphans whose virtual object is gone are collected
        if let Some(owner) = self.translator.virtual_key_of(pobj) {
            if !keys.contains(&owner) {
                keys.push(owner);
            }
        }
        keys
    }

    #[instrument(skip(self), fields(syncer = %self.translator.name()))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let vobj = self.virtual_client.get(key).await?.filter(|obj| {
            obj.metadata.deletion_timestamp.is_none() && self.translator.is_included(obj)
        });
        let pobj = self.find_physical(key).await?;

        match (vobj, pobj) {
            (None, None) => Ok(ReconcileAction::AwaitChange),
            (None, Some(pobj)) => self.delete_physical(key, pobj).await,
            (Some(vobj), None) => self.create_physical(key, &vobj).await,
            (Some(vobj), Some(pobj)) => match self.translator.ownership(&pobj, key) {
                Ownership::Owned => self.update_physical(key, &vobj, pobj).await,
                other => Err(self.report_conflict(key, &vobj, &pobj, other).await),
            },
        }
    }
}

impl IndicesRegisterer for GenericSyncer {
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()> {
        let translator = self.translator.clone();
        ctx.physical_manager.register_index(IndexSpec::new(
            virtual_ref_index(self.translator.name()),
            self.translator.physical_resource().clone(),
            Some(self.translator.names().target_namespace().to_string()),
            Arc::new(move |pobj: &DynamicObject| {
                translator
                    .virtual_key_of(pobj)
                    .map(|k| k.to_string())
                    .into_iter()
                    .collect()
            }),
        ))?;

        let translator = self.translator.clone();
        ctx.virtual_manager.register_index(IndexSpec::new(
            physical_name_index(self.translator.name()),
            self.translator.virtual_resource().clone(),
            None,
            Arc::new(move |vobj: &DynamicObject| {
                vec![translator.physical_key(&ObjectKey::from_object(vobj)).to_string()]
            }),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::object::MockObjectClient;
    use crate::translate::NameTranslator;
    use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use vkube_common::{MANAGED_ANNOTATION, MANAGED_BY_LABEL};

    /// Records every published event reason
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) reasons: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.reasons.lock().push((reason.to_string(), note));
        }
    }

    fn configmaps() -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn translator() -> Translator {
        Translator::builder(
            "configmaps",
            configmaps(),
            NameTranslator::new("vcluster-a", "tenant-a"),
        )
        .spec(&["data"])
        .build()
        .unwrap()
    }

    fn vkey() -> ObjectKey {
        ObjectKey::namespaced("team", "settings")
    }

    fn virtual_configmap(value: &str) -> DynamicObject {
        let mut obj = DynamicObject::new("settings", &configmaps())
            .within("team")
            .data(json!({ "data": { "k": value } }));
        obj.metadata.uid = Some("vuid".to_string());
        obj
    }

    fn owned_physical(value: &str) -> DynamicObject {
        let mut pobj = translator().translate_new(&virtual_configmap(value));
        pobj.metadata.uid = Some("puid".to_string());
        pobj.metadata.resource_version = Some("7".to_string());
        pobj
    }

    fn no_index(mock: &mut MockObjectClient) {
        mock.expect_lookup().returning(|_, _| Vec::new());
    }

    fn generic_syncer(
        virtual_client: MockObjectClient,
        physical_client: MockObjectClient,
    ) -> (GenericSyncer, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        (
            GenericSyncer::new(
                translator(),
                Arc::new(virtual_client),
                Arc::new(physical_client),
                events.clone(),
            ),
            events,
        )
    }

    #[tokio::test]
    async fn story_new_virtual_object_is_created_physically_with_marker() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(virtual_configmap("v1"))));

        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(|_| Ok(None));
        p.expect_create()
            .withf(|obj: &DynamicObject| {
                obj.metadata.name.as_deref() == Some("settings-x-team-x-tenant-a")
                    && obj.metadata.namespace.as_deref() == Some("vcluster-a")
                    && obj.metadata.annotations.as_ref().is_some_and(|a| a.contains_key(MANAGED_ANNOTATION))
                    && obj.data["data"]["k"] == "v1"
            })
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        let (syncer, _) = generic_syncer(v, p);
        assert_eq!(syncer.reconcile(&vkey()).await.unwrap(), ReconcileAction::AwaitChange);
    }

    #[tokio::test]
    async fn story_second_pass_on_unchanged_object_writes_nothing() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(virtual_configmap("v1"))));
        v.expect_replace_status().never();

        let mut p = MockObjectClient::new();
        p.expect_lookup()
            .returning(|_, _| vec![ObjectKey::namespaced("vcluster-a", "settings-x-team-x-tenant-a")]);
        p.expect_get().returning(|_| Ok(Some(owned_physical("v1"))));
        p.expect_create().never();
        p.expect_replace().never();
        p.expect_delete().never();

        let (syncer, _) = generic_syncer(v, p);
        syncer.reconcile(&vkey()).await.unwrap();
        syncer.reconcile(&vkey()).await.unwrap();
    }

    #[tokio::test]
    async fn story_diverged_spec_is_replaced_with_observed_resource_version() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(virtual_configmap("v2"))));

        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(|_| Ok(Some(owned_physical("v1"))));
        p.expect_replace()
            .withf(|obj: &DynamicObject| {
                obj.data["data"]["k"] == "v2" && obj.metadata.resource_version.as_deref() == Some("7")
            })
            .times(1)
            .returning(|obj| Ok(obj.clone()));

        let (syncer, _) = generic_syncer(v, p);
        syncer.reconcile(&vkey()).await.unwrap();
    }

    #[tokio::test]
    async fn story_deleted_virtual_object_removes_owned_physical_counterpart() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(None));

        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(|_| Ok(Some(owned_physical("v1"))));
        p.expect_delete()
            .withf(|obj: &DynamicObject| obj.metadata.uid.as_deref() == Some("puid"))
            .times(1)
            .returning(|_| Ok(()));

        let (syncer, _) = generic_syncer(v, p);
        syncer.reconcile(&vkey()).await.unwrap();
    }

    #[tokio::test]
    async fn story_terminating_virtual_object_is_treated_as_gone() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| {
            let mut obj = virtual_configmap("v1");
            obj.metadata.deletion_timestamp =
                Some(serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap());
            Ok(Some(obj))
        });

        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(|_| Ok(Some(owned_physical("v1"))));
        p.expect_delete().times(1).returning(|_| Ok(()));

        let (syncer, _) = generic_syncer(v, p);
        syncer.reconcile(&vkey()).await.unwrap();
    }

    #[tokio::test]
    async fn story_unmanaged_physical_object_is_never_touched() {
        let unmanaged = || {
            let mut obj = DynamicObject::new("settings-x-team-x-tenant-a", &configmaps())
                .within("vcluster-a")
                .data(json!({ "data": { "k": "someone else" } }));
            obj.metadata.labels = Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), "tenant-a".to_string())]));
            obj
        };

        // live virtual object: structural error plus a Warning event
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(virtual_configmap("v1"))));
        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(move |_| Ok(Some(unmanaged())));
        p.expect_replace().never();
        p.expect_delete().never();

        let (syncer, events) = generic_syncer(v, p);
        let err = syncer.reconcile(&vkey()).await.unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
        assert!(!err.is_retryable());
        assert_eq!(events.reasons.lock()[0].0, reasons::SYNC_CONFLICT);

        // virtual object gone: still not deleted
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(None));
        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(move |_| Ok(Some(unmanaged())));
        p.expect_delete().never();

        let (syncer, _) = generic_syncer(v, p);
        syncer.reconcile(&vkey()).await.unwrap();
    }

    #[tokio::test]
    async fn story_write_conflict_surfaces_as_retryable() {
        let mut v = MockObjectClient::new();
        v.expect_get().returning(|_| Ok(Some(virtual_configmap("v2"))));
        let mut p = MockObjectClient::new();
        no_index(&mut p);
        p.expect_get().returning(|_| Ok(Some(owned_physical("v1"))));
        p.expect_replace()
            .returning(|_| Err(Error::conflict("ConfigMap vcluster-a/settings-x-team-x-tenant-a", "409")));

        let (syncer, _) = generic_syncer(v, p);
        let err = syncer.reconcile(&vkey()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_physical_events_map_to_owner_through_back_reference() {
        let mut v = MockObjectClient::new();
        no_index(&mut v);
        let (syncer, _) = generic_syncer(v, MockObjectClient::new());

        assert_eq!(syncer.virtual_keys_for_physical(&owned_physical("v1")), vec![vkey()]);

        let mut foreign = owned_physical("v1");
        foreign.metadata.annotations = None;
        assert!(syncer.virtual_keys_for_physical(&foreign).is_empty());
    }

    #[test]
    fn test_index_names() {
        assert_eq!(virtual_ref_index("secrets"), "secrets/virtual-ref");
        assert_eq!(physical_name_index("secrets"), "secrets/physical-name");
    }
}
