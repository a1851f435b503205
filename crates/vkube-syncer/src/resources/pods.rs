//! Pod syncer
//!
//! The virtual pod spec is projected once, at creation, with every reference
//! to a namespaced object (service account, config maps, secrets, claims)
//! rewritten to its physical name. After that only container images and the
//! active deadline travel down; the rest of a pod spec is immutable.
//!
//! Scheduling happens physically. When the physical scheduler places the pod
//! the virtual pod is bound to the same node name, which is what makes the
//! fake node syncer synthesize that node. A virtual pod has no kubelet, so a
//! terminating virtual pod is removed for good once its physical counterpart
//! is gone.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use vkube_common::metrics::{record_write, ClusterSide};
use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::object::ObjectKey;
use crate::queue::ReconcileAction;
use crate::resources::namespace::EnsureTargetNamespace;
use crate::syncer::{IndicesRegisterer, RegisteredSyncer, Syncer};
use crate::translate::{FieldPath, NameTranslator, Ownership, RewriteContext, Translator};

/// Syncer name
pub const NAME: &str = "pods";

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Pod spec fields projected on create
const SPEC_FIELDS: &[FieldPath] = &[
    &["spec", "activeDeadlineSeconds"],
    &["spec", "affinity"],
    &["spec", "containers"],
    &["spec", "dnsConfig"],
    &["spec", "dnsPolicy"],
    &["spec", "hostAliases"],
    &["spec", "hostname"],
    &["spec", "imagePullSecrets"],
    &["spec", "initContainers"],
    &["spec", "nodeSelector"],
    &["spec", "readinessGates"],
    &["spec", "restartPolicy"],
    &["spec", "securityContext"],
    &["spec", "serviceAccountName"],
    &["spec", "shareProcessNamespace"],
    &["spec", "subdomain"],
    &["spec", "terminationGracePeriodSeconds"],
    &["spec", "tolerations"],
    &["spec", "topologySpreadConstraints"],
    &["spec", "volumes"],
];

fn pod_resource() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

fn node_name(pod: &DynamicObject) -> Option<&str> {
    pod.data
        .pointer("/spec/nodeName")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
}

fn rename_field(ctx: &RewriteContext<'_>, obj: Option<&mut Value>, field: &str) {
    let Some(obj) = obj.and_then(Value::as_object_mut) else {
        return;
    };
    if let Some(name) = obj.get(field).and_then(Value::as_str) {
        let physical = ctx.physical_name(name);
        obj.insert(field.to_string(), Value::String(physical));
    }
}

fn rename_volume(ctx: &RewriteContext<'_>, volume: &mut Value) {
    rename_field(ctx, volume.get_mut("configMap"), "name");
    rename_field(ctx, volume.get_mut("secret"), "secretName");
    rename_field(ctx, volume.get_mut("persistentVolumeClaim"), "claimName");

    if let Some(sources) = volume
        .pointer_mut("/projected/sources")
        .and_then(Value::as_array_mut)
    {
        // tokens for the physical account would authenticate against the wrong API server
        sources.retain(|source| source.get("serviceAccountToken").is_none());
        for source in sources {
            rename_field(ctx, source.get_mut("configMap"), "name");
            rename_field(ctx, source.get_mut("secret"), "name");
        }
    }
}

fn rename_env(ctx: &RewriteContext<'_>, container: &mut Value) {
    if let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) {
        for var in env {
            if let Some(from) = var.get_mut("valueFrom") {
                rename_field(ctx, from.get_mut("configMapKeyRef"), "name");
                rename_field(ctx, from.get_mut("secretKeyRef"), "name");
            }
        }
    }
    if let Some(sources) = container.get_mut("envFrom").and_then(Value::as_array_mut) {
        for source in sources {
            rename_field(ctx, source.get_mut("configMapRef"), "name");
            rename_field(ctx, source.get_mut("secretRef"), "name");
        }
    }
}

fn translate_spec(ctx: &RewriteContext<'_>, spec: &mut Map<String, Value>) {
    let account = spec
        .get("serviceAccountName")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
        .to_string();
    spec.insert(
        "serviceAccountName".to_string(),
        Value::String(ctx.physical_name(&account)),
    );
    spec.insert("automountServiceAccountToken".to_string(), Value::Bool(false));
    // physical service links would expose the host namespace's services
    spec.insert("enableServiceLinks".to_string(), Value::Bool(false));

    if let Some(secrets) = spec.get_mut("imagePullSecrets").and_then(Value::as_array_mut) {
        for secret in secrets {
            rename_field(ctx, Some(secret), "name");
        }
    }
    if let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_array_mut) {
        volumes.iter_mut().for_each(|v| rename_volume(ctx, v));
    }
    for list in ["containers", "initContainers"] {
        if let Some(containers) = spec.get_mut(list).and_then(Value::as_array_mut) {
            containers.iter_mut().for_each(|c| rename_env(ctx, c));
        }
    }
}

/// Copy `image` from the desired containers onto the current ones, matched by name
fn overlay_images(current: &mut Value, desired: Option<&Value>) {
    let (Some(current), Some(desired)) = (
        current.as_array_mut(),
        desired.and_then(Value::as_array),
    ) else {
        return;
    };
    for container in current {
        let image = desired
            .iter()
            .find(|d| d.get("name").is_some() && d.get("name") == container.get("name"))
            .and_then(|d| d.get("image"))
            .cloned();
        if let (Some(image), Some(container)) = (image, container.as_object_mut()) {
            container.insert("image".to_string(), image);
        }
    }
}

/// Physical spec on update: the current one with the mutable fields applied
fn updated_spec(current: &Value, desired: Option<&Value>) -> Option<Value> {
    let mut spec = current.get("spec")?.clone();
    for list in ["containers", "initContainers"] {
        if let Some(containers) = spec.get_mut(list) {
            overlay_images(containers, desired.and_then(|d| d.get(list)));
        }
    }
    if let (Some(deadline), Some(spec)) = (
        desired.and_then(|d| d.get("activeDeadlineSeconds")).cloned(),
        spec.as_object_mut(),
    ) {
        spec.insert("activeDeadlineSeconds".to_string(), deadline);
    }
    Some(spec)
}

fn rewrite(ctx: &RewriteContext<'_>, data: &mut Value) {
    match ctx.current {
        None => {
            if let Some(spec) = data.get_mut("spec").and_then(Value::as_object_mut) {
                translate_spec(ctx, spec);
            }
        }
        Some(current) => {
            let spec = updated_spec(current, data.get("spec"));
            if let (Some(spec), Some(data)) = (spec, data.as_object_mut()) {
                data.insert("spec".to_string(), spec);
            }
        }
    }
}

/// Translation rules for Pods
pub fn translator(names: NameTranslator) -> Result<Translator> {
    SPEC_FIELDS
        .iter()
        .fold(Translator::builder(NAME, pod_resource(), names), |b, path| b.spec(*path))
        .status(&["status"])
        .rewrite(rewrite)
        .build()
}

/// Generic pod projection plus virtual-side binding and final removal
pub struct PodSyncer {
    inner: GenericSyncer,
}

impl PodSyncer {
    /// Wrap a generic syncer built from [`translator`]
    pub fn new(inner: GenericSyncer) -> Self {
        Self { inner }
    }

    /// Build the pod syncer from `ctx`
    pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
        let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
        let syncer = Arc::new(Self::new(GenericSyncer::from_context(ctx, translator(names)?)));
        Ok(RegisteredSyncer::real(syncer.clone())
            .with_indices(syncer)
            .with_initializer(Arc::new(EnsureTargetNamespace::new(ctx))))
    }

    async fn owned_physical(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self
            .inner
            .find_physical(key)
            .await?
            .filter(|p| self.inner.translator().ownership(p, key) == Ownership::Owned))
    }

    async fn bind(&self, key: &ObjectKey, node: &str) -> Result<()> {
        let binding = json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": { "name": key.name, "namespace": key.namespace },
            "target": { "apiVersion": "v1", "kind": "Node", "name": node },
        });
        self.inner
            .virtual_client()
            .create_subresource(key, "binding", binding)
            .await?;
        record_write(NAME, ClusterSide::Virtual, "bind");
        info!(pod = %key, node, "bound virtual pod to physical node");
        Ok(())
    }
}

#[async_trait]
impl Syncer for PodSyncer {
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

        let Some(vpod) = self.inner.virtual_client().get(key).await? else {
            return Ok(action);
        };
        let ppod = self.owned_physical(key).await?;

        if vpod.metadata.deletion_timestamp.is_some() {
            if ppod.is_none() {
                self.inner.virtual_client().delete_now(&vpod).await?;
                record_write(NAME, ClusterSide::Virtual, "delete");
                info!(pod = %key, "physical pod gone, removed terminating virtual pod");
            }
            return Ok(action);
        }

        match (node_name(&vpod), ppod.as_ref().and_then(node_name)) {
            (None, Some(node)) => self.bind(key, node).await?,
            (Some(bound), Some(node)) if bound != node => {
                debug!(pod = %key, virtual_node = bound, physical_node = node, "virtual pod bound elsewhere");
            }
            _ => {}
        }
        Ok(action)
    }
}

impl IndicesRegisterer for PodSyncer {
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()> {
        self.inner.register_indices(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::tests::RecordingPublisher;
    use crate::object::MockObjectClient;

    fn translator() -> Translator {
        super::translator(NameTranslator::new("vcluster-a", "tenant-a")).unwrap()
    }

    fn vpod(spec: Value) -> DynamicObject {
        DynamicObject::new("web-0", &pod_resource())
            .within("shop")
            .data(json!({ "spec": spec }))
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("shop", "web-0")
    }

    fn owned(spec: Value) -> DynamicObject {
        let mut pobj = translator().translate_new(&vpod(spec));
        pobj.metadata.uid = Some("puid".to_string());
        pobj
    }

    fn pod_syncer(v: MockObjectClient, p: MockObjectClient) -> PodSyncer {
        PodSyncer::new(GenericSyncer::new(
            translator(),
            Arc::new(v),
            Arc::new(p),
            Arc::new(RecordingPublisher::default()),
        ))
    }

    #[test]
    fn story_references_follow_translated_names() {
        let pobj = translator().translate_new(&vpod(json!({
            "serviceAccountName": "builder",
            "nodeName": "worker-9",
            "imagePullSecrets": [{ "name": "registry" }],
            "containers": [{
                "name": "app",
                "image": "shop:1",
                "env": [
                    { "name": "A", "valueFrom": { "configMapKeyRef": { "name": "settings", "key": "a" } } },
                    { "name": "B", "valueFrom": { "secretKeyRef": { "name": "creds", "key": "b" } } },
                    { "name": "C", "value": "plain" }
                ],
                "envFrom": [{ "secretRef": { "name": "bulk" } }]
            }],
            "volumes": [
                { "name": "cfg", "configMap": { "name": "settings" } },
                { "name": "data", "persistentVolumeClaim": { "claimName": "data" } },
                { "name": "api", "projected": { "sources": [
                    { "serviceAccountToken": { "path": "token" } },
                    { "configMap": { "name": "kube-root-ca.crt" } }
                ] } }
            ]
        })));

        let spec = &pobj.data["spec"];
        assert_eq!(spec["serviceAccountName"], "builder-x-shop-x-tenant-a");
        assert_eq!(spec["automountServiceAccountToken"], false);
        assert_eq!(spec["enableServiceLinks"], false);
        assert!(spec.get("nodeName").is_none());
        assert_eq!(spec["imagePullSecrets"][0]["name"], "registry-x-shop-x-tenant-a");

        let env = &spec["containers"][0]["env"];
        assert_eq!(env[0]["valueFrom"]["configMapKeyRef"]["name"], "settings-x-shop-x-tenant-a");
        assert_eq!(env[1]["valueFrom"]["secretKeyRef"]["name"], "creds-x-shop-x-tenant-a");
        assert_eq!(env[2]["value"], "plain");
        assert_eq!(spec["containers"][0]["envFrom"][0]["secretRef"]["name"], "bulk-x-shop-x-tenant-a");

        assert_eq!(spec["volumes"][0]["configMap"]["name"], "settings-x-shop-x-tenant-a");
        assert_eq!(spec["volumes"][1]["persistentVolumeClaim"]["claimName"], "data-x-shop-x-tenant-a");
        let sources = spec["volumes"][2]["projected"]["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["configMap"]["name"], "kube-root-ca.crt-x-shop-x-tenant-a");
    }

    #[test]
    fn test_missing_service_account_maps_to_default() {
        let pobj = translator().translate_new(&vpod(json!({ "containers": [] })));
        assert_eq!(pobj.data["spec"]["serviceAccountName"], "default-x-shop-x-tenant-a");
    }

    #[test]
    fn story_only_images_change_after_creation() {
        let t = translator();
        let spec = json!({
            "containers": [{ "name": "app", "image": "shop:1" }],
            "volumes": [{ "name": "cfg", "configMap": { "name": "settings" } }]
        });
        let mut pobj = t.translate_new(&vpod(spec.clone()));
        pobj.data["spec"]["nodeName"] = json!("worker-1");

        // unchanged virtual pod: the translated references are stable
        assert!(t.translate_update(&pobj, &vpod(spec)).is_none());

        let changed = vpod(json!({
            "containers": [{ "name": "app", "image": "shop:2" }],
            "volumes": [{ "name": "other", "emptyDir": {} }]
        }));
        let updated = t.translate_update(&pobj, &changed).expect("image changed");
        let spec = &updated.data["spec"];
        assert_eq!(spec["containers"][0]["image"], "shop:2");
        assert_eq!(spec["volumes"][0]["configMap"]["name"], "settings-x-shop-x-tenant-a");
        assert_eq!(spec["nodeName"], "worker-1");
    }

    #[test]
    fn test_status_flows_up() {
        let t = translator();
        let vobj = vpod(json!({ "containers": [] }));
        let mut pobj = t.translate_new(&vobj);
        pobj.data["status"] = json!({ "phase": "Running", "podIP": "10.1.2.3" });
        let mirrored = t.translate_status(&vobj, &pobj).expect("status differs");
        assert_eq!(mirrored.data["status"]["phase"], "Running");
    }

    #[test]
    fn test_scheduling_fields_stay_physical() {
        for field in ["nodeName", "priorityClassName", "runtimeClassName", "schedulerName"] {
            assert!(!SPEC_FIELDS.iter().any(|p| p.last() == Some(&field)), "{field}");
        }
    }

    #[tokio::test]
    async fn story_scheduled_physical_pod_binds_the_virtual_pod() {
        let spec = json!({ "containers": [{ "name": "app", "image": "shop:1" }] });

        let mut v = MockObjectClient::new();
        let vspec = spec.clone();
        v.expect_get().returning(move |_| Ok(Some(vpod(vspec.clone()))));
        v.expect_create_subresource()
            .withf(|key: &ObjectKey, sub: &str, body: &Value| {
                *key == ObjectKey::namespaced("shop", "web-0")
                    && sub == "binding"
                    && body["target"]["name"] == "worker-1"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        v.expect_replace_status().returning(|obj| Ok(obj.clone()));

        let mut p = MockObjectClient::new();
        p.expect_lookup().returning(|_, _| Vec::new());
        p.expect_get().returning(move |_| {
            let mut pobj = owned(spec.clone());
            pobj.data["spec"]["nodeName"] = json!("worker-1");
            Ok(Some(pobj))
        });
        p.expect_replace().never();

        pod_syncer(v, p).reconcile(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_already_bound_virtual_pod_is_not_rebound() {
        let spec = json!({ "containers": [{ "name": "app", "image": "shop:1" }] });

        let mut v = MockObjectClient::new();
        let vspec = spec.clone();
        v.expect_get().returning(move |_| {
            let mut obj = vpod(vspec.clone());
            obj.data["spec"]["nodeName"] = json!("worker-1");
            Ok(Some(obj))
        });
        v.expect_create_subresource().never();
        v.expect_replace_status().returning(|obj| Ok(obj.clone()));

        let mut p = MockObjectClient::new();
        p.expect_lookup().returning(|_, _| Vec::new());
        p.expect_get().returning(move |_| {
            let mut pobj = owned(spec.clone());
            pobj.data["spec"]["nodeName"] = json!("worker-1");
            Ok(Some(pobj))
        });

        pod_syncer(v, p).reconcile(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn story_terminating_virtual_pod_is_removed_once_physical_pod_is_gone() {
        let terminating = || {
            let mut obj = vpod(json!({ "containers": [] }));
            obj.metadata.uid = Some("vuid".to_string());
            obj.metadata.deletion_timestamp =
                Some(serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap());
            obj
        };

        // physical pod still terminating: wait for it
        let mut v = MockObjectClient::new();
        v.expect_get().returning(move |_| Ok(Some(terminating())));
        v.expect_delete_now().never();
        let mut p = MockObjectClient::new();
        p.expect_lookup().returning(|_, _| Vec::new());
        p.expect_get().returning(|_| Ok(Some(owned(json!({ "containers": [] })))));
        p.expect_delete().times(1).returning(|_| Ok(()));
        pod_syncer(v, p).reconcile(&key()).await.unwrap();

        // physical pod gone: the virtual pod is removed without grace
        let mut v = MockObjectClient::new();
        v.expect_get().returning(move |_| Ok(Some(terminating())));
        v.expect_delete_now()
            .withf(|obj: &DynamicObject| obj.metadata.uid.as_deref() == Some("vuid"))
            .times(1)
            .returning(|_| Ok(()));
        let mut p = MockObjectClient::new();
        p.expect_lookup().returning(|_, _| Vec::new());
        p.expect_get().returning(|_| Ok(None));
        pod_syncer(v, p).reconcile(&key()).await.unwrap();
    }
}
