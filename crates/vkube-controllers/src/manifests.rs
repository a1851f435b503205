//! Init manifests: a physical ConfigMap whose `manifests` key is applied to
//! the virtual cluster once per distinct content.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use vkube_common::kube_utils::{apply_manifests_with_discovery, deterministic_hash};
use vkube_common::yaml::split_manifests;
use vkube_common::{Result, APPLIED_MANIFESTS_HASH_ANNOTATION};
use vkube_syncer::manager::WATCH_TIMEOUT_SECS;
use vkube_syncer::RegisterContext;

use crate::runner::{error_policy, ignore_not_found, log_reconcile_result, until_cancelled};

/// Runnable name
pub const NAME: &str = "init-manifests";

/// ConfigMap key holding the multi-document bundle
pub const MANIFESTS_KEY: &str = "manifests";

/// Name of the init manifests ConfigMap for an instance
pub fn configmap_name(instance: &str) -> String {
    format!("{instance}-init-manifests")
}

/// What a reconcile of the init manifests ConfigMap has to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestPlan {
    /// Nothing new since the last apply
    Skip,
    /// Apply `documents` and record `hash`
    Apply {
        /// Hash of the whole bundle
        hash: String,
        /// Individual manifests in bundle order
        documents: Vec<String>,
    },
}

/// Decide whether the bundle in `cm` still needs applying
pub fn plan(cm: &ConfigMap) -> ManifestPlan {
    let bundle = cm
        .data
        .as_ref()
        .and_then(|d| d.get(MANIFESTS_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    let hash = deterministic_hash(bundle);
    if cm.annotations().get(APPLIED_MANIFESTS_HASH_ANNOTATION) == Some(&hash) {
        return ManifestPlan::Skip;
    }
    ManifestPlan::Apply {
        hash,
        documents: split_manifests(bundle),
    }
}

struct Context {
    virtual_client: Client,
    physical_client: Client,
}

#[instrument(skip(cm, ctx), fields(configmap = %cm.name_any()))]
async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let ManifestPlan::Apply { hash, documents } = plan(&cm) else {
        debug!("init manifests unchanged");
        return Ok(Action::await_change());
    };

    apply_manifests_with_discovery(&ctx.virtual_client, &documents[..]).await?;
    info!(documents = documents.len(), hash = %hash, "applied init manifests");

    let namespace = cm.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(ctx.physical_client.clone(), &namespace);
    let patch = json!({
        "metadata": { "annotations": { APPLIED_MANIFESTS_HASH_ANNOTATION: hash } }
    });
    ignore_not_found(
        api.patch(&cm.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Into::into),
    )?;
    Ok(Action::await_change())
}

/// Add the init manifests controller to the physical manager
pub fn register(ctx: &RegisterContext) -> Result<()> {
    let controller = Controller::new(
        Api::<ConfigMap>::namespaced(
            ctx.current_namespace_client.clone(),
            &ctx.options.current_namespace,
        ),
        WatcherConfig::default()
            .fields(&format!("metadata.name={}", configmap_name(&ctx.options.name)))
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .run(
        reconcile,
        error_policy,
        Arc::new(Context {
            virtual_client: ctx.virtual_manager.client(),
            physical_client: ctx.current_namespace_client.clone(),
        }),
    )
    .for_each(log_reconcile_result("InitManifests"));

    ctx.physical_manager
        .add_runnable(NAME, until_cancelled(controller, ctx.cancel.clone()))
}
