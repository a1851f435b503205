//! Registration layer: build, initialize, index and start syncers
//!
//! Startup is strictly phased. Initializers create prerequisites the
//! reconcile loops assume, indices must exist before caches start, and queues
//! are only added once both are done.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::task::JoinSet;
use tracing::{info, warn};

use vkube_common::{Error, Result};

use crate::context::{EnabledControllers, RegisterContext, SyncerVariant, RESOURCE_GROUPS};
use crate::manager::WATCH_TIMEOUT_SECS;
use crate::object::ObjectKey;
use crate::queue::{KeyStream, QueueOptions, ReconcileFn, WorkQueue};
use crate::resources;
use crate::syncer::{RegisteredSyncer, SyncerKind, TriggerMap};

/// First enabled variant of every resource group, in group order
pub fn selected_variants(enabled: &EnabledControllers) -> Vec<SyncerVariant> {
    RESOURCE_GROUPS
        .iter()
        .filter_map(|group| group.iter().copied().find(|v| enabled.contains(*v)))
        .collect()
}

/// Build every enabled syncer
pub fn create(ctx: &RegisterContext) -> Result<Vec<RegisteredSyncer>> {
    create_with(ctx, resources::build)
}

/// Build every enabled syncer with an explicit constructor.
///
/// Fails on the first constructor error; nothing built so far is kept.
pub fn create_with<F>(ctx: &RegisterContext, mut build: F) -> Result<Vec<RegisteredSyncer>>
where
    F: FnMut(SyncerVariant, &RegisterContext) -> Result<RegisteredSyncer>,
{
    selected_variants(&ctx.controllers)
        .into_iter()
        .map(|variant| {
            build(variant, ctx).map_err(|e| {
                Error::registration("syncers", format!("register {variant} controller: {e}"))
            })
        })
        .collect()
}

/// Run every initializer concurrently.
///
/// The first failure cancels the others; returns once all have finished.
pub async fn execute_initializers(ctx: &RegisterContext, syncers: &[RegisteredSyncer]) -> Result<()> {
    let cancel = ctx.cancel.child_token();
    let mut set = JoinSet::new();
    for syncer in syncers {
        if let Some(initializer) = syncer.initializer.clone() {
            let name = syncer.name.clone();
            let token = cancel.clone();
            set.spawn(async move { (name, initializer.initialize(token).await) });
        }
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((name, Err(e))) => format!("ensure prerequisites for {name} syncer: {e}"),
            Err(e) => format!("initializer panicked: {e}"),
        };
        if first_error.is_none() {
            cancel.cancel();
            first_error = Some(Error::registration("initializers", failure));
        } else {
            warn!(error = %failure, "additional initializer failure");
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Register every syncer's indices, one after another
pub fn register_indices(ctx: &RegisterContext, syncers: &[RegisteredSyncer]) -> Result<()> {
    for syncer in syncers {
        if let Some(indices) = &syncer.indices {
            indices.register_indices(ctx).map_err(|e| {
                Error::registration(
                    "indices",
                    format!("register indices for {} syncer: {e}", syncer.name),
                )
            })?;
        }
    }
    Ok(())
}

/// Watch a resource and map every touched object to reconcile keys
pub fn watch_keys(
    client: Client,
    resource: &ApiResource,
    namespace: Option<&str>,
    map: TriggerMap,
) -> KeyStream {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, resource),
        None => Api::all_with(client, resource),
    };
    let kind = resource.kind.clone();
    watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .touched_objects()
        .filter_map(move |res| {
            let obj = match res {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "trigger watch error");
                    None
                }
            };
            futures::future::ready(obj)
        })
        .flat_map(move |obj| stream::iter(map(&obj)))
        .boxed()
}

fn object_key_map() -> TriggerMap {
    Arc::new(|obj: &DynamicObject| vec![ObjectKey::from_object(obj)])
}

/// Add the work queue for one syncer to the virtual manager.
///
/// Real syncers are triggered by their virtual kind and by physical events
/// mapped back to virtual keys; fake syncers by their virtual kind plus
/// their extra triggers.
pub fn register_syncer(ctx: &RegisterContext, syncer: &RegisteredSyncer) -> Result<()> {
    let virtual_client = ctx.virtual_manager.client();
    let (triggers, reconcile): (Vec<KeyStream>, ReconcileFn) = match &syncer.kind {
        SyncerKind::Real(real) => {
            let mapper = real.clone();
            let physical_namespace = real.physical_namespace();
            let triggers = vec![
                watch_keys(virtual_client, &real.virtual_resource(), None, object_key_map()),
                watch_keys(
                    ctx.physical_manager.client(),
                    &real.physical_resource(),
                    physical_namespace.as_deref(),
                    Arc::new(move |pobj: &DynamicObject| mapper.virtual_keys_for_physical(pobj)),
                ),
            ];
            let real = real.clone();
            let reconcile: ReconcileFn = Arc::new(move |key: ObjectKey| {
                let real = real.clone();
                async move { real.reconcile(&key).await }.boxed()
            });
            (triggers, reconcile)
        }
        SyncerKind::Fake(fake) => {
            let mut triggers = vec![watch_keys(
                virtual_client.clone(),
                &fake.virtual_resource(),
                None,
                object_key_map(),
            )];
            for trigger in fake.triggers() {
                triggers.push(watch_keys(virtual_client.clone(), &trigger.resource, None, trigger.map));
            }
            let fake = fake.clone();
            let reconcile: ReconcileFn = Arc::new(move |key: ObjectKey| {
                let fake = fake.clone();
                async move { fake.reconcile(&key).await }.boxed()
            });
            (triggers, reconcile)
        }
    };

    let queue = WorkQueue::new(
        syncer.name.clone(),
        QueueOptions::with_concurrency(ctx.options.max_concurrent_reconciles),
    );
    ctx.virtual_manager
        .add_runnable(
            format!("{} syncer", syncer.name),
            queue.run(triggers, reconcile, ctx.cancel.clone()).boxed(),
        )
        .map_err(|e| Error::registration("controllers", format!("start {} syncer: {e}", syncer.name)))?;
    info!(syncer = %syncer.name, real = syncer.is_real(), "syncer registered");
    Ok(())
}
