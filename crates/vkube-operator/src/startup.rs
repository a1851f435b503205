//! Startup orchestration
//!
//! Phases run strictly in order: build syncers, run initializers, register
//! indices, register controllers, start and sync both caches, then run every
//! runnable until the cancellation token fires.

use tracing::info;

use vkube_common::{Error, Result};
use vkube_controllers::{coredns, endpoints, manifests, podsecurity, securitycontext};
use vkube_syncer::register::{self, register_syncer};
use vkube_syncer::{RegisterContext, RegisteredSyncer};

fn start_controller(name: &str, result: Result<()>) -> Result<()> {
    result.map_err(|e| Error::registration("controllers", format!("start {name} controller: {e}")))
}

/// Register auxiliary controllers and then every syncer, in a fixed order
pub fn register_controllers(ctx: &RegisterContext, syncers: &[RegisteredSyncer]) -> Result<()> {
    start_controller(endpoints::NAME, endpoints::register(ctx))?;
    start_controller(podsecurity::NAME, podsecurity::register(ctx))?;
    start_controller(securitycontext::NAME, securitycontext::register(ctx))?;
    start_controller(coredns::NAME, coredns::register(ctx))?;
    start_controller(manifests::NAME, manifests::register(ctx))?;

    for syncer in syncers {
        register_syncer(ctx, syncer)?;
    }
    info!(syncers = syncers.len(), "controllers registered");
    Ok(())
}

/// Everything after syncer construction
pub async fn start(ctx: &RegisterContext, syncers: &[RegisteredSyncer]) -> Result<()> {
    register::execute_initializers(ctx, syncers).await?;
    register::register_indices(ctx, syncers)?;
    register_controllers(ctx, syncers)?;

    ctx.virtual_manager.start_cache(&ctx.cancel)?;
    ctx.physical_manager.start_cache(&ctx.cancel)?;
    tokio::try_join!(
        ctx.virtual_manager.wait_for_cache_sync(&ctx.cancel),
        ctx.physical_manager.wait_for_cache_sync(&ctx.cancel),
    )?;

    info!("caches synced, starting runnables");
    let (virtual_result, physical_result) = tokio::join!(
        ctx.virtual_manager.run(ctx.cancel.clone()),
        ctx.physical_manager.run(ctx.cancel.clone()),
    );
    virtual_result.and(physical_result)
}

/// Full startup sequence; returns on cancellation or a fatal runnable error
pub async fn run(ctx: &RegisterContext) -> Result<()> {
    let syncers = register::create(ctx)?;
    info!(
        syncers = ?syncers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "syncers created"
    );
    start(ctx, &syncers).await
}
