//! vkube - virtual cluster resource syncer

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vkube_common::kube_utils::create_client;
use vkube_common::telemetry::{init_telemetry, TelemetryConfig};
use vkube_operator::cli::Cli;
use vkube_operator::startup;
use vkube_syncer::{ClusterManager, ClusterRole, RegisterContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook server and both kube clients share this provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        instance: Some(cli.name.clone()),
        ..TelemetryConfig::default()
    })?;

    let options = cli.sync_options()?;
    let controllers = cli.enabled_controllers();

    let virtual_client = create_client(cli.virtual_kubeconfig.as_deref(), None)
        .await
        .context("virtual cluster client")?;
    let physical_client = create_client(cli.physical_kubeconfig.as_deref(), None)
        .await
        .context("physical cluster client")?;
    let current_namespace_client = create_client(
        cli.physical_kubeconfig.as_deref(),
        Some(&options.current_namespace),
    )
    .await
    .context("current namespace client")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    tracing::info!(
        name = %options.name,
        target_namespace = %options.target_namespace,
        "starting vkube syncer"
    );
    let ctx = RegisterContext {
        cancel,
        controllers,
        options,
        virtual_manager: ClusterManager::new(ClusterRole::Virtual, virtual_client),
        physical_manager: ClusterManager::new(ClusterRole::Physical, physical_client),
        current_namespace_client,
    };

    startup::run(&ctx).await.context("vkube syncer stopped")?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
