//! Mirrors the physical Service endpoints into the virtual `default/kubernetes`
//! Endpoints so in-cluster clients reach the virtual API server.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tracing::{debug, info, instrument};

use vkube_common::Result;
use vkube_syncer::manager::WATCH_TIMEOUT_SECS;
use vkube_syncer::RegisterContext;

use crate::runner::{error_policy, log_reconcile_result, until_cancelled};

/// Runnable name
pub const NAME: &str = "default-endpoints";

const DEFAULT_NAMESPACE: &str = "default";
const KUBERNETES: &str = "kubernetes";
const HTTPS_PORT: &str = "https";

/// Virtual subsets for the physical endpoints.
///
/// Addresses keep only their IP. The `https` port is used when present,
/// otherwise the first port; subsets without addresses or ports are dropped.
pub fn translate_subsets(physical: &Endpoints) -> Vec<EndpointSubset> {
    physical
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| {
            let addresses: Vec<EndpointAddress> = subset
                .addresses
                .iter()
                .flatten()
                .map(|a| EndpointAddress {
                    ip: a.ip.clone(),
                    ..Default::default()
                })
                .collect();
            if addresses.is_empty() {
                return None;
            }
            let ports = subset.ports.as_ref()?;
            let port = ports
                .iter()
                .find(|p| p.name.as_deref() == Some(HTTPS_PORT))
                .or_else(|| ports.first())?;
            Some(EndpointSubset {
                addresses: Some(addresses),
                not_ready_addresses: None,
                ports: Some(vec![EndpointPort {
                    name: Some(HTTPS_PORT.to_string()),
                    port: port.port,
                    protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                    app_protocol: None,
                }]),
            })
        })
        .collect()
}

struct Context {
    virtual_client: Client,
}

#[instrument(skip(physical, ctx))]
async fn reconcile(physical: Arc<Endpoints>, ctx: Arc<Context>) -> Result<Action> {
    let desired = translate_subsets(&physical);
    if desired.is_empty() {
        debug!("physical endpoints have no ready addresses, keeping virtual endpoints");
        return Ok(Action::await_change());
    }

    let api: Api<Endpoints> = Api::namespaced(ctx.virtual_client.clone(), DEFAULT_NAMESPACE);
    match api.get_opt(KUBERNETES).await? {
        None => {
            let endpoints = Endpoints {
                metadata: ObjectMeta {
                    name: Some(KUBERNETES.to_string()),
                    namespace: Some(DEFAULT_NAMESPACE.to_string()),
                    ..Default::default()
                },
                subsets: Some(desired),
            };
            api.create(&PostParams::default(), &endpoints).await?;
            info!("created virtual kubernetes endpoints");
        }
        Some(current) if current.subsets.as_ref() == Some(&desired) => {
            debug!("virtual kubernetes endpoints up to date");
        }
        Some(mut current) => {
            // replace carries the observed resourceVersion
            current.subsets = Some(desired);
            api.replace(KUBERNETES, &PostParams::default(), &current).await?;
            info!("updated virtual kubernetes endpoints");
        }
    }
    Ok(Action::await_change())
}

/// Add the endpoint mirror to the physical manager
pub fn register(ctx: &RegisterContext) -> Result<()> {
    let controller = Controller::new(
        Api::<Endpoints>::namespaced(
            ctx.physical_manager.client(),
            &ctx.options.current_namespace,
        ),
        WatcherConfig::default()
            .fields(&format!("metadata.name={}", ctx.options.service_name))
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .run(
        reconcile,
        error_policy,
        Arc::new(Context {
            virtual_client: ctx.virtual_manager.client(),
        }),
    )
    .for_each(log_reconcile_result("DefaultEndpoints"));

    ctx.physical_manager
        .add_runnable(NAME, until_cancelled(controller, ctx.cancel.clone()))
}
