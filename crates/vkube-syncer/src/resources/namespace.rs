//! Target namespace initializer shared by every namespaced real syncer

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vkube_common::kube_utils::ensure_namespace_with_annotations;
use vkube_common::retry::{retry_with_backoff, RetryConfig};
use vkube_common::{Error, Result, MANAGED_ANNOTATION, MANAGED_VALUE};

use crate::context::RegisterContext;
use crate::syncer::Initializer;

/// Ensures the physical target namespace exists and carries the ownership annotation
pub struct EnsureTargetNamespace {
    client: Client,
    namespace: String,
    retry: RetryConfig,
}

impl EnsureTargetNamespace {
    /// Initializer for the target namespace in `ctx`
    pub fn new(ctx: &RegisterContext) -> Self {
        Self {
            client: ctx.physical_manager.client(),
            namespace: ctx.options.target_namespace.clone(),
            retry: RetryConfig::with_max_attempts(5),
        }
    }
}

#[async_trait]
impl Initializer for EnsureTargetNamespace {
    async fn initialize(&self, cancel: CancellationToken) -> Result<()> {
        let annotations = BTreeMap::from([(MANAGED_ANNOTATION.to_string(), MANAGED_VALUE.to_string())]);
        let ensure = retry_with_backoff(&self.retry, "ensure target namespace", || {
            ensure_namespace_with_annotations(&self.client, &self.namespace, &annotations)
        });

        tokio::select! {
            res = ensure => res.map_err(Error::from)?,
            _ = cancel.cancelled() => {
                return Err(Error::internal_with_context(
                    "target namespace",
                    format!("cancelled while ensuring namespace {}", self.namespace),
                ));
            }
        }
        info!(namespace = %self.namespace, "target namespace ready");
        Ok(())
    }
}
