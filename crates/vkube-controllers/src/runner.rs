//! Shared plumbing for `kube::runtime::Controller` based controllers

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use vkube_common::Error;
use vkube_syncer::manager::Runnable;

/// Fixed delay before a failed reconcile is retried
pub const REQUEUE_ON_ERROR: Duration = Duration::from_secs(5);

/// Requeue after [`REQUEUE_ON_ERROR`] whatever failed
pub fn error_policy<K, C>(obj: Arc<K>, error: &Error, _ctx: Arc<C>) -> Action
where
    K: Resource,
{
    warn!(
        namespace = ?obj.namespace(),
        name = %obj.name_any(),
        error = %error,
        "reconcile failed, will retry"
    );
    Action::requeue(REQUEUE_ON_ERROR)
}

/// Log every controller result; the controller stream itself never stops on error
pub fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// Wrap a controller future into a manager runnable stopping on `cancel`
pub fn until_cancelled<F>(controller: F, cancel: CancellationToken) -> Runnable
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(async move {
        tokio::select! {
            _ = controller => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    })
}

/// Treat a 404 from the API as "nothing to do"
pub(crate) fn ignore_not_found<T>(result: Result<T, Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
