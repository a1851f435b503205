//! Pod security standard enforcement on virtual namespaces.
//!
//! The namespace controller stamps the pod-security admission labels on
//! every virtual namespace. The pod reporter only audits: containers without
//! a security context are logged and surfaced as a Warning event. The pod is
//! annotated with a hash of the reported containers so the same violation is
//! reported once, not on every resync.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

use vkube_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use vkube_common::kube_utils::deterministic_hash;
use vkube_common::{Result, SECURITY_REPORT_ANNOTATION};
use vkube_syncer::manager::WATCH_TIMEOUT_SECS;
use vkube_syncer::{PodSecurityStandard, RegisterContext};

use crate::runner::{error_policy, ignore_not_found, log_reconcile_result, until_cancelled};

/// Controller name used in logs and as the event reporter
pub const NAME: &str = "pod-security";

/// Level enforced by pod-security admission
pub const ENFORCE_LABEL: &str = "pod-security.kubernetes.io/enforce";
/// Version of the enforced level
pub const ENFORCE_VERSION_LABEL: &str = "pod-security.kubernetes.io/enforce-version";
/// Level producing admission warnings
pub const WARN_LABEL: &str = "pod-security.kubernetes.io/warn";
/// Version of the warned level
pub const WARN_VERSION_LABEL: &str = "pod-security.kubernetes.io/warn-version";

const VERSION_LATEST: &str = "latest";

/// The four pod-security labels to write, or `None` when all already match
pub fn desired_labels(
    current: &BTreeMap<String, String>,
    standard: PodSecurityStandard,
) -> Option<BTreeMap<String, String>> {
    let desired: BTreeMap<String, String> = [
        (ENFORCE_LABEL, standard.as_str()),
        (ENFORCE_VERSION_LABEL, VERSION_LATEST),
        (WARN_LABEL, standard.as_str()),
        (WARN_VERSION_LABEL, VERSION_LATEST),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let matches = desired
        .iter()
        .all(|(k, v)| current.get(k).map(String::as_str) == Some(v.as_str()));
    (!matches).then_some(desired)
}

/// Names of containers (init containers included) without a security context
pub fn containers_missing_security_context(pod: &Pod) -> Vec<String> {
    let Some(spec) = &pod.spec else {
        return Vec::new();
    };
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .filter(|c| c.security_context.is_none())
        .map(|c| c.name.clone())
        .collect()
}

struct NamespaceContext {
    client: Client,
    standard: PodSecurityStandard,
}

#[instrument(skip(ns, ctx), fields(namespace = %ns.name_any()))]
async fn reconcile_namespace(ns: Arc<Namespace>, ctx: Arc<NamespaceContext>) -> Result<Action> {
    let Some(labels) = desired_labels(ns.labels(), ctx.standard) else {
        return Ok(Action::await_change());
    };

    let api: Api<Namespace> = Api::all(ctx.client.clone());
    let patch = json!({ "metadata": { "labels": labels } });
    ignore_not_found(
        api.patch(&ns.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Into::into),
    )?;
    info!(standard = ctx.standard.as_str(), "enforcing pod security standard");
    Ok(Action::await_change())
}

/// What the pod reporter has to do for one pod
#[derive(Debug, PartialEq, Eq)]
pub enum ReportAction {
    /// The recorded report matches the pod
    Unchanged,
    /// Publish a Warning for these containers and record `hash`
    Report {
        /// Containers that violate the standard
        containers: Vec<String>,
        /// Hash of the violation to record on the pod
        hash: String,
    },
    /// The violation is gone; drop the recorded hash
    Clear,
}

/// Compare the pod's current violation with the one recorded on it
pub fn report_action(pod: &Pod) -> ReportAction {
    let missing = containers_missing_security_context(pod);
    let recorded = pod.annotations().get(SECURITY_REPORT_ANNOTATION);
    if missing.is_empty() {
        return match recorded {
            Some(_) => ReportAction::Clear,
            None => ReportAction::Unchanged,
        };
    }
    let hash = deterministic_hash(&missing.join(","));
    if recorded == Some(&hash) {
        return ReportAction::Unchanged;
    }
    ReportAction::Report {
        containers: missing,
        hash,
    }
}

struct PodReportContext {
    client: Client,
    events: Arc<dyn EventPublisher>,
}

async fn report_pod(pod: Arc<Pod>, ctx: Arc<PodReportContext>) -> Result<Action> {
    let recorded = match report_action(&pod) {
        ReportAction::Unchanged => return Ok(Action::await_change()),
        ReportAction::Clear => None,
        ReportAction::Report { containers, hash } => {
            warn!(
                namespace = ?pod.namespace(),
                pod = %pod.name_any(),
                containers = ?containers,
                "containers without a security context"
            );
            ctx.events
                .publish(
                    &pod.object_ref(&()),
                    EventType::Warning,
                    reasons::MISSING_SECURITY_CONTEXT,
                    actions::AUDIT,
                    Some(format!(
                        "containers without a security context: {}",
                        containers.join(", ")
                    )),
                )
                .await;
            Some(hash)
        }
    };

    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod.namespace().unwrap_or_default());
    let patch = json!({
        "metadata": { "annotations": { SECURITY_REPORT_ANNOTATION: recorded } }
    });
    ignore_not_found(
        api.patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Into::into),
    )?;
    Ok(Action::await_change())
}

/// Add the namespace enforcer and the pod reporter to the virtual manager.
///
/// Does nothing when no standard is configured.
pub fn register(ctx: &RegisterContext) -> Result<()> {
    let Some(standard) = ctx.options.pod_security_standard else {
        return Ok(());
    };
    let client = ctx.virtual_manager.client();

    let namespaces = Controller::new(
        Api::<Namespace>::all(client.clone()),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .run(
        reconcile_namespace,
        error_policy,
        Arc::new(NamespaceContext {
            client: client.clone(),
            standard,
        }),
    )
    .for_each(log_reconcile_result("PodSecurityNamespace"));

    let pods = Controller::new(
        Api::<Pod>::all(client.clone()),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .run(
        report_pod,
        error_policy,
        Arc::new(PodReportContext {
            client: client.clone(),
            events: Arc::new(KubeEventPublisher::new(client, NAME)),
        }),
    )
    .for_each(log_reconcile_result("PodSecurityPod"));

    ctx.virtual_manager
        .add_runnable(format!("{NAME} namespaces"), until_cancelled(namespaces, ctx.cancel.clone()))?;
    ctx.virtual_manager
        .add_runnable(format!("{NAME} pods"), until_cancelled(pods, ctx.cancel.clone()))?;
    info!(standard = standard.as_str(), "pod security controllers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, SecurityContext};
    use kube::api::ObjectMeta;

    fn pod_with(containers: &[(&str, bool)], recorded: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("team-a".to_string()),
                annotations: recorded.map(|h| {
                    BTreeMap::from([(SECURITY_REPORT_ANNOTATION.to_string(), h.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(name, secured)| Container {
                        name: name.to_string(),
                        security_context: secured.then(SecurityContext::default),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn story_unlabelled_namespace_gets_all_four_labels() {
        let desired = desired_labels(&labels(&[("team", "a")]), PodSecurityStandard::Baseline).unwrap();
        assert_eq!(desired.len(), 4);
        assert_eq!(desired[ENFORCE_LABEL], "baseline");
        assert_eq!(desired[WARN_LABEL], "baseline");
        assert_eq!(desired[ENFORCE_VERSION_LABEL], "latest");
        assert_eq!(desired[WARN_VERSION_LABEL], "latest");
    }

    #[test]
    fn story_already_enforced_namespace_is_not_written() {
        let current = labels(&[
            (ENFORCE_LABEL, "restricted"),
            (ENFORCE_VERSION_LABEL, "latest"),
            (WARN_LABEL, "restricted"),
            (WARN_VERSION_LABEL, "latest"),
            ("team", "a"),
        ]);
        assert!(desired_labels(&current, PodSecurityStandard::Restricted).is_none());
    }

    #[test]
    fn test_partial_labels_are_completed() {
        let current = labels(&[(ENFORCE_LABEL, "restricted"), (ENFORCE_VERSION_LABEL, "latest")]);
        assert!(desired_labels(&current, PodSecurityStandard::Restricted).is_some());
        // a different level is overwritten
        let current = labels(&[
            (ENFORCE_LABEL, "privileged"),
            (ENFORCE_VERSION_LABEL, "latest"),
            (WARN_LABEL, "restricted"),
            (WARN_VERSION_LABEL, "latest"),
        ]);
        let desired = desired_labels(&current, PodSecurityStandard::Restricted).unwrap();
        assert_eq!(desired[ENFORCE_LABEL], "restricted");
    }

    #[test]
    fn test_missing_security_contexts_include_init_containers() {
        let pod = Pod {
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "migrate".to_string(),
                    ..Default::default()
                }]),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        security_context: Some(SecurityContext::default()),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(containers_missing_security_context(&pod), vec!["migrate", "sidecar"]);
        assert!(containers_missing_security_context(&Pod::default()).is_empty());
    }

    #[test]
    fn story_violation_is_reported_once_until_it_changes() {
        let fresh = pod_with(&[("app", false), ("sidecar", true)], None);
        let ReportAction::Report { containers, hash } = report_action(&fresh) else {
            panic!("first sight of a violation must be reported");
        };
        assert_eq!(containers, vec!["app"]);

        // the resync after recording the hash stays quiet
        let recorded = pod_with(&[("app", false), ("sidecar", true)], Some(&hash));
        assert_eq!(report_action(&recorded), ReportAction::Unchanged);

        // a different set of offending containers is a new report
        let widened = pod_with(&[("app", false), ("sidecar", false)], Some(&hash));
        assert!(matches!(report_action(&widened), ReportAction::Report { .. }));
    }

    #[test]
    fn test_fixed_pod_clears_recorded_report() {
        let fixed = pod_with(&[("app", true)], Some("0123456789abcdef"));
        assert_eq!(report_action(&fixed), ReportAction::Clear);
        let clean = pod_with(&[("app", true)], None);
        assert_eq!(report_action(&clean), ReportAction::Unchanged);
    }
}
