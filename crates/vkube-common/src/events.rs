//! Kubernetes Event recording
//!
//! Structural reconcile failures (ownership collisions) and pod-security
//! findings are surfaced to tenants as Events on the virtual object, visible
//! via `kubectl describe`. Publishing is fire-and-forget: a failed event is
//! logged and never fails the reconcile that raised it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Physical object with the translated name is not managed by us
    pub const SYNC_CONFLICT: &str = "SyncConflict";
    /// Pod container lacks a security context under an enforced standard
    pub const MISSING_SECURITY_CONTEXT: &str = "MissingSecurityContext";
}

/// Well-known event action strings.
pub mod actions {
    /// Projecting a virtual object into the physical cluster
    pub const SYNC: &str = "Sync";
    /// Auditing a pod against the pod-security standard
    pub const AUDIT: &str = "Audit";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KubeEventPublisher>();
    }
}
