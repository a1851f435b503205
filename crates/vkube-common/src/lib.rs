//! Common types for vkube: errors, ownership markers, and utilities shared by
//! the syncer engine, the auxiliary controllers and the operator binary.

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by vkube
pub const FIELD_MANAGER: &str = "vkube";

/// Reserved prefix for labels and annotations written by vkube.
///
/// Tenant metadata using this prefix is never copied to the physical cluster.
pub const RESERVED_PREFIX: &str = "vkube.dev/";

/// Ownership annotation written on every physical object and namespace vkube manages
pub const MANAGED_ANNOTATION: &str = "vkube.dev/managed";

/// Value of [`MANAGED_ANNOTATION`] on managed objects
pub const MANAGED_VALUE: &str = "true";

/// Label carrying the name of the virtual cluster instance that owns a physical object
pub const MANAGED_BY_LABEL: &str = "vkube.dev/managed-by";

/// Back-reference annotation: name of the owning virtual object
pub const OBJECT_NAME_ANNOTATION: &str = "vkube.dev/object-name";

/// Back-reference annotation: namespace of the owning virtual object
pub const OBJECT_NAMESPACE_ANNOTATION: &str = "vkube.dev/object-namespace";

/// Label on physical objects carrying the virtual namespace they came from
pub const OBJECT_NAMESPACE_LABEL: &str = "vkube.dev/namespace";

/// Label marking a virtual object that was synthesized rather than projected
pub const FAKE_NODE_LABEL: &str = "vkube.dev/fake-node";

/// Label marking a persistent volume synthesized for a virtual claim
pub const FAKE_PERSISTENT_VOLUME_LABEL: &str = "vkube.dev/fake-persistentvolume";

/// Label marking a virtual persistent volume mirrored from the physical cluster
pub const MIRRORED_PERSISTENT_VOLUME_LABEL: &str = "vkube.dev/mirrored-persistentvolume";

/// Label marking a virtual node mirrored from a physical node
pub const MIRRORED_NODE_LABEL: &str = "vkube.dev/mirrored-node";

/// Annotation recording the hash of the last applied init manifests
pub const APPLIED_MANIFESTS_HASH_ANNOTATION: &str = "vkube.dev/applied-manifests-hash";

/// Hash of the last reported security-context violation on a virtual pod
pub const SECURITY_REPORT_ANNOTATION: &str = "vkube.dev/security-context-report";

/// Annotation written by kubectl that must not leak across clusters
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
