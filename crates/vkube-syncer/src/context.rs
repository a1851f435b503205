//! Register context: the dependency set handed to every syncer constructor

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use vkube_common::Error;

use crate::manager::ClusterManager;

/// Every syncer the engine knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncerVariant {
    /// Services projected into the target namespace
    Services,
    /// ConfigMaps projected into the target namespace
    ConfigMaps,
    /// Secrets projected into the target namespace
    Secrets,
    /// ServiceAccounts projected into the target namespace
    ServiceAccounts,
    /// Pods projected into the target namespace and bound back virtually
    Pods,
    /// PersistentVolumeClaims projected into the target namespace
    PersistentVolumeClaims,
    /// Physical nodes mirrored into the virtual cluster
    Nodes,
    /// Nodes synthesized from virtual pod placement
    FakeNodes,
    /// Physical volumes of synced claims mirrored into the virtual cluster
    PersistentVolumes,
    /// Volumes synthesized for bound virtual claims
    FakePersistentVolumes,
}

/// Mutually exclusive variants; the first enabled member of each group wins
pub const RESOURCE_GROUPS: &[&[SyncerVariant]] = &[
    &[SyncerVariant::Services],
    &[SyncerVariant::ConfigMaps],
    &[SyncerVariant::Secrets],
    &[SyncerVariant::ServiceAccounts],
    &[SyncerVariant::Pods],
    &[SyncerVariant::PersistentVolumeClaims],
    &[SyncerVariant::Nodes, SyncerVariant::FakeNodes],
    &[SyncerVariant::PersistentVolumes, SyncerVariant::FakePersistentVolumes],
];

impl SyncerVariant {
    /// Configuration key
    pub fn key(&self) -> &'static str {
        match self {
            SyncerVariant::Services => "services",
            SyncerVariant::ConfigMaps => "configmaps",
            SyncerVariant::Secrets => "secrets",
            SyncerVariant::ServiceAccounts => "serviceaccounts",
            SyncerVariant::Pods => "pods",
            SyncerVariant::PersistentVolumeClaims => "persistentvolumeclaims",
            SyncerVariant::Nodes => "nodes",
            SyncerVariant::FakeNodes => "fake-nodes",
            SyncerVariant::PersistentVolumes => "persistentvolumes",
            SyncerVariant::FakePersistentVolumes => "fake-persistentvolumes",
        }
    }

    /// Parse a configuration key
    pub fn from_key(key: &str) -> Option<Self> {
        RESOURCE_GROUPS
            .iter()
            .flat_map(|group| group.iter())
            .copied()
            .find(|v| v.key() == key)
    }
}

impl fmt::Display for SyncerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Set of enabled syncer variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledControllers(BTreeSet<SyncerVariant>);

impl EnabledControllers {
    /// Variants enabled when nothing is configured
    pub fn defaults() -> Self {
        Self(
            [
                SyncerVariant::Services,
                SyncerVariant::ConfigMaps,
                SyncerVariant::Secrets,
                SyncerVariant::ServiceAccounts,
                SyncerVariant::Pods,
                SyncerVariant::PersistentVolumeClaims,
                SyncerVariant::FakeNodes,
                SyncerVariant::FakePersistentVolumes,
            ]
            .into_iter()
            .collect(),
        )
    }

    /// Exactly the given variants
    pub fn from_variants(variants: impl IntoIterator<Item = SyncerVariant>) -> Self {
        Self(variants.into_iter().collect())
    }

    /// Apply `--sync` entries on top of the defaults.
    ///
    /// `-key` disables, `+key` or a bare key enables. Entries may themselves
    /// be comma-separated. Unknown keys are ignored with a warning.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        let mut enabled = Self::defaults();
        for entry in flags.iter().flat_map(|f| f.as_ref().split(',')) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (disable, key) = match entry.strip_prefix('-') {
                Some(key) => (true, key),
                None => (false, entry.strip_prefix('+').unwrap_or(entry)),
            };
            match SyncerVariant::from_key(key) {
                Some(variant) if disable => {
                    enabled.0.remove(&variant);
                }
                Some(variant) => {
                    enabled.0.insert(variant);
                }
                None => warn!(key, "ignoring unknown syncer in --sync"),
            }
        }
        enabled
    }

    /// Whether a variant is enabled
    pub fn contains(&self, variant: SyncerVariant) -> bool {
        self.0.contains(&variant)
    }

    /// Enabled variants in stable order
    pub fn iter(&self) -> impl Iterator<Item = SyncerVariant> + '_ {
        self.0.iter().copied()
    }
}

impl Default for EnabledControllers {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Pod security standard enforced on virtual namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodSecurityStandard {
    /// Unrestricted
    Privileged,
    /// Prevents known privilege escalations
    Baseline,
    /// Hardened; also enables security-context defaulting
    Restricted,
}

impl PodSecurityStandard {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            PodSecurityStandard::Privileged => "privileged",
            PodSecurityStandard::Baseline => "baseline",
            PodSecurityStandard::Restricted => "restricted",
        }
    }

    /// Parse a flag value; empty means disabled
    pub fn parse_optional(value: &str) -> Result<Option<Self>, Error> {
        match value.trim() {
            "" => Ok(None),
            other => other.parse().map(Some),
        }
    }
}

impl FromStr for PodSecurityStandard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "privileged" => Ok(PodSecurityStandard::Privileged),
            "baseline" => Ok(PodSecurityStandard::Baseline),
            "restricted" => Ok(PodSecurityStandard::Restricted),
            other => Err(Error::validation_for_field(
                "pod security standard",
                "enforce-pod-security-standard",
                format!("unknown standard {other:?}, expected privileged, baseline or restricted"),
            )),
        }
    }
}

/// Admission webhook serving options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookOptions {
    /// HTTPS port
    pub port: u16,
    /// PEM certificate path
    pub cert_path: PathBuf,
    /// PEM key path
    pub key_path: PathBuf,
    /// PEM CA bundle advertised in the webhook configuration
    pub ca_path: Option<PathBuf>,
    /// URL the virtual API server calls; derived from the service name when unset
    pub url: Option<String>,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            port: 9443,
            cert_path: PathBuf::from("/var/run/vkube/webhook/tls.crt"),
            key_path: PathBuf::from("/var/run/vkube/webhook/tls.key"),
            ca_path: None,
            url: None,
        }
    }
}

/// Process-wide sync configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Physical namespace virtual objects are projected into
    pub target_namespace: String,
    /// Namespace the syncer itself runs in
    pub current_namespace: String,
    /// Virtual cluster instance name
    pub name: String,
    /// Physical Service fronting the virtual API server
    pub service_name: String,
    /// Enforced pod security standard, `None` when disabled
    pub pod_security_standard: Option<PodSecurityStandard>,
    /// Selector restricting which physical nodes the real node syncer mirrors
    pub node_selector: Option<String>,
    /// Concurrent reconciles per syncer
    pub max_concurrent_reconciles: usize,
    /// Admission webhook
    pub webhook: WebhookOptions,
}

impl SyncOptions {
    /// Options for the given instance with defaults elsewhere
    pub fn new(
        name: impl Into<String>,
        target_namespace: impl Into<String>,
        current_namespace: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            target_namespace: target_namespace.into(),
            current_namespace: current_namespace.into(),
            service_name: name.clone(),
            name,
            pod_security_standard: None,
            node_selector: None,
            max_concurrent_reconciles: 10,
            webhook: WebhookOptions::default(),
        }
    }
}

/// Collaborators handed to every syncer constructor.
///
/// Built once at startup and shared by `Arc`; nothing in it is mutated after
/// construction. The managers are internally synchronized.
pub struct RegisterContext {
    /// Process shutdown token
    pub cancel: CancellationToken,
    /// Enabled syncer variants
    pub controllers: EnabledControllers,
    /// Sync configuration
    pub options: SyncOptions,
    /// Virtual cluster manager
    pub virtual_manager: Arc<ClusterManager>,
    /// Physical cluster manager
    pub physical_manager: Arc<ClusterManager>,
    /// Physical client defaulting to the current namespace
    pub current_namespace_client: Client,
}
