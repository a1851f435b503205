//! Syncer capabilities
//!
//! A registered syncer is a name plus exactly one reconcile capability (real
//! or fake) and two optional startup capabilities. The capability set is
//! fixed when the syncer is built; registration matches on it once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use tokio_util::sync::CancellationToken;

use vkube_common::Result;

use crate::context::RegisterContext;
use crate::object::ObjectKey;
use crate::queue::ReconcileAction;

/// Reconciler projecting one virtual kind onto the physical cluster
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Name used in logs, metrics and errors
    fn name(&self) -> &str;

    /// Kind watched in the virtual cluster
    fn virtual_resource(&self) -> ApiResource;

    /// Kind written in the physical cluster
    fn physical_resource(&self) -> ApiResource;

    /// Namespace the physical watch is restricted to, `None` for all
    fn physical_namespace(&self) -> Option<String>;

    /// Virtual keys a physical event should reconcile
    fn virtual_keys_for_physical(&self, pobj: &DynamicObject) -> Vec<ObjectKey>;

    /// Reconcile one virtual key
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction>;
}

/// Maps an event on a secondary resource to fake object keys
pub type TriggerMap = Arc<dyn Fn(&DynamicObject) -> Vec<ObjectKey> + Send + Sync>;

/// Virtual-cluster watch feeding a fake syncer
#[derive(Clone)]
pub struct FakeTrigger {
    /// Watched kind
    pub resource: ApiResource,
    /// Event to key mapping
    pub map: TriggerMap,
}

/// Reconciler synthesizing objects in the virtual cluster only
#[async_trait]
pub trait FakeSyncer: Send + Sync {
    /// Name used in logs, metrics and errors
    fn name(&self) -> &str;

    /// Kind synthesized in the virtual cluster
    fn virtual_resource(&self) -> ApiResource;

    /// Additional virtual watches that require a fake object
    fn triggers(&self) -> Vec<FakeTrigger>;

    /// Reconcile one fake object key
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction>;
}

/// One-time prerequisite run before any reconcile
#[async_trait]
pub trait Initializer: Send + Sync {
    /// Ensure prerequisites; must stop promptly once `cancel` fires
    async fn initialize(&self, cancel: CancellationToken) -> Result<()>;
}

/// Installs lookup indices before the caches start
pub trait IndicesRegisterer: Send + Sync {
    /// Register indices on the managers in `ctx`
    fn register_indices(&self, ctx: &RegisterContext) -> Result<()>;
}

/// Reconcile capability of a registered syncer
#[derive(Clone)]
pub enum SyncerKind {
    /// Writes to the physical cluster
    Real(Arc<dyn Syncer>),
    /// Synthesizes virtual objects only
    Fake(Arc<dyn FakeSyncer>),
}

/// A built syncer and its capabilities
#[derive(Clone)]
pub struct RegisteredSyncer {
    /// Name used in logs and errors
    pub name: String,
    /// Reconcile capability
    pub kind: SyncerKind,
    /// Optional prerequisite step
    pub initializer: Option<Arc<dyn Initializer>>,
    /// Optional index registration
    pub indices: Option<Arc<dyn IndicesRegisterer>>,
}

impl RegisteredSyncer {
    /// Wrap a real syncer
    pub fn real(syncer: Arc<dyn Syncer>) -> Self {
        Self {
            name: syncer.name().to_string(),
            kind: SyncerKind::Real(syncer),
            initializer: None,
            indices: None,
        }
    }

    /// Wrap a fake syncer
    pub fn fake(syncer: Arc<dyn FakeSyncer>) -> Self {
        Self {
            name: syncer.name().to_string(),
            kind: SyncerKind::Fake(syncer),
            initializer: None,
            indices: None,
        }
    }

    /// Attach a prerequisite step
    pub fn with_initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Attach index registration
    pub fn with_indices(mut self, indices: Arc<dyn IndicesRegisterer>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// Whether this syncer writes to the physical cluster
    pub fn is_real(&self) -> bool {
        matches!(self.kind, SyncerKind::Real(_))
    }
}

impl fmt::Debug for RegisteredSyncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSyncer")
            .field("name", &self.name)
            .field("real", &self.is_real())
            .field("initializer", &self.initializer.is_some())
            .field("indices", &self.indices.is_some())
            .finish()
    }
}
