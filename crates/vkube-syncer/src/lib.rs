//! Synchronization engine projecting virtual-cluster objects onto a namespace
//! of the physical cluster.
//!
//! A [`syncer::RegisteredSyncer`] pairs a reconcile capability with optional
//! startup capabilities. The [`register`] module wires them onto the two
//! [`manager::ClusterManager`]s in a fixed order: initializers, indices,
//! queues.

#![deny(missing_docs)]

pub mod context;
pub mod generic;
pub mod index;
pub mod manager;
pub mod object;
pub mod queue;
pub mod register;
pub mod resources;
pub mod syncer;
pub mod translate;

pub use context::{
    EnabledControllers, PodSecurityStandard, RegisterContext, SyncOptions, SyncerVariant,
    WebhookOptions,
};
pub use generic::GenericSyncer;
pub use manager::{ClusterManager, ClusterRole};
pub use object::{ObjectClient, ObjectKey};
pub use queue::{QueueOptions, ReconcileAction, WorkQueue};
pub use syncer::{FakeSyncer, RegisteredSyncer, Syncer, SyncerKind};
pub use translate::{NameTranslator, Translator};
