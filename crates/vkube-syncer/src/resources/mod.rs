//! Concrete syncers

pub mod configmaps;
pub mod namespace;
pub mod nodes;
pub mod persistentvolumeclaims;
pub mod persistentvolumes;
pub mod pods;
pub mod secrets;
pub mod serviceaccounts;
pub mod services;

use vkube_common::Result;

use crate::context::{RegisterContext, SyncerVariant};
use crate::syncer::RegisteredSyncer;

/// Build the syncer for one variant
pub fn build(variant: SyncerVariant, ctx: &RegisterContext) -> Result<RegisteredSyncer> {
    match variant {
        SyncerVariant::Services => services::create(ctx),
        SyncerVariant::ConfigMaps => configmaps::create(ctx),
        SyncerVariant::Secrets => secrets::create(ctx),
        SyncerVariant::ServiceAccounts => serviceaccounts::create(ctx),
        SyncerVariant::Pods => pods::PodSyncer::create(ctx),
        SyncerVariant::PersistentVolumeClaims => {
            persistentvolumeclaims::PersistentVolumeClaimSyncer::create(ctx)
        }
        SyncerVariant::Nodes => nodes::NodeSyncer::create(ctx),
        SyncerVariant::FakeNodes => nodes::FakeNodeSyncer::create(ctx),
        SyncerVariant::PersistentVolumes => persistentvolumes::PersistentVolumeSyncer::create(ctx),
        SyncerVariant::FakePersistentVolumes => {
            persistentvolumes::FakePersistentVolumeSyncer::create(ctx)
        }
    }
}
