//! ConfigMap syncer

use k8s_openapi::api::core::v1::ConfigMap;
use kube::discovery::ApiResource;

use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::syncer::RegisteredSyncer;
use crate::translate::{NameTranslator, Translator};

/// Syncer name
pub const NAME: &str = "configmaps";

/// Translation rules for ConfigMaps
pub fn translator(names: NameTranslator) -> Result<Translator> {
    Translator::builder(NAME, ApiResource::erase::<ConfigMap>(&()), names)
        .spec(&["data"])
        .spec(&["binaryData"])
        .spec(&["immutable"])
        .build()
}

/// Build the ConfigMap syncer
pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
    let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
    Ok(GenericSyncer::register(ctx, translator(names)?))
}
