//! Secret syncer
//!
//! Service-account token secrets are minted by the virtual cluster's own
//! token controller and are meaningless physically, so they are filtered out.

use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::syncer::RegisteredSyncer;
use crate::translate::{NameTranslator, Translator};

/// Syncer name
pub const NAME: &str = "secrets";

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

fn is_syncable(obj: &DynamicObject) -> bool {
    obj.data.get("type").and_then(|t| t.as_str()) != Some(SERVICE_ACCOUNT_TOKEN_TYPE)
}

/// Translation rules for Secrets
pub fn translator(names: NameTranslator) -> Result<Translator> {
    Translator::builder(NAME, ApiResource::erase::<Secret>(&()), names)
        .spec(&["data"])
        .spec(&["type"])
        .spec(&["immutable"])
        .filter(is_syncable)
        .build()
}

/// Build the Secret syncer
pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
    let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
    Ok(GenericSyncer::register(ctx, translator(names)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(type_: &str) -> DynamicObject {
        DynamicObject::new("creds", &ApiResource::erase::<Secret>(&()))
            .within("default")
            .data(json!({ "type": type_, "data": { "password": "aHVudGVyMg==" } }))
    }

    #[test]
    fn story_service_account_tokens_stay_virtual() {
        let t = translator(NameTranslator::new("vcluster-a", "tenant-a")).unwrap();
        assert!(t.is_included(&secret("Opaque")));
        assert!(!t.is_included(&secret(SERVICE_ACCOUNT_TOKEN_TYPE)));

        let pobj = t.translate_new(&secret("Opaque"));
        assert_eq!(pobj.data["type"], "Opaque");
        assert_eq!(pobj.data["data"]["password"], "aHVudGVyMg==");
    }
}
