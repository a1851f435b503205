//! ServiceAccount syncer
//!
//! Only image pull secret references travel. Tokens are never mounted from
//! the physical account: tenant workloads authenticate against the virtual
//! API server.

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::discovery::ApiResource;
use serde_json::Value;

use vkube_common::Result;

use crate::context::RegisterContext;
use crate::generic::GenericSyncer;
use crate::syncer::RegisteredSyncer;
use crate::translate::{NameTranslator, RewriteContext, Translator};

/// Syncer name
pub const NAME: &str = "serviceaccounts";

fn rewrite(ctx: &RewriteContext<'_>, data: &mut Value) {
    if let Some(secrets) = data
        .get_mut("imagePullSecrets")
        .and_then(Value::as_array_mut)
    {
        for secret in secrets {
            if let Some(name) = secret.get("name").and_then(Value::as_str) {
                let physical = ctx.names.physical_name(ctx.virtual_namespace, name);
                secret["name"] = Value::String(physical);
            }
        }
    }
    if let Some(obj) = data.as_object_mut() {
        obj.insert("automountServiceAccountToken".to_string(), Value::Bool(false));
    }
}

/// Translation rules for ServiceAccounts
pub fn translator(names: NameTranslator) -> Result<Translator> {
    Translator::builder(NAME, ApiResource::erase::<ServiceAccount>(&()), names)
        .spec(&["imagePullSecrets"])
        .spec(&["automountServiceAccountToken"])
        .rewrite(rewrite)
        .build()
}

/// Build the ServiceAccount syncer
pub fn create(ctx: &RegisterContext) -> Result<RegisteredSyncer> {
    let names = NameTranslator::new(&ctx.options.target_namespace, &ctx.options.name);
    Ok(GenericSyncer::register(ctx, translator(names)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::DynamicObject;
    use serde_json::json;

    #[test]
    fn story_pull_secret_references_follow_translated_names() {
        let t = translator(NameTranslator::new("vcluster-a", "tenant-a")).unwrap();
        let vobj = DynamicObject::new("builder", t.virtual_resource())
            .within("ci")
            .data(json!({
                "imagePullSecrets": [{ "name": "registry" }],
                "automountServiceAccountToken": true
            }));

        let pobj = t.translate_new(&vobj);
        assert_eq!(
            pobj.data["imagePullSecrets"][0]["name"],
            "registry-x-ci-x-tenant-a"
        );
        assert_eq!(pobj.data["automountServiceAccountToken"], false);

        // idempotent: the rewritten object is already in sync
        assert!(t.translate_update(&pobj, &vobj).is_none());
    }
}
