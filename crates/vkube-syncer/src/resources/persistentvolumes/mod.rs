//! Persistent volume syncers: real (mirror physical volumes bound to this
//! instance's claims) and fake (synthesize a placeholder for every volume
//! name a virtual claim is bound to)

mod fake;
mod real;

use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

pub use fake::{synthesize_volume, FakePersistentVolumeSyncer, CLAIM_VOLUME_NAME_INDEX};
pub use real::PersistentVolumeSyncer;

use crate::object::ObjectKey;

/// Syncer name of the real persistent volume syncer
pub const NAME: &str = "persistentvolumes";

/// Syncer name of the fake persistent volume syncer
pub const FAKE_NAME: &str = "fake-persistentvolumes";

pub(crate) fn volume_resource() -> ApiResource {
    ApiResource::erase::<PersistentVolume>(&())
}

/// Namespace and name of the claim a volume is reserved for
pub(crate) fn claim_ref(volume: &DynamicObject) -> Option<ObjectKey> {
    let claim = volume.data.pointer("/spec/claimRef")?;
    let namespace = claim.get("namespace").and_then(Value::as_str)?;
    let name = claim.get("name").and_then(Value::as_str)?;
    Some(ObjectKey::namespaced(namespace, name))
}

/// `spec.claimRef` pointing at `claim`
pub(crate) fn claim_ref_value(claim: &ObjectKey, uid: Option<&str>) -> Value {
    let mut reference = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "namespace": claim.namespace_or_empty(),
        "name": claim.name,
    });
    if let Some(uid) = uid {
        reference["uid"] = Value::String(uid.to_string());
    }
    reference
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_ref_round_trip() {
        let key = ObjectKey::namespaced("shop", "data");
        let volume = DynamicObject::new("pvc-1", &volume_resource())
            .data(json!({ "spec": { "claimRef": claim_ref_value(&key, Some("u1")) } }));
        assert_eq!(claim_ref(&volume), Some(key));
        assert_eq!(volume.data["spec"]["claimRef"]["uid"], "u1");

        let unclaimed = DynamicObject::new("pvc-2", &volume_resource()).data(json!({ "spec": {} }));
        assert_eq!(claim_ref(&unclaimed), None);
    }
}
