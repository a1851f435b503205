//! Object identity and the client seam every syncer talks through
//!
//! Syncers never hold a raw `kube::Api`; they go through [`ObjectClient`] so
//! reconcile logic can be exercised against mocks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams, Preconditions};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use vkube_common::error::is_api_status;
use vkube_common::{Error, Result};

use crate::manager::ClusterManager;

/// Identity of an object within one cluster, used as the reconcile request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// Namespace or the empty string for cluster-scoped keys
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Read/write access to one resource kind in one cluster.
///
/// Every write is optimistic: `replace` and `replace_status` carry the
/// resourceVersion of the object passed in, `delete` carries uid and
/// resourceVersion preconditions. A 409 surfaces as [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object; absence is `Ok(None)`
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List all objects in this client's scope
    async fn list(&self) -> Result<Vec<DynamicObject>>;

    /// Create an object
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's main resource
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's status subresource
    async fn replace_status(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object; absence is success
    async fn delete(&self, obj: &DynamicObject) -> Result<()>;

    /// Delete an object with a zero grace period, skipping graceful
    /// termination; absence is success
    async fn delete_now(&self, obj: &DynamicObject) -> Result<()>;

    /// POST `body` to a subresource of `key`, e.g. a pod's `binding`
    async fn create_subresource(&self, key: &ObjectKey, subresource: &str, body: Value) -> Result<()>;

    /// Read the keys stored under `value` in the named index
    fn lookup(&self, index: &str, value: &str) -> Vec<ObjectKey>;
}

/// [`ObjectClient`] backed by the API server and a manager's index cache
pub struct KubeObjectClient {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    manager: Arc<ClusterManager>,
}

impl KubeObjectClient {
    /// Client over `resource` in `manager`'s cluster.
    ///
    /// `namespace` restricts `list`; `None` lists across all namespaces.
    pub fn new(
        manager: Arc<ClusterManager>,
        resource: ApiResource,
        namespace: Option<String>,
    ) -> Self {
        Self {
            client: manager.client(),
            resource,
            namespace,
            manager,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn describe(&self, obj: &DynamicObject) -> String {
        format!("{} {}", self.resource.kind, ObjectKey::from_object(obj))
    }

    async fn delete_with(&self, obj: &DynamicObject, params: DeleteParams) -> Result<()> {
        match self
            .api(obj.metadata.namespace.as_deref())
            .delete(&obj.name_any(), &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_status(&e, 404) => {
                debug!(object = %self.describe(obj), "already deleted");
                Ok(())
            }
            Err(e) => Err(self.map_write_error(obj, e)),
        }
    }

    fn map_write_error(&self, obj: &DynamicObject, err: kube::Error) -> Error {
        if is_api_status(&err, 409) {
            Error::conflict(self.describe(obj), err.to_string())
        } else {
            Error::from(err)
        }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.api(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(self.namespace.as_deref())
            .list(&Default::default())
            .await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| self.map_write_error(obj, e))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.api(obj.metadata.namespace.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| self.map_write_error(obj, e))
    }

    async fn replace_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let body = serde_json::to_vec(obj)
            .map_err(|e| Error::serialization_for_kind(self.resource.kind.clone(), e.to_string()))?;
        self.api(obj.metadata.namespace.as_deref())
            .replace_status(&obj.name_any(), &PostParams::default(), body)
            .await
            .map_err(|e| self.map_write_error(obj, e))
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: obj.uid(),
                resource_version: obj.resource_version(),
            }),
            ..DeleteParams::default()
        };
        self.delete_with(obj, params).await
    }

    async fn delete_now(&self, obj: &DynamicObject) -> Result<()> {
        // uid only: a terminating object keeps changing its resourceVersion
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            preconditions: Some(Preconditions {
                uid: obj.uid(),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        self.delete_with(obj, params).await
    }

    async fn create_subresource(&self, key: &ObjectKey, subresource: &str, body: Value) -> Result<()> {
        let data = serde_json::to_vec(&body)
            .map_err(|e| Error::serialization_for_kind(self.resource.kind.clone(), e.to_string()))?;
        self.api(key.namespace.as_deref())
            .create_subresource::<Value>(subresource, &key.name, &PostParams::default(), data)
            .await
            .map_err(|e| {
                if is_api_status(&e, 409) {
                    Error::conflict(format!("{} {key}/{subresource}", self.resource.kind), e.to_string())
                } else {
                    Error::from(e)
                }
            })?;
        Ok(())
    }

    fn lookup(&self, index: &str, value: &str) -> Vec<ObjectKey> {
        self.manager.lookup(index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("default", "web").to_string(), "default/web");
        assert_eq!(ObjectKey::cluster("node-1").to_string(), "node-1");
    }

    #[test]
    fn test_object_key_from_object() {
        let obj = DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Null,
        };
        let key = ObjectKey::from_object(&obj);
        assert_eq!(key, ObjectKey::namespaced("team-a", "web"));
        assert_eq!(key.namespace_or_empty(), "team-a");
        assert_eq!(ObjectKey::cluster("n").namespace_or_empty(), "");
    }

    #[test]
    fn test_object_keys_order_by_namespace_then_name() {
        let mut keys = vec![
            ObjectKey::namespaced("b", "a"),
            ObjectKey::namespaced("a", "z"),
            ObjectKey::cluster("node"),
        ];
        keys.sort();
        assert_eq!(keys[0], ObjectKey::cluster("node"));
        assert_eq!(keys[1], ObjectKey::namespaced("a", "z"));
    }
}
