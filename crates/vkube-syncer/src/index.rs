//! In-memory field indices fed by informers
//!
//! An index maps a derived string key (a back-reference, a translated name,
//! a pod's node name) to the set of objects producing it, so syncers resolve
//! virtual<->physical relationships with a map read instead of a list call.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use crate::object::ObjectKey;

/// Derives the index values for one object
pub type KeyFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// Index registration request
#[derive(Clone)]
pub struct IndexSpec {
    /// Unique index name within a manager
    pub name: String,
    /// Resource the index is computed over
    pub resource: ApiResource,
    /// Namespace the informer is restricted to, `None` for all
    pub namespace: Option<String>,
    /// Value function
    pub key_fn: KeyFn,
}

impl IndexSpec {
    /// Build a spec
    pub fn new(
        name: impl Into<String>,
        resource: ApiResource,
        namespace: Option<String>,
        key_fn: KeyFn,
    ) -> Self {
        Self {
            name: name.into(),
            resource,
            namespace,
            key_fn,
        }
    }

    /// Identity of the informer that feeds this index
    pub(crate) fn watch_id(&self) -> String {
        format!(
            "{}/{}@{}",
            self.resource.api_version,
            self.resource.plural,
            self.namespace.as_deref().unwrap_or("*")
        )
    }
}

/// One live index
pub struct Index {
    key_fn: KeyFn,
    entries: DashMap<String, BTreeSet<ObjectKey>>,
    values_by_object: DashMap<ObjectKey, Vec<String>>,
}

impl Index {
    pub(crate) fn new(key_fn: KeyFn) -> Self {
        Self {
            key_fn,
            entries: DashMap::new(),
            values_by_object: DashMap::new(),
        }
    }

    /// Insert or refresh an object
    pub fn apply(&self, obj: &DynamicObject) {
        let key = ObjectKey::from_object(obj);
        let mut values = (self.key_fn)(obj);
        values.sort();
        values.dedup();

        self.remove_entries(&key);
        for value in &values {
            self.entries
                .entry(value.clone())
                .or_default()
                .insert(key.clone());
        }
        if !values.is_empty() {
            self.values_by_object.insert(key, values);
        }
    }

    /// Forget an object
    pub fn delete(&self, key: &ObjectKey) {
        self.remove_entries(key);
    }

    /// Drop every object not in `live` (relist after a watch restart)
    pub fn retain(&self, live: &HashSet<ObjectKey>) {
        let stale: Vec<ObjectKey> = self
            .values_by_object
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.remove_entries(&key);
        }
    }

    /// Objects stored under `value`, sorted
    pub fn lookup(&self, value: &str) -> Vec<ObjectKey> {
        self.entries
            .get(value)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_entries(&self, key: &ObjectKey) {
        let Some((_, old)) = self.values_by_object.remove(key) else {
            return;
        };
        for value in old {
            let emptied = match self.entries.get_mut(&value) {
                Some(mut set) => {
                    set.remove(key);
                    set.is_empty()
                }
                None => false,
            };
            if emptied {
                self.entries.remove_if(&value, |_, set| set.is_empty());
            }
        }
    }
}
