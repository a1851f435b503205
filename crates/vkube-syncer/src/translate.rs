//! Translation between virtual and physical object representations
//!
//! A [`Translator`] is pure configuration: which fields travel downward
//! (spec), which travel upward (status), which the physical API server owns,
//! and how names map. Spec and status field sets are validated disjoint at
//! construction so a syncer can never copy a field in both directions.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::Value;

use vkube_common::kube_utils::{deterministic_hash, DNS_LABEL_MAX_LEN};
use vkube_common::{
    Error, Result, LAST_APPLIED_ANNOTATION, MANAGED_ANNOTATION, MANAGED_BY_LABEL, MANAGED_VALUE,
    OBJECT_NAMESPACE_ANNOTATION, OBJECT_NAMESPACE_LABEL, OBJECT_NAME_ANNOTATION, RESERVED_PREFIX,
};

use crate::object::ObjectKey;

/// Path of a JSON field below the object root, e.g. `&["spec", "clusterIP"]`
pub type FieldPath = &'static [&'static str];

/// Annotation listing the tenant annotation keys copied onto a physical object
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "vkube.dev/managed-annotations";

/// Annotation listing the tenant label keys copied onto a physical object
pub const MANAGED_LABELS_ANNOTATION: &str = "vkube.dev/managed-labels";

const NAME_SEPARATOR: &str = "-x-";
const NAME_HASH_LEN: usize = 10;

/// Read a nested field
pub fn get_path<'a>(value: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, segment| v.get(segment))
}

/// Write (`Some`) or remove (`None`) a nested field.
///
/// Missing parents are created on write; removal never creates parents.
pub fn set_path(value: &mut Value, path: FieldPath, new: Option<Value>) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = value;
    for segment in parents {
        if new.is_none() && current.get(segment).is_none() {
            return;
        }
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default())),
            _ => return,
        };
    }

    match (current, new) {
        (Value::Object(map), Some(v)) => {
            map.insert(last.to_string(), v);
        }
        (Value::Object(map), None) => {
            map.remove(*last);
        }
        (other, Some(v)) => {
            let mut map = serde_json::Map::new();
            map.insert(last.to_string(), v);
            *other = Value::Object(map);
        }
        (_, None) => {}
    }
}

fn is_prefix(a: FieldPath, b: FieldPath) -> bool {
    a.len() <= b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn overlaps(a: FieldPath, b: FieldPath) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

fn render(path: FieldPath) -> String {
    path.join(".")
}

/// Maps virtual identities onto the target namespace of the physical cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTranslator {
    target_namespace: String,
    instance: String,
}

impl NameTranslator {
    /// Translator for one virtual cluster instance
    pub fn new(target_namespace: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            target_namespace: target_namespace.into(),
            instance: instance.into(),
        }
    }

    /// Physical namespace all namespaced objects are projected into
    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    /// Virtual cluster instance name
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Physical name for a virtual object.
    ///
    /// `{name}-x-{namespace}-x-{instance}` when that form is a valid label
    /// and parses back unambiguously, otherwise a truncated prefix plus a
    /// hash of the full identity.
    pub fn physical_name(&self, virtual_namespace: &str, virtual_name: &str) -> String {
        let plain = format!(
            "{virtual_name}{NAME_SEPARATOR}{virtual_namespace}{NAME_SEPARATOR}{}",
            self.instance
        );
        let ambiguous = virtual_name.contains(NAME_SEPARATOR)
            || virtual_name.ends_with("-x")
            || virtual_namespace.contains(NAME_SEPARATOR)
            || virtual_namespace.starts_with("x-");
        if !ambiguous && plain.len() <= DNS_LABEL_MAX_LEN {
            return plain;
        }

        let digest = deterministic_hash(&format!(
            "{virtual_namespace}/{virtual_name}/{}",
            self.instance
        ));
        let prefix_len = DNS_LABEL_MAX_LEN - NAME_HASH_LEN - 1;
        let prefix: String = plain.chars().take(prefix_len).collect();
        let prefix = prefix.trim_end_matches(['-', '.']);
        format!("{prefix}-{}", &digest[..NAME_HASH_LEN])
    }

    /// Physical key for a virtual key
    pub fn physical_key(&self, key: &ObjectKey) -> ObjectKey {
        ObjectKey::namespaced(
            self.target_namespace.clone(),
            self.physical_name(key.namespace_or_empty(), &key.name),
        )
    }
}

/// Rewrite hook input
pub struct RewriteContext<'a> {
    /// Name mapping, for translating references to other objects
    pub names: &'a NameTranslator,
    /// Namespace of the virtual object being translated
    pub virtual_namespace: &'a str,
    /// Current physical data on update, `None` on create
    pub current: Option<&'a Value>,
}

impl RewriteContext<'_> {
    /// Physical name of another object in the same virtual namespace
    pub fn physical_name(&self, virtual_name: &str) -> String {
        self.names.physical_name(self.virtual_namespace, virtual_name)
    }

    /// Narrow an equality label selector to physical pods projected from
    /// this instance and this virtual namespace.
    ///
    /// Tenant label keys are copied verbatim onto physical pods, so an
    /// unscoped selector would match pods of other namespaces or tenants.
    pub fn scope_selector(&self, selector: &mut serde_json::Map<String, Value>) {
        selector.insert(
            MANAGED_BY_LABEL.to_string(),
            Value::String(self.names.instance.clone()),
        );
        selector.insert(
            OBJECT_NAMESPACE_LABEL.to_string(),
            Value::String(self.virtual_namespace.to_string()),
        );
    }
}

/// Kind-specific fix-up applied to translated physical data
pub type RewriteFn = fn(&RewriteContext<'_>, &mut Value);

/// Predicate selecting which virtual objects are synced
pub type FilterFn = fn(&DynamicObject) -> bool;

/// How a physical object relates to a virtual key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Managed by this instance on behalf of the key
    Owned,
    /// No ownership marker: user-authored
    Unmanaged,
    /// Managed by another virtual cluster instance
    OtherInstance(String),
    /// Managed by this instance for a different virtual object
    OtherObject(ObjectKey),
}

/// Per-kind translation configuration
#[derive(Debug, Clone)]
pub struct Translator {
    name: &'static str,
    virtual_resource: ApiResource,
    physical_resource: ApiResource,
    names: NameTranslator,
    spec_fields: Vec<FieldPath>,
    status_fields: Vec<FieldPath>,
    server_fields: Vec<FieldPath>,
    rewrite: Option<RewriteFn>,
    filter: Option<FilterFn>,
}

/// Builder for [`Translator`]
pub struct TranslatorBuilder {
    inner: Translator,
}

impl TranslatorBuilder {
    /// Field copied virtual -> physical
    pub fn spec(mut self, path: FieldPath) -> Self {
        self.inner.spec_fields.push(path);
        self
    }

    /// Field copied physical -> virtual
    pub fn status(mut self, path: FieldPath) -> Self {
        self.inner.status_fields.push(path);
        self
    }

    /// Field below a spec path whose value the physical API server owns
    pub fn server_owned(mut self, path: FieldPath) -> Self {
        self.inner.server_fields.push(path);
        self
    }

    /// Kind-specific rewrite of translated physical data
    pub fn rewrite(mut self, rewrite: RewriteFn) -> Self {
        self.inner.rewrite = Some(rewrite);
        self
    }

    /// Only sync virtual objects matching `filter`
    pub fn filter(mut self, filter: FilterFn) -> Self {
        self.inner.filter = Some(filter);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Translator> {
        let t = self.inner;
        let invalid = |path: FieldPath, msg: &str| {
            Error::validation_for_field(t.name, render(path), msg.to_string())
        };

        for path in t.spec_fields.iter().chain(&t.status_fields) {
            match path.first() {
                None => return Err(invalid(path, "empty field path")),
                Some(&"metadata" | &"apiVersion" | &"kind") => {
                    return Err(invalid(path, "object identity fields cannot be translated"))
                }
                Some(_) => {}
            }
        }
        for spec in &t.spec_fields {
            if let Some(status) = t.status_fields.iter().find(|s| overlaps(spec, s)) {
                return Err(invalid(
                    spec,
                    &format!("spec field overlaps status field {}", render(status)),
                ));
            }
        }
        for server in &t.server_fields {
            if !t
                .spec_fields
                .iter()
                .any(|spec| spec.len() < server.len() && is_prefix(spec, server))
            {
                return Err(invalid(server, "server-owned field must sit below a spec field"));
            }
        }
        Ok(t)
    }
}

impl Translator {
    /// Start a translator for a kind that keeps the same resource on both sides
    pub fn builder(name: &'static str, resource: ApiResource, names: NameTranslator) -> TranslatorBuilder {
        TranslatorBuilder {
            inner: Translator {
                name,
                virtual_resource: resource.clone(),
                physical_resource: resource,
                names,
                spec_fields: Vec::new(),
                status_fields: Vec::new(),
                server_fields: Vec::new(),
                rewrite: None,
                filter: None,
            },
        }
    }

    /// Syncer name used in errors
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resource in the virtual cluster
    pub fn virtual_resource(&self) -> &ApiResource {
        &self.virtual_resource
    }

    /// Resource in the physical cluster
    pub fn physical_resource(&self) -> &ApiResource {
        &self.physical_resource
    }

    /// Name mapping
    pub fn names(&self) -> &NameTranslator {
        &self.names
    }

    /// Whether a virtual object is synced at all
    pub fn is_included(&self, vobj: &DynamicObject) -> bool {
        self.filter.map_or(true, |f| f(vobj))
    }

    /// Physical key for a virtual key
    pub fn physical_key(&self, key: &ObjectKey) -> ObjectKey {
        self.names.physical_key(key)
    }

    /// Owning virtual key recorded on a physical object managed by this instance
    pub fn virtual_key_of(&self, pobj: &DynamicObject) -> Option<ObjectKey> {
        let annotations = pobj.metadata.annotations.as_ref()?;
        if annotations.get(MANAGED_ANNOTATION).map(String::as_str) != Some(MANAGED_VALUE) {
            return None;
        }
        if pobj.labels().get(MANAGED_BY_LABEL) != Some(&self.names.instance) {
            return None;
        }
        let name = annotations.get(OBJECT_NAME_ANNOTATION)?;
        Some(match annotations.get(OBJECT_NAMESPACE_ANNOTATION) {
            Some(ns) if !ns.is_empty() => ObjectKey::namespaced(ns.clone(), name.clone()),
            _ => ObjectKey::cluster(name.clone()),
        })
    }

    /// Classify a physical object against the virtual key it should belong to
    pub fn ownership(&self, pobj: &DynamicObject, key: &ObjectKey) -> Ownership {
        let managed = pobj
            .annotations()
            .get(MANAGED_ANNOTATION)
            .is_some_and(|v| v == MANAGED_VALUE);
        if !managed {
            return Ownership::Unmanaged;
        }
        match pobj.labels().get(MANAGED_BY_LABEL) {
            Some(instance) if instance == &self.names.instance => {}
            other => return Ownership::OtherInstance(other.cloned().unwrap_or_default()),
        }
        match self.virtual_key_of(pobj) {
            Some(owner) if &owner == key => Ownership::Owned,
            Some(owner) => Ownership::OtherObject(owner),
            None => Ownership::Unmanaged,
        }
    }

    /// Physical object for a virtual object that has no counterpart yet
    pub fn translate_new(&self, vobj: &DynamicObject) -> DynamicObject {
        let key = ObjectKey::from_object(vobj);
        let mut data = Value::Object(Default::default());
        for path in &self.spec_fields {
            if let Some(v) = get_path(&vobj.data, path) {
                set_path(&mut data, path, Some(v.clone()));
            }
        }
        for path in &self.server_fields {
            set_path(&mut data, path, None);
        }
        self.apply_rewrite(&key, None, &mut data);

        let pkey = self.physical_key(&key);
        let mut pobj = DynamicObject::new(&pkey.name, &self.physical_resource).data(data);
        pobj.metadata.namespace = pkey.namespace;
        let (labels, annotations) = self.physical_metadata(vobj, &BTreeMap::new(), &BTreeMap::new());
        pobj.metadata.labels = Some(labels);
        pobj.metadata.annotations = Some(annotations);
        pobj
    }

    /// Updated physical object, or `None` when it already matches the virtual one
    pub fn translate_update(&self, pobj: &DynamicObject, vobj: &DynamicObject) -> Option<DynamicObject> {
        let key = ObjectKey::from_object(vobj);
        let mut data = pobj.data.clone();
        for path in &self.spec_fields {
            set_path(&mut data, path, get_path(&vobj.data, path).cloned());
        }
        for path in &self.server_fields {
            set_path(&mut data, path, get_path(&pobj.data, path).cloned());
        }
        self.apply_rewrite(&key, Some(&pobj.data), &mut data);

        let current_labels = pobj.metadata.labels.clone().unwrap_or_default();
        let current_annotations = pobj.metadata.annotations.clone().unwrap_or_default();
        let (labels, annotations) =
            self.physical_metadata(vobj, &current_labels, &current_annotations);

        if data == pobj.data && labels == current_labels && annotations == current_annotations {
            return None;
        }

        let mut updated = pobj.clone();
        updated.data = data;
        updated.metadata.labels = Some(labels);
        updated.metadata.annotations = Some(annotations);
        Some(updated)
    }

    /// Virtual object with physical status mirrored in, or `None` when unchanged
    pub fn translate_status(&self, vobj: &DynamicObject, pobj: &DynamicObject) -> Option<DynamicObject> {
        if self.status_fields.is_empty() {
            return None;
        }
        let mut data = vobj.data.clone();
        for path in &self.status_fields {
            set_path(&mut data, path, get_path(&pobj.data, path).cloned());
        }
        if data == vobj.data {
            return None;
        }
        let mut updated = vobj.clone();
        updated.data = data;
        Some(updated)
    }

    fn apply_rewrite(&self, key: &ObjectKey, current: Option<&Value>, data: &mut Value) {
        if let Some(rewrite) = self.rewrite {
            let ctx = RewriteContext {
                names: &self.names,
                virtual_namespace: key.namespace_or_empty(),
                current,
            };
            rewrite(&ctx, data);
        }
    }

    /// Desired labels and annotations of the physical object.
    ///
    /// Tenant keys copied on a previous pass are tracked in annotations so a
    /// key removed in the virtual cluster is removed physically, while keys
    /// added by physical-side controllers survive.
    fn physical_metadata(
        &self,
        vobj: &DynamicObject,
        current_labels: &BTreeMap<String, String>,
        current_annotations: &BTreeMap<String, String>,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let copyable = |k: &String| !k.starts_with(RESERVED_PREFIX) && k != LAST_APPLIED_ANNOTATION;

        let tenant_labels: BTreeMap<String, String> = vobj
            .labels()
            .iter()
            .filter(|(k, _)| copyable(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let tenant_annotations: BTreeMap<String, String> = vobj
            .annotations()
            .iter()
            .filter(|(k, _)| copyable(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let previously = |key: &str| -> Vec<String> {
            current_annotations
                .get(key)
                .map(|s| s.split(',').filter(|k| !k.is_empty()).map(str::to_string).collect())
                .unwrap_or_default()
        };
        let old_labels = previously(MANAGED_LABELS_ANNOTATION);
        let old_annotations = previously(MANAGED_ANNOTATIONS_ANNOTATION);

        let mut labels: BTreeMap<String, String> = current_labels
            .iter()
            .filter(|(k, _)| !old_labels.contains(k) && !k.starts_with(RESERVED_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.extend(tenant_labels.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), self.names.instance.clone());
        if let Some(namespace) = vobj.namespace() {
            labels.insert(OBJECT_NAMESPACE_LABEL.to_string(), namespace);
        }

        let mut annotations: BTreeMap<String, String> = current_annotations
            .iter()
            .filter(|(k, _)| !old_annotations.contains(k) && !k.starts_with(RESERVED_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        annotations.extend(tenant_annotations.clone());
        annotations.insert(MANAGED_ANNOTATION.to_string(), MANAGED_VALUE.to_string());
        annotations.insert(OBJECT_NAME_ANNOTATION.to_string(), vobj.name_any());
        annotations.insert(
            OBJECT_NAMESPACE_ANNOTATION.to_string(),
            vobj.namespace().unwrap_or_default(),
        );
        if !tenant_labels.is_empty() {
            annotations.insert(
                MANAGED_LABELS_ANNOTATION.to_string(),
                tenant_labels.keys().cloned().collect::<Vec<_>>().join(","),
            );
        }
        if !tenant_annotations.is_empty() {
            annotations.insert(
                MANAGED_ANNOTATIONS_ANNOTATION.to_string(),
                tenant_annotations.keys().cloned().collect::<Vec<_>>().join(","),
            );
        }

        (labels, annotations)
    }
}
