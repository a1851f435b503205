//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for both clusters, namespace bootstrap, and
//! discovery-driven server-side apply of manifest bundles.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use aws_lc_rs::digest;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use tracing::{debug, trace, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length of a DNS-1123 label (object names of most kinds, namespaces)
pub const DNS_LABEL_MAX_LEN: usize = 63;

/// Create a kube client from an optional kubeconfig path.
///
/// `default_namespace` overrides the namespace that `Api::default_namespaced`
/// resolves to, which is how the current-namespace client is built.
pub async fn create_client(
    kubeconfig: Option<&Path>,
    default_namespace: Option<&str>,
) -> Result<Client, Error> {
    let client_error = |what: String| Error::internal_with_context("create_client", what);
    let mut config = match kubeconfig {
        Some(path) => {
            let file = Kubeconfig::read_from(path)
                .map_err(|e| client_error(format!("read kubeconfig {}: {e}", path.display())))?;
            Config::from_custom_kubeconfig(file, &KubeConfigOptions::default())
                .await
                .map_err(|e| client_error(format!("load kubeconfig {}: {e}", path.display())))?
        }
        None => Config::infer()
            .await
            .map_err(|e| client_error(format!("infer in-cluster or local config: {e}")))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    if let Some(ns) = default_namespace {
        config.default_namespace = ns.to_string();
    }
    Client::try_from(config).map_err(|e| client_error(format!("build client: {e}")))
}

/// Server-side apply a namespace carrying `annotations`.
///
/// Idempotent and safe against concurrent creators; annotations owned by
/// other field managers survive.
pub async fn ensure_namespace_with_annotations(
    client: &Client,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let desired = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "annotations": annotations
        }
    });
    namespaces
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&desired))
        .await?;
    debug!(namespace = %name, "namespace ensured");
    Ok(())
}

/// One parsed document of a manifest bundle
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Resolved group, version and kind
    pub gvk: GroupVersionKind,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
    /// Full document as applied
    pub body: serde_json::Value,
}

impl Manifest {
    /// Parse a JSON or YAML document and pull out its identity
    pub fn parse(document: &str) -> Result<Self, Error> {
        let body: serde_json::Value = if document.trim_start().starts_with('{') {
            serde_json::from_str(document)
                .map_err(|e| Error::serialization(format!("invalid JSON manifest: {e}")))?
        } else {
            crate::yaml::parse_yaml(document)
                .map_err(|e| Error::serialization(format!("invalid YAML manifest: {e}")))?
        };

        let text = |pointer: &str| body.pointer(pointer).and_then(|v| v.as_str()).map(str::to_string);
        let kind = text("/kind").ok_or_else(|| Error::validation("manifest missing kind"))?;
        let api_version =
            text("/apiVersion").ok_or_else(|| Error::validation_for(&kind, "manifest missing apiVersion"))?;
        let name = text("/metadata/name")
            .ok_or_else(|| Error::validation_for(&kind, "manifest missing metadata.name"))?;
        let namespace = text("/metadata/namespace");
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version),
        };

        Ok(Self {
            gvk: GroupVersionKind { group, version, kind },
            name,
            namespace,
            body,
        })
    }

    /// Position in the apply sequence; dependencies of other kinds come first
    pub fn apply_rank(&self) -> u8 {
        match self.gvk.kind.as_str() {
            "Namespace" => 0,
            "CustomResourceDefinition" => 1,
            "ServiceAccount" => 2,
            "ClusterRole" | "Role" => 3,
            "ClusterRoleBinding" | "RoleBinding" => 4,
            "ConfigMap" | "Secret" => 5,
            "Service" => 6,
            "Deployment" | "DaemonSet" | "StatefulSet" => 7,
            _ => 8,
        }
    }

    /// Namespaces and CRDs must exist before anything else can resolve
    fn is_foundational(&self) -> bool {
        self.apply_rank() <= 1
    }

    /// Server-side apply this document, resolving its type through `discovery`
    pub async fn apply(&self, client: &Client, discovery: &Discovery) -> Result<(), Error> {
        let kind = &self.gvk.kind;
        let (resource, caps) = discovery.resolve_gvk(&self.gvk).ok_or_else(|| {
            Error::validation_for(kind, format!("unknown resource type {}", self.gvk.api_version()))
        })?;
        let api: Api<DynamicObject> = match (caps.scope, self.namespace.as_deref()) {
            (Scope::Cluster, _) => Api::all_with(client.clone(), &resource),
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, &resource),
            (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), &resource),
        };
        api.patch(
            &self.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&self.body),
        )
        .await?;
        trace!(kind = %kind, name = %self.name, namespace = ?self.namespace, "manifest applied");
        Ok(())
    }
}

/// Discovery is slow to converge after CRD installs, so it backs off from 1s
async fn discover(client: &Client) -> Result<Discovery, Error> {
    let config = RetryConfig {
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::with_max_attempts(5)
    };
    retry_with_backoff(&config, "api-discovery", || async move {
        Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::internal_with_context("api-discovery", e.to_string()))
    })
    .await
}

/// Apply a bundle of manifest documents in dependency order.
///
/// Every document is parsed first. Namespaces and CRDs are applied first and
/// fail fast; discovery is refreshed after CRDs so later documents resolve
/// the new types. Remaining documents, and documents that fail to parse, are
/// best-effort: the first failure is returned after the rest were tried.
pub async fn apply_manifests_with_discovery(
    client: &Client,
    documents: &[impl AsRef<str>],
) -> Result<(), Error> {
    let mut first_error: Option<Error> = None;
    let mut parsed = Vec::with_capacity(documents.len());
    for document in documents {
        match Manifest::parse(document.as_ref()) {
            Ok(manifest) => parsed.push(manifest),
            Err(e) => {
                warn!(error = %e, "skipping unparseable manifest");
                first_error.get_or_insert(e);
            }
        }
    }
    if parsed.is_empty() {
        return first_error.map_or(Ok(()), Err);
    }
    parsed.sort_by_key(Manifest::apply_rank);
    let (foundational, rest): (Vec<Manifest>, Vec<Manifest>) =
        parsed.into_iter().partition(Manifest::is_foundational);

    let mut discovery = discover(client).await?;
    for manifest in &foundational {
        manifest.apply(client, &discovery).await?;
    }
    let installed_crds = foundational
        .iter()
        .any(|m| m.gvk.kind == "CustomResourceDefinition");
    if installed_crds && !rest.is_empty() {
        discovery = discover(client).await?;
    }

    for manifest in &rest {
        if let Err(e) = manifest.apply(client, &discovery).await {
            warn!(error = %e, kind = %manifest.gvk.kind, name = %manifest.name, "manifest apply failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// First 8 bytes of the SHA-256 of `input` as 16 lowercase hex digits.
///
/// Stable across builds, so safe to persist in annotations and object names.
pub fn deterministic_hash(input: &str) -> String {
    let sha = digest::digest(&digest::SHA256, input.as_bytes());
    sha.as_ref()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Check whether `name` is a valid DNS-1123 label
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= DNS_LABEL_MAX_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_identity_from_yaml_and_json() {
        let yaml = Manifest::parse("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: shop\n").unwrap();
        assert_eq!(yaml.gvk, GroupVersionKind::gvk("apps", "v1", "Deployment"));
        assert_eq!(yaml.name, "web");
        assert_eq!(yaml.namespace.as_deref(), Some("shop"));

        let json = Manifest::parse(r#"{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}}"#).unwrap();
        assert_eq!(json.gvk, GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(json.namespace, None);
    }

    #[test]
    fn test_nested_kind_does_not_confuse_identity() {
        let manifest = Manifest::parse(
            "apiVersion: rbac.authorization.k8s.io/v1\nsubjects:\n  - kind: User\n    name: a\nkind: RoleBinding\nmetadata:\n  name: rb\n",
        )
        .unwrap();
        assert_eq!(manifest.gvk.kind, "RoleBinding");
    }

    #[test]
    fn test_incomplete_manifests_are_rejected() {
        assert!(Manifest::parse("apiVersion: v1\nmetadata:\n  name: x\n").is_err());
        assert!(Manifest::parse("kind: ConfigMap\nmetadata:\n  name: x\n").is_err());
        let err = Manifest::parse("apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn story_foundations_are_applied_first() {
        let mut bundle: Vec<Manifest> = ["Deployment", "ConfigMap", "Namespace", "Role", "Widget"]
            .iter()
            .map(|kind| {
                Manifest::parse(&format!("apiVersion: v1\nkind: {kind}\nmetadata:\n  name: x\n")).unwrap()
            })
            .collect();
        bundle.sort_by_key(Manifest::apply_rank);
        let kinds: Vec<&str> = bundle.iter().map(|m| m.gvk.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Namespace", "Role", "ConfigMap", "Deployment", "Widget"]);
        assert!(bundle[0].is_foundational());
        assert!(!bundle[1].is_foundational());
    }

    #[test]
    fn test_deterministic_hash_is_stable() {
        let a = deterministic_hash("default/web/tenant-a");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("default/web/tenant-a"));
        assert_ne!(a, deterministic_hash("default/web/tenant-b"));
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_is_dns_label() {
        assert!(is_dns_label("web-x-default-x-tenant"));
        assert!(!is_dns_label("Web"));
        assert!(!is_dns_label("-web"));
        assert!(!is_dns_label("web.example"));
        assert!(!is_dns_label(&"a".repeat(64)));
        assert!(is_dns_label(&"a".repeat(63)));
    }
}
