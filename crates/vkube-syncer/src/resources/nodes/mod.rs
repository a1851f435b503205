//! Node syncers: real (mirror selected physical nodes) and fake (synthesize
//! placeholders for nodes virtual pods are bound to)

mod fake;
pub mod quantity;
mod real;

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;
use kube::discovery::ApiResource;

use vkube_common::{Error, Result};

pub use fake::{aggregate_capacity, synthesize_node, FakeNodeSyncer, POD_NODE_NAME_INDEX};
pub use real::NodeSyncer;

/// Syncer name of the real node syncer
pub const NAME: &str = "nodes";

/// Syncer name of the fake node syncer
pub const FAKE_NAME: &str = "fake-nodes";

pub(crate) fn node_resource() -> ApiResource {
    ApiResource::erase::<Node>(&())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

/// Equality-based label selector (`k=v`, `k==v`, `k!=v`, `k`, `!k`), comma separated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSelector {
    requirements: Vec<Requirement>,
}

impl NodeSelector {
    /// Whether the labels satisfy every requirement; an empty selector matches all
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

impl FromStr for NodeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |part: &str| {
            Error::validation_for_field(
                "node selector",
                "node-selector",
                format!("invalid requirement {part:?}"),
            )
        };

        let mut requirements = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let req = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = part.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };
            let key = match &req {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k) => k,
            };
            if key.is_empty() {
                return Err(invalid(part));
            }
            requirements.push(req);
        }
        Ok(Self { requirements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_requirements() {
        let selector: NodeSelector = "pool=tenants, zone!=b, gpu, !cordoned".parse().unwrap();
        assert!(selector.matches(&labels(&[("pool", "tenants"), ("zone", "a"), ("gpu", "")])));
        assert!(!selector.matches(&labels(&[("pool", "tenants"), ("zone", "b"), ("gpu", "")])));
        assert!(!selector.matches(&labels(&[("pool", "tenants"), ("gpu", ""), ("cordoned", "1")])));
        assert!(!selector.matches(&labels(&[("pool", "system"), ("gpu", "")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector: NodeSelector = "".parse().unwrap();
        assert!(selector.matches(&BTreeMap::new()));
        let double: NodeSelector = "pool==tenants".parse().unwrap();
        assert!(double.matches(&labels(&[("pool", "tenants")])));
    }

    #[test]
    fn test_selector_rejects_empty_keys() {
        assert!("=x".parse::<NodeSelector>().is_err());
        assert!("!".parse::<NodeSelector>().is_err());
    }
}
