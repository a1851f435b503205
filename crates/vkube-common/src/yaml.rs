//! YAML handling for init manifests
//!
//! Manifests arrive as one multi-document YAML string. They are split into
//! individual documents and converted to `serde_json::Value` so they can be
//! server-side applied as `DynamicObject`s.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// Error raised while parsing YAML input
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML only the first document is returned.
/// Empty input yields `Value::Null`.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Split a multi-document manifest bundle into single documents.
///
/// Documents that carry no `apiVersion` (comments, blank separators) are
/// dropped. Order is preserved.
pub fn split_manifests(bundle: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in bundle.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            push_document(&mut docs, &current);
            current.clear();
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut docs, &current);
    docs
}

fn push_document(docs: &mut Vec<String>, doc: &str) {
    let trimmed = doc.trim();
    if trimmed.contains("apiVersion") {
        docs.push(trimmed.to_string());
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) | Yaml::Real(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}
