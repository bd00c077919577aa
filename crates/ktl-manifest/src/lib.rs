//! Manifest indexing for the deploy pipeline.
//!
//! Splits a rendered multi-document YAML blob into documents keyed by
//! `(group, version, kind, namespace, name)`, normalizes away volatile
//! server-side metadata, and renders a canonical YAML form that equal
//! objects serialize to byte-for-byte. The canonical form feeds the diff
//! engine and the verify digest.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Value};

use ktl_types::ResourceKey;

/// Annotation stripped during normalization alongside the volatile
/// metadata fields.
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// One parsed, normalized manifest document.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDoc {
    pub key: ResourceKey,
    /// Normalized object body.
    pub value: Value,
    /// Canonical YAML rendering of `value`.
    pub yaml: String,
    /// Template provenance from a leading `# Source: <path>` comment.
    pub source: Option<String>,
}

/// All documents of one manifest, keyed by resource identity.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    docs: BTreeMap<ResourceKey, ManifestDoc>,
}

impl ManifestIndex {
    /// Split and parse a rendered manifest.
    ///
    /// Documents with an empty `kind` or `metadata.name` are skipped (charts
    /// routinely render empty documents from conditionals). Two documents
    /// with the same key are a configuration error.
    pub fn parse(manifest: &str) -> Result<Self> {
        let mut docs = BTreeMap::new();
        for (source, body) in split_documents(manifest) {
            let Some(doc) = parse_document(&body, source)? else {
                continue;
            };
            if let Some(previous) = docs.insert(doc.key.clone(), doc) {
                bail!("duplicate resource in rendered manifest: {}", previous.key);
            }
        }
        Ok(Self { docs })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ManifestDoc> {
        self.docs.get(key)
    }

    /// Exact lookup, falling back to a case-insensitive `kind` match.
    pub fn get_loose(&self, key: &ResourceKey) -> Option<&ManifestDoc> {
        self.docs
            .get(key)
            .or_else(|| self.docs.values().find(|d| d.key.matches_loose(key)))
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.docs.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.docs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &ManifestDoc)> {
        self.docs.iter()
    }

    /// Concatenated canonical YAML of every document, in key order, with
    /// `---` separators. Deterministic by construction.
    pub fn canonical_blob(&self) -> String {
        let mut out = String::new();
        for doc in self.docs.values() {
            if !out.is_empty() {
                out.push_str("---\n");
            }
            out.push_str(&doc.yaml);
        }
        out
    }
}

/// Split a multi-document blob on `---` boundaries, carrying along the
/// `# Source: <path>` provenance comment helm-style renderers emit at the
/// head of each document.
pub fn split_documents(manifest: &str) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    let mut source: Option<String> = None;
    let mut body = String::new();

    let mut flush = |source: &mut Option<String>, body: &mut String, out: &mut Vec<_>| {
        if body.chars().any(|c| !c.is_whitespace()) {
            out.push((source.take(), std::mem::take(body)));
        } else {
            source.take();
            body.clear();
        }
    };

    for line in manifest.lines() {
        if line.trim_end() == "---" {
            flush(&mut source, &mut body, &mut out);
            continue;
        }
        if body.trim().is_empty() {
            if let Some(path) = line.trim().strip_prefix("# Source:") {
                source = Some(path.trim().to_string());
                continue;
            }
        }
        body.push_str(line);
        body.push('\n');
    }
    flush(&mut source, &mut body, &mut out);
    out
}

/// Parse one document body into a normalized [`ManifestDoc`].
///
/// Returns `Ok(None)` for comment-only documents and for documents missing
/// `kind` or `metadata.name`.
pub fn parse_document(body: &str, source: Option<String>) -> Result<Option<ManifestDoc>> {
    let value: Value = serde_yaml::from_str(body).context("unparseable manifest document")?;
    let Value::Mapping(_) = value else {
        return Ok(None);
    };

    let Some(key) = resource_key(&value) else {
        return Ok(None);
    };

    let mut value = value;
    normalize(&mut value);
    let value = canonicalize(value);
    let yaml = to_canonical_yaml(&value)?;

    Ok(Some(ManifestDoc {
        key,
        value,
        yaml,
        source,
    }))
}

/// Normalize and canonically render an already-parsed object (e.g. a live
/// object fetched from the cluster).
pub fn canonical_object(value: &Value) -> Result<(Value, String)> {
    let mut v = value.clone();
    normalize(&mut v);
    let v = canonicalize(v);
    let yaml = to_canonical_yaml(&v)?;
    Ok((v, yaml))
}

/// Derive the resource key of a parsed object. `None` when `kind` or
/// `metadata.name` is missing or empty.
pub fn resource_key(value: &Value) -> Option<ResourceKey> {
    let kind = value.get("kind")?.as_str()?.trim();
    if kind.is_empty() {
        return None;
    }
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("v1");
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    let metadata = value.get("metadata")?;
    let name = metadata.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("");
    Some(ResourceKey::new(group, version, kind, namespace, name))
}

/// Strip volatile server-side fields so rendered and live objects compare
/// on intent alone: `status`, and under `metadata` the managed fields,
/// resource version, uid, generation, creation timestamp, and the
/// last-applied-configuration annotation.
pub fn normalize(value: &mut Value) {
    let Value::Mapping(root) = value else {
        return;
    };
    root.remove("status");

    if let Some(Value::Mapping(metadata)) = root.get_mut("metadata") {
        for field in [
            "managedFields",
            "resourceVersion",
            "uid",
            "generation",
            "creationTimestamp",
        ] {
            metadata.remove(field);
        }
        let mut drop_annotations = false;
        if let Some(Value::Mapping(annotations)) = metadata.get_mut("annotations") {
            annotations.remove(LAST_APPLIED_ANNOTATION);
            drop_annotations = annotations.is_empty();
        }
        if drop_annotations {
            metadata.remove("annotations");
        }
    }
}

/// Recursively sort every mapping by key so equal objects serialize equal
/// byte-for-byte.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(Value, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| key_string(a).cmp(&key_string(b)));
            let mut sorted = Mapping::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Mapping(sorted)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

fn to_canonical_yaml(value: &Value) -> Result<String> {
    serde_yaml::to_string(value).context("failed to render canonical YAML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TWO_DOCS: &str = "\
---
# Source: core/templates/cfg.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  namespace: prod
data:
  k: v
---
# Source: core/templates/svc.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: prod
spec:
  ports:
    - port: 80
";

    #[test]
    fn splits_and_keys_documents() {
        let index = ManifestIndex::parse(TWO_DOCS).unwrap();
        assert_eq!(index.len(), 2);
        let key = ResourceKey::new("", "v1", "ConfigMap", "prod", "cfg");
        let doc = index.get(&key).unwrap();
        assert_eq!(doc.source.as_deref(), Some("core/templates/cfg.yaml"));
    }

    #[test]
    fn skips_empty_and_nameless_documents() {
        let manifest = "---\n# just a comment\n---\nkind: ConfigMap\nmetadata: {}\n---\n";
        let index = ManifestIndex::parse(manifest).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn loose_lookup_tolerates_kind_casing() {
        let index = ManifestIndex::parse(TWO_DOCS).unwrap();
        let sloppy = ResourceKey::new("", "v1", "configmap", "prod", "cfg");
        assert!(index.get(&sloppy).is_none());
        assert!(index.get_loose(&sloppy).is_some());
    }

    #[test]
    fn duplicate_keys_are_an_error() {
        let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
";
        let err = ManifestIndex::parse(manifest).unwrap_err();
        assert!(err.to_string().contains("duplicate resource"));
    }

    #[test]
    fn normalization_strips_volatile_metadata() {
        let doc = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  namespace: prod
  resourceVersion: \"12345\"
  uid: abc-def
  generation: 7
  creationTimestamp: \"2024-05-04T12:00:00Z\"
  managedFields:
    - manager: kubectl
  annotations:
    kubectl.kubernetes.io/last-applied-configuration: \"{}\"
data:
  k: v
status:
  phase: Active
";
        let parsed = parse_document(doc, None).unwrap().unwrap();
        assert!(!parsed.yaml.contains("resourceVersion"));
        assert!(!parsed.yaml.contains("managedFields"));
        assert!(!parsed.yaml.contains("status"));
        assert!(!parsed.yaml.contains("last-applied-configuration"));
        assert!(!parsed.yaml.contains("annotations"));
    }

    #[test]
    fn kept_annotations_survive_normalization() {
        let doc = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  annotations:
    kubectl.kubernetes.io/last-applied-configuration: \"{}\"
    team: payments
";
        let parsed = parse_document(doc, None).unwrap().unwrap();
        assert!(parsed.yaml.contains("team: payments"));
        assert!(!parsed.yaml.contains("last-applied-configuration"));
    }

    #[test]
    fn canonical_rendering_is_key_order_independent() {
        let a = parse_document(
            "kind: ConfigMap\napiVersion: v1\nmetadata:\n  namespace: prod\n  name: cfg\ndata:\n  b: \"2\"\n  a: \"1\"\n",
            None,
        )
        .unwrap()
        .unwrap();
        let b = parse_document(
            "apiVersion: v1\nkind: ConfigMap\ndata:\n  a: \"1\"\n  b: \"2\"\nmetadata:\n  name: cfg\n  namespace: prod\n",
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(a.yaml, b.yaml);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn cluster_scoped_key_has_empty_namespace() {
        let doc = "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: admin\n";
        let parsed = parse_document(doc, None).unwrap().unwrap();
        assert!(parsed.key.is_cluster_scoped());
        assert_eq!(parsed.key.group, "rbac.authorization.k8s.io");
    }

    #[test]
    fn canonical_blob_is_sorted_and_separated() {
        let index = ManifestIndex::parse(TWO_DOCS).unwrap();
        let blob = index.canonical_blob();
        let cfg_at = blob.find("kind: ConfigMap").unwrap();
        let svc_at = blob.find("kind: Service").unwrap();
        assert!(cfg_at < svc_at);
        assert_eq!(blob.matches("---").count(), 1);
    }
}
