use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a single Kubernetes object.
///
/// Two keys are equal iff all five fields match case-sensitively. Lookup
/// paths that tolerate sloppy user input should go through
/// [`ResourceKey::matches_loose`], which compares `kind` case-insensitively.
///
/// An empty `namespace` means the object is cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: &str, version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// An empty namespace marks the object as cluster-scoped.
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// The `apiVersion` string this key was parsed from (`group/version`,
    /// or bare `version` for the core group).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Equality with a case-insensitive `kind`, used as a lookup fallback
    /// when joining user-supplied kinds against rendered documents.
    pub fn matches_loose(&self, other: &ResourceKey) -> bool {
        self.group == other.group
            && self.version == other.version
            && self.namespace == other.namespace
            && self.name == other.name
            && self.kind.eq_ignore_ascii_case(&other.kind)
    }

    /// Stable lowercased node id for the dependency graph:
    /// `<ns|cluster>|<kind>|<name>`.
    pub fn graph_id(&self) -> String {
        let ns = if self.namespace.is_empty() {
            "cluster"
        } else {
            &self.namespace
        };
        format!("{}|{}|{}", ns, self.kind, self.name).to_lowercase()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster_scoped() {
            write!(f, "{}/{} {}", self.api_version(), self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version(),
                self.kind,
                self.namespace,
                self.name
            )
        }
    }
}
