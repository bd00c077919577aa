//! Cluster I/O contract.
//!
//! The pipeline never talks to a cluster directly; everything goes through
//! [`KubeClient`], which an embedding binary backs with kubectl, a REST
//! client, or an in-memory fake. The contract mirrors what the engines
//! need: typed namespace access, dynamic GET by REST mapping, discovery
//! with no-match discrimination, and per-invocation API call statistics.

use serde_yaml::Value;
use thiserror::Error;

use ktl_types::{ApiCallStats, LiveQuota, ResourceKey};

/// A resolved REST mapping for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name (`deployments`).
    pub resource: String,
    pub namespaced: bool,
}

/// Cluster access failure for a specific call.
///
/// Discovery misses are not errors: [`KubeClient::map_kind`] returns
/// `Ok(None)` when no mapping exists (CRD not installed), and
/// [`KubeClient::get_dynamic`] returns `Ok(None)` when the object does
/// not exist.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Other(String),
}

pub trait KubeClient: Send + Sync {
    /// The cluster API host, recorded in plan artifacts.
    fn host(&self) -> String;

    fn namespace_exists(&self, namespace: &str) -> Result<bool, ClientError>;

    fn create_namespace(&self, namespace: &str) -> Result<(), ClientError>;

    /// Resolve the REST mapping for a kind. `Ok(None)` means discovery has
    /// no match.
    fn map_kind(
        &self,
        group: &str,
        version: &str,
        kind: &str,
    ) -> Result<Option<RestMapping>, ClientError>;

    /// GET one object. `namespace` is ignored for cluster-scoped mappings;
    /// `Ok(None)` means not found.
    fn get_dynamic(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClientError>;

    fn resource_quotas(&self, namespace: &str) -> Result<Vec<LiveQuota>, ClientError>;

    fn limit_ranges(&self, namespace: &str) -> Result<Vec<String>, ClientError>;

    fn api_stats(&self) -> ApiCallStats;
}

/// Resolve the namespace argument for a GET on `key`: cluster-scoped
/// mappings take none, namespaced ones take the key's namespace or the
/// invocation default.
pub fn lookup_namespace<'a>(
    mapping: &RestMapping,
    key: &'a ResourceKey,
    default_ns: &'a str,
) -> Option<&'a str> {
    if !mapping.namespaced {
        return None;
    }
    if key.namespace.is_empty() {
        Some(default_ns)
    } else {
        Some(&key.namespace)
    }
}
