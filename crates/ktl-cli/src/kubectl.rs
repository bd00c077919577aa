//! kubectl-backed cluster client.
//!
//! Discovery runs once per invocation (`kubectl api-resources`) and is
//! cached; object lookups go through `kubectl get ... -o yaml`. Every call
//! is timed for the telemetry line.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::Instant;

use serde_yaml::Value;

use ktl_core::client::{ClientError, KubeClient, RestMapping};
use ktl_types::{ApiCallStats, LiveQuota};

#[derive(Default)]
struct CallStats {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

pub struct Kubectl {
    context: Option<String>,
    stats: Mutex<CallStats>,
    discovery: Mutex<Option<BTreeMap<String, RestMapping>>>,
    host: Mutex<Option<String>>,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

impl Kubectl {
    pub fn new(context: Option<String>) -> Self {
        Self {
            context,
            stats: Mutex::new(CallStats::default()),
            discovery: Mutex::new(None),
            host: Mutex::new(None),
        }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, ClientError> {
        let mut command = Command::new("kubectl");
        command.args(args);
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        tracing::debug!(?args, "invoking kubectl");
        let started = Instant::now();
        let output = command
            .output()
            .map_err(|err| ClientError::Unreachable(format!("failed to invoke kubectl: {err}")))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.count += 1;
            stats.total_ms += elapsed_ms;
            stats.max_ms = stats.max_ms.max(elapsed_ms);
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }

    fn classify_failure(stderr: &str) -> ClientError {
        let trimmed = stderr.trim().to_string();
        if trimmed.contains("Forbidden") || trimmed.contains("forbidden") {
            ClientError::Forbidden(trimmed)
        } else if trimmed.contains("connection refused")
            || trimmed.contains("Unable to connect")
            || trimmed.contains("no such host")
        {
            ClientError::Unreachable(trimmed)
        } else {
            ClientError::Other(trimmed)
        }
    }

    /// Discovery table keyed by `<group>/<Kind>`, parsed from
    /// `kubectl api-resources -o wide` once and cached.
    fn discovery_table(&self) -> Result<BTreeMap<String, RestMapping>, ClientError> {
        {
            let cache = self.discovery.lock().unwrap();
            if let Some(table) = cache.as_ref() {
                return Ok(table.clone());
            }
        }
        let output = self.run(&["api-resources", "-o", "wide", "--no-headers=false"])?;
        if !output.success {
            return Err(Self::classify_failure(&output.stderr));
        }
        let table = parse_api_resources(&output.stdout);
        *self.discovery.lock().unwrap() = Some(table.clone());
        Ok(table)
    }
}

/// Columns: NAME SHORTNAMES APIVERSION NAMESPACED KIND [VERBS ...].
/// SHORTNAMES may be absent; anchor on the NAMESPACED boolean instead of
/// counting columns from the left.
fn parse_api_resources(raw: &str) -> BTreeMap<String, RestMapping> {
    let mut table = BTreeMap::new();
    for line in raw.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let Some(bool_at) = columns
            .iter()
            .position(|c| *c == "true" || *c == "false")
        else {
            continue;
        };
        if bool_at < 2 || bool_at + 1 >= columns.len() {
            continue;
        }
        let name = columns[0];
        let api_version = columns[bool_at - 1];
        let namespaced = columns[bool_at] == "true";
        let kind = columns[bool_at + 1];
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        table.insert(
            format!("{group}/{kind}"),
            RestMapping {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
                resource: name.to_string(),
                namespaced,
            },
        );
    }
    table
}

impl KubeClient for Kubectl {
    fn host(&self) -> String {
        {
            let cached = self.host.lock().unwrap();
            if let Some(host) = cached.as_ref() {
                return host.clone();
            }
        }
        let host = self
            .run(&[
                "config",
                "view",
                "--minify",
                "-o",
                "jsonpath={.clusters[0].cluster.server}",
            ])
            .ok()
            .filter(|o| o.success)
            .map(|o| o.stdout.trim().to_string())
            .unwrap_or_default();
        *self.host.lock().unwrap() = Some(host.clone());
        host
    }

    fn namespace_exists(&self, namespace: &str) -> Result<bool, ClientError> {
        let output = self.run(&["get", "namespace", namespace, "-o", "name"])?;
        if output.success {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(Self::classify_failure(&output.stderr))
    }

    fn create_namespace(&self, namespace: &str) -> Result<(), ClientError> {
        let output = self.run(&["create", "namespace", namespace])?;
        if output.success {
            Ok(())
        } else {
            Err(Self::classify_failure(&output.stderr))
        }
    }

    fn map_kind(
        &self,
        group: &str,
        _version: &str,
        kind: &str,
    ) -> Result<Option<RestMapping>, ClientError> {
        let table = self.discovery_table()?;
        if let Some(mapping) = table.get(&format!("{group}/{kind}")) {
            return Ok(Some(mapping.clone()));
        }
        // Case-insensitive fallback for sloppy kinds in hand-written values.
        Ok(table
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&format!("{group}/{kind}")))
            .map(|(_, mapping)| mapping.clone()))
    }

    fn get_dynamic(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClientError> {
        let resource = if mapping.group.is_empty() {
            mapping.resource.clone()
        } else {
            format!("{}.{}", mapping.resource, mapping.group)
        };
        let mut args = vec!["get", resource.as_str(), name, "-o", "yaml"];
        if let Some(namespace) = namespace {
            args.push("-n");
            args.push(namespace);
        }
        let output = self.run(&args)?;
        if !output.success {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(Self::classify_failure(&output.stderr));
        }
        let value: Value = serde_yaml::from_str(&output.stdout)
            .map_err(|err| ClientError::Other(format!("unparseable object from kubectl: {err}")))?;
        Ok(Some(value))
    }

    fn resource_quotas(&self, namespace: &str) -> Result<Vec<LiveQuota>, ClientError> {
        let output = self.run(&["get", "resourcequota", "-n", namespace, "-o", "yaml"])?;
        if !output.success {
            return Err(Self::classify_failure(&output.stderr));
        }
        let value: Value = serde_yaml::from_str(&output.stdout)
            .map_err(|err| ClientError::Other(format!("unparseable quota list: {err}")))?;
        let mut quotas = Vec::new();
        if let Some(items) = value.get("items").and_then(Value::as_sequence) {
            for item in items {
                let name = item
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                quotas.push(LiveQuota {
                    name,
                    hard: string_map(item.get("status").and_then(|s| s.get("hard"))),
                    used: string_map(item.get("status").and_then(|s| s.get("used"))),
                });
            }
        }
        Ok(quotas)
    }

    fn limit_ranges(&self, namespace: &str) -> Result<Vec<String>, ClientError> {
        let output = self.run(&["get", "limitrange", "-n", namespace, "-o", "name"])?;
        if !output.success {
            return Err(Self::classify_failure(&output.stderr));
        }
        Ok(output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect())
    }

    fn api_stats(&self) -> ApiCallStats {
        let stats = self.stats.lock().unwrap();
        ApiCallStats {
            count: stats.count,
            avg_ms: if stats.count > 0 {
                stats.total_ms / stats.count
            } else {
                0
            },
            max_ms: stats.max_ms,
        }
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(mapping) = value.and_then(Value::as_mapping) {
        for (k, v) in mapping {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                out.insert(k.to_string(), v.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_RESOURCES: &str = "\
NAME          SHORTNAMES   APIVERSION   NAMESPACED   KIND           VERBS
configmaps    cm           v1           true         ConfigMap      create,delete,get
deployments   deploy       apps/v1      true         Deployment     create,delete,get
namespaces    ns           v1           false        Namespace      create,delete,get
clusterroles               rbac.authorization.k8s.io/v1   false   ClusterRole   create,get
";

    #[test]
    fn parses_api_resources_with_and_without_shortnames() {
        let table = parse_api_resources(API_RESOURCES);
        let deploy = &table["apps/Deployment"];
        assert_eq!(deploy.resource, "deployments");
        assert_eq!(deploy.version, "v1");
        assert!(deploy.namespaced);

        let ns = &table["/Namespace"];
        assert!(!ns.namespaced);

        let role = &table["rbac.authorization.k8s.io/ClusterRole"];
        assert_eq!(role.resource, "clusterroles");
        assert!(!role.namespaced);
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error from server (NotFound): namespaces \"x\" not found"));
        assert!(!is_not_found("Error from server (Forbidden): nope"));
    }

    #[test]
    fn string_map_extracts_quota_fields() {
        let value: Value =
            serde_yaml::from_str("hard:\n  pods: \"10\"\n  requests.cpu: \"4\"\n").unwrap();
        let map = string_map(value.get("hard"));
        assert_eq!(map["pods"], "10");
        assert_eq!(map["requests.cpu"], "4");
    }
}
