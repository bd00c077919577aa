//! In-memory fakes for the external contracts.
//!
//! These back the crate's own tests and give embedders a cluster-free way
//! to exercise the pipeline end to end: a renderer that returns a canned
//! manifest, a cluster that serves objects from a map, and an installer
//! with a real revision history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_yaml::Value;

use ktl_events::Observer;
use ktl_types::{ApiCallStats, LiveQuota, LogPayload, ResourceKey, StreamEvent};

use crate::apply::Confirmer;
use crate::cancel::CancelToken;
use crate::client::{ClientError, KubeClient, RestMapping};
use crate::install::{
    ChartInfo, InstallFailure, InstallRequest, Installer, Release, ReleaseInfo, UninstallOptions,
};
use crate::render::{RenderFailure, RenderRequest, Rendered, Renderer};
use crate::secrets::SecretProvider;

/// Renderer that returns a canned manifest.
pub struct FakeRenderer {
    manifest: Mutex<String>,
    version: String,
    fail: Mutex<Option<RenderFailure>>,
}

impl FakeRenderer {
    pub fn with_manifest(manifest: &str) -> Self {
        Self {
            manifest: Mutex::new(manifest.to_string()),
            version: "1.0.0".to_string(),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, failure: RenderFailure) {
        *self.fail.lock().unwrap() = Some(failure);
    }
}

impl Renderer for FakeRenderer {
    fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderFailure> {
        if let Some(failure) = self.fail.lock().unwrap().clone() {
            return Err(failure);
        }
        Ok(Rendered {
            manifest: self.manifest.lock().unwrap().clone(),
            version: request.version.clone().unwrap_or_else(|| self.version.clone()),
            sources: BTreeMap::new(),
        })
    }
}

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
];

/// Cluster that serves objects from an in-memory map.
#[derive(Default)]
pub struct FakeKube {
    objects: Mutex<BTreeMap<ResourceKey, Value>>,
    namespaces: Mutex<BTreeSet<String>>,
    quotas: Mutex<BTreeMap<String, Vec<LiveQuota>>>,
    limit_ranges: Mutex<BTreeMap<String, Vec<String>>>,
    unknown_kinds: Mutex<BTreeSet<String>>,
    fail_gets: Mutex<Option<String>>,
    fail_discovery: Mutex<Option<String>>,
    calls: Mutex<u64>,
}

impl FakeKube {
    pub fn new() -> Self {
        let kube = Self::default();
        kube.namespaces.lock().unwrap().insert("default".to_string());
        kube
    }

    /// Load every document of a manifest as a live object, as applied.
    pub fn put_manifest(&self, manifest: &str) {
        for (_, body) in ktl_manifest::split_documents(manifest) {
            let value: Value = serde_yaml::from_str(&body).expect("fixture yaml");
            self.put_object(value);
        }
    }

    pub fn put_object(&self, value: Value) {
        let key = ktl_manifest::resource_key(&value).expect("fixture object key");
        self.objects.lock().unwrap().insert(key, value);
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.namespaces.lock().unwrap().insert(namespace.to_string());
    }

    /// Every subsequent GET fails with this message (simulates an
    /// unreachable cluster).
    pub fn fail_gets(&self, message: &str) {
        *self.fail_gets.lock().unwrap() = Some(message.to_string());
    }

    /// Every subsequent discovery call fails with this message.
    pub fn fail_discovery(&self, message: &str) {
        *self.fail_discovery.lock().unwrap() = Some(message.to_string());
    }

    /// Make discovery return no match for this kind.
    pub fn mark_unknown_kind(&self, kind: &str) {
        self.unknown_kinds.lock().unwrap().insert(kind.to_string());
    }

    pub fn set_quotas(&self, namespace: &str, quotas: Vec<LiveQuota>) {
        self.quotas
            .lock()
            .unwrap()
            .insert(namespace.to_string(), quotas);
    }

    fn count_call(&self) {
        *self.calls.lock().unwrap() += 1;
    }
}

impl KubeClient for FakeKube {
    fn host(&self) -> String {
        "https://fake.cluster.local".to_string()
    }

    fn namespace_exists(&self, namespace: &str) -> Result<bool, ClientError> {
        self.count_call();
        Ok(self.namespaces.lock().unwrap().contains(namespace))
    }

    fn create_namespace(&self, namespace: &str) -> Result<(), ClientError> {
        self.count_call();
        self.namespaces.lock().unwrap().insert(namespace.to_string());
        Ok(())
    }

    fn map_kind(
        &self,
        group: &str,
        version: &str,
        kind: &str,
    ) -> Result<Option<RestMapping>, ClientError> {
        self.count_call();
        if let Some(message) = self.fail_discovery.lock().unwrap().clone() {
            return Err(ClientError::Unreachable(message));
        }
        if self.unknown_kinds.lock().unwrap().contains(kind) {
            return Ok(None);
        }
        Ok(Some(RestMapping {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            resource: format!("{}s", kind.to_lowercase()),
            namespaced: !CLUSTER_SCOPED_KINDS.contains(&kind),
        }))
    }

    fn get_dynamic(
        &self,
        mapping: &RestMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClientError> {
        self.count_call();
        if let Some(message) = self.fail_gets.lock().unwrap().clone() {
            return Err(ClientError::Unreachable(message));
        }
        let objects = self.objects.lock().unwrap();
        let found = objects.iter().find(|(key, _)| {
            key.kind == mapping.kind
                && key.name == name
                && (!mapping.namespaced || key.namespace == namespace.unwrap_or(""))
        });
        Ok(found.map(|(_, value)| value.clone()))
    }

    fn resource_quotas(&self, namespace: &str) -> Result<Vec<LiveQuota>, ClientError> {
        self.count_call();
        if let Some(message) = self.fail_gets.lock().unwrap().clone() {
            return Err(ClientError::Unreachable(message));
        }
        Ok(self
            .quotas
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn limit_ranges(&self, namespace: &str) -> Result<Vec<String>, ClientError> {
        self.count_call();
        if let Some(message) = self.fail_gets.lock().unwrap().clone() {
            return Err(ClientError::Unreachable(message));
        }
        Ok(self
            .limit_ranges
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn api_stats(&self) -> ApiCallStats {
        let count = *self.calls.lock().unwrap();
        ApiCallStats {
            count,
            avg_ms: if count > 0 { 1 } else { 0 },
            max_ms: if count > 0 { 1 } else { 0 },
        }
    }
}

/// Installer with a real revision history.
#[derive(Default)]
pub struct FakeInstaller {
    // Release name -> revisions, most recent first.
    releases: Mutex<BTreeMap<String, Vec<Release>>>,
    install_requests: Mutex<Vec<InstallRequest>>,
    uninstall_calls: Mutex<Vec<(String, UninstallOptions)>>,
    fail_next: Mutex<Option<InstallFailure>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_release(name: &str, chart: &str, version: &str, manifest: &str) -> Self {
        let installer = Self::new();
        installer.seed_release(name, chart, version, manifest);
        installer
    }

    /// Seed one deployed revision on top of any existing history.
    pub fn seed_release(&self, name: &str, chart: &str, version: &str, manifest: &str) {
        let mut releases = self.releases.lock().unwrap();
        let history = releases.entry(name.to_string()).or_default();
        let revision = history.first().map(|r| r.version).unwrap_or(0) + 1;
        history.insert(
            0,
            Release {
                name: name.to_string(),
                version: revision,
                info: ReleaseInfo {
                    status: "deployed".to_string(),
                    last_deployed: Utc::now(),
                    notes: String::new(),
                },
                chart: ChartInfo {
                    name: chart.to_string(),
                    version: version.to_string(),
                },
                manifest: manifest.to_string(),
            },
        );
    }

    pub fn fail_next_install(&self, failure: InstallFailure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    pub fn install_requests(&self) -> Vec<InstallRequest> {
        self.install_requests.lock().unwrap().clone()
    }

    pub fn uninstall_calls(&self) -> Vec<(String, UninstallOptions)> {
        self.uninstall_calls.lock().unwrap().clone()
    }
}

impl Installer for FakeInstaller {
    fn get_release(&self, name: &str) -> Result<Option<Release>, InstallFailure> {
        let releases = self.releases.lock().unwrap();
        Ok(releases
            .get(name)
            .and_then(|history| history.first())
            .filter(|release| release.info.status != "uninstalled")
            .cloned())
    }

    fn history(&self, name: &str, limit: usize) -> Result<Vec<Release>, InstallFailure> {
        let releases = self.releases.lock().unwrap();
        Ok(releases
            .get(name)
            .map(|history| history.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn install_or_upgrade(
        &self,
        request: &InstallRequest,
        cancel: &CancelToken,
    ) -> Result<Release, InstallFailure> {
        if cancel.is_cancelled() {
            return Err(InstallFailure::Cancelled);
        }
        self.install_requests.lock().unwrap().push(request.clone());
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            return Err(failure);
        }
        let mut releases = self.releases.lock().unwrap();
        let history = releases.entry(request.release.clone()).or_default();
        let revision = history.first().map(|r| r.version).unwrap_or(0) + 1;
        let release = Release {
            name: request.release.clone(),
            version: revision,
            info: ReleaseInfo {
                status: "deployed".to_string(),
                last_deployed: Utc::now(),
                notes: String::new(),
            },
            chart: ChartInfo {
                name: request.chart.clone(),
                version: request.version.clone().unwrap_or_else(|| "1.0.0".to_string()),
            },
            manifest: String::new(),
        };
        history.insert(0, release.clone());
        Ok(release)
    }

    fn uninstall(&self, release: &str, options: &UninstallOptions) -> Result<(), InstallFailure> {
        self.uninstall_calls
            .lock()
            .unwrap()
            .push((release.to_string(), options.clone()));
        let mut releases = self.releases.lock().unwrap();
        if !releases.contains_key(release) {
            if options.ignore_not_found {
                return Ok(());
            }
            return Err(InstallFailure::Failed(format!("release {release:?} not found")));
        }
        if options.keep_history {
            if let Some(history) = releases.get_mut(release) {
                for revision in history.iter_mut() {
                    revision.info.status = "uninstalled".to_string();
                }
            }
        } else {
            releases.remove(release);
        }
        Ok(())
    }
}

/// Secret provider over a fixed map.
pub struct StaticSecrets {
    name: String,
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    pub fn new(name: &str, entries: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            values: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl SecretProvider for StaticSecrets {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> anyhow::Result<String> {
        self.values
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no secret at {path}"))
    }
}

/// Observer that collects every event it sees.
pub struct CollectingObserver {
    name: String,
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl CollectingObserver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected events; usable after the observer
    /// has been boxed into a bus.
    pub fn events(&self) -> Arc<Mutex<Vec<StreamEvent>>> {
        Arc::clone(&self.events)
    }
}

impl Observer for CollectingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_deploy_event(&mut self, event: &StreamEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn observe_log(&mut self, event: &StreamEvent, _log: &LogPayload) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Confirmer with a scripted answer.
pub struct ScriptedConfirmer {
    approve: bool,
    typed: String,
}

impl ScriptedConfirmer {
    pub fn approve() -> Self {
        Self {
            approve: true,
            typed: String::new(),
        }
    }

    pub fn deny() -> Self {
        Self {
            approve: false,
            typed: String::new(),
        }
    }

    /// Destroy confirmations reply with exactly this text.
    pub fn typing(text: &str) -> Self {
        Self {
            approve: true,
            typed: text.to_string(),
        }
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm_apply(&self, _plan: &ktl_types::PlanResult) -> anyhow::Result<bool> {
        Ok(self.approve)
    }

    fn confirm_destroy(&self, _release: &str) -> anyhow::Result<String> {
        Ok(self.typed.clone())
    }
}
