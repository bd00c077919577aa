//! Drift guard: refuse to mutate a cluster that no longer matches the
//! record.
//!
//! `last-applied` mode compares live objects against the stored release
//! manifest; `desired` mode renders the current inputs fresh and compares
//! live against that. Any divergence is fatal before mutation. A missing
//! release in last-applied mode is no drift (there is nothing to protect).

use anyhow::{Context, Result};

use ktl_manifest::{ManifestIndex, canonical_object};
use ktl_types::KtlError;

use crate::cancel::CancelToken;
use crate::client::{KubeClient, lookup_namespace};
use crate::install::{InstallFailure, Installer};
use crate::render::{RenderRequest, Renderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftMode {
    /// Protect the last-applied release manifest.
    LastApplied,
    /// Protect a fresh render of the current inputs.
    Desired,
}

impl DriftMode {
    pub fn parse(raw: &str) -> Result<Self, KtlError> {
        match raw {
            "last-applied" => Ok(DriftMode::LastApplied),
            "desired" => Ok(DriftMode::Desired),
            other => Err(KtlError::Input(format!(
                "unknown drift mode {other:?} (expected last-applied or desired)"
            ))),
        }
    }
}

pub struct DriftGuard<'a> {
    pub client: &'a dyn KubeClient,
    pub installer: &'a dyn Installer,
    pub renderer: &'a dyn Renderer,
}

impl DriftGuard<'_> {
    /// Check for drift; `Err(Guard)` lists every drifted resource.
    ///
    /// `render` carries the request used in `Desired` mode; it must hold
    /// the same resolved values the apply itself would render with.
    pub fn check(
        &self,
        mode: DriftMode,
        release: &str,
        default_ns: &str,
        render: &RenderRequest,
        cancel: &CancelToken,
    ) -> Result<()> {
        let baseline = match mode {
            DriftMode::LastApplied => match self.installer.get_release(release) {
                Ok(Some(stored)) => ManifestIndex::parse(&stored.manifest)
                    .context("failed to parse stored release manifest")?,
                Ok(None) => return Ok(()),
                Err(InstallFailure::Cancelled) => {
                    return Err(KtlError::Cancelled("drift check".into()).into());
                }
                Err(err) => {
                    return Err(KtlError::Install(format!("release lookup failed: {err}")).into());
                }
            },
            DriftMode::Desired => {
                let rendered = self.renderer.render(render).map_err(KtlError::from)?;
                ManifestIndex::parse(&rendered.manifest)
                    .map_err(|err| KtlError::Input(format!("{err:#}")))?
            }
        };

        let mut drifted: Vec<String> = Vec::new();
        for (key, doc) in baseline.iter() {
            cancel.check()?;
            let mapping = self
                .client
                .map_kind(&key.group, &key.version, &key.kind)
                .map_err(|err| KtlError::LiveLookup(err.to_string()))?
                .ok_or_else(|| {
                    KtlError::Discovery(format!("no API match for {key} during drift check"))
                })?;
            let namespace = lookup_namespace(&mapping, key, default_ns);
            match self
                .client
                .get_dynamic(&mapping, namespace, &key.name)
                .map_err(|err| KtlError::LiveLookup(err.to_string()))?
            {
                Some(value) => {
                    let (_, live_yaml) = canonical_object(&value)?;
                    if live_yaml != doc.yaml {
                        drifted.push(format!("{key} differs from the recorded state"));
                    }
                }
                None => drifted.push(format!("{key} was deleted out of band")),
            }
        }

        if drifted.is_empty() {
            Ok(())
        } else {
            Err(KtlError::Guard(format!(
                "drift detected for {} resource(s): {}",
                drifted.len(),
                drifted.join("; ")
            ))
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeInstaller, FakeKube, FakeRenderer};

    const CONFIGMAP: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  namespace: prod
data:
  k: v
";

    fn guard<'a>(
        kube: &'a FakeKube,
        installer: &'a FakeInstaller,
        renderer: &'a FakeRenderer,
    ) -> DriftGuard<'a> {
        DriftGuard {
            client: kube,
            installer,
            renderer,
        }
    }

    fn request() -> RenderRequest {
        RenderRequest {
            chart: "core".into(),
            release: "web".into(),
            namespace: "prod".into(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_release_means_no_drift() {
        let kube = FakeKube::new();
        let installer = FakeInstaller::new();
        let renderer = FakeRenderer::with_manifest(CONFIGMAP);
        guard(&kube, &installer, &renderer)
            .check(
                DriftMode::LastApplied,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap();
    }

    #[test]
    fn matching_live_state_passes() {
        let kube = FakeKube::new();
        kube.put_manifest(CONFIGMAP);
        let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);
        let renderer = FakeRenderer::with_manifest(CONFIGMAP);
        guard(&kube, &installer, &renderer)
            .check(
                DriftMode::LastApplied,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap();
    }

    #[test]
    fn out_of_band_edit_is_fatal_drift() {
        let kube = FakeKube::new();
        kube.put_manifest(&CONFIGMAP.replace("k: v", "k: tampered"));
        let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);
        let renderer = FakeRenderer::with_manifest(CONFIGMAP);
        let err = guard(&kube, &installer, &renderer)
            .check(
                DriftMode::LastApplied,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap_err();
        let kind = err.downcast_ref::<KtlError>().unwrap();
        assert_eq!(kind.exit_code(), 2);
        assert!(kind.to_string().contains("drift detected"));
    }

    #[test]
    fn out_of_band_delete_is_fatal_drift() {
        let kube = FakeKube::new();
        let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);
        let renderer = FakeRenderer::with_manifest(CONFIGMAP);
        let err = guard(&kube, &installer, &renderer)
            .check(
                DriftMode::LastApplied,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("deleted out of band"));
    }

    #[test]
    fn desired_mode_renders_fresh_and_compares() {
        let kube = FakeKube::new();
        kube.put_manifest(CONFIGMAP);
        let installer = FakeInstaller::new();
        let renderer = FakeRenderer::with_manifest(&CONFIGMAP.replace("k: v", "k: next"));
        let err = guard(&kube, &installer, &renderer)
            .check(
                DriftMode::Desired,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("differs from the recorded state"));
    }

    #[test]
    fn lookup_failure_is_fatal_not_fallback() {
        let kube = FakeKube::new();
        kube.fail_gets("connection refused");
        let installer = FakeInstaller::with_release("web", "core", "1.0.0", CONFIGMAP);
        let renderer = FakeRenderer::with_manifest(CONFIGMAP);
        let err = guard(&kube, &installer, &renderer)
            .check(
                DriftMode::LastApplied,
                "web",
                "prod",
                &request(),
                &CancelToken::new(),
            )
            .unwrap_err();
        let kind = err.downcast_ref::<KtlError>().unwrap();
        assert_eq!(kind.exit_code(), 3);
    }
}
