//! Secret reference resolution.
//!
//! Values may carry references of the form `secret://<provider>/<path>`.
//! Plan mode substitutes a deterministic masked placeholder so artifacts
//! stay comparable; apply mode substitutes the real value immediately
//! before render. Either way an audit entry is recorded per reference.
//! Secret values themselves never enter events, logs, or artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use ktl_types::{KtlError, SecretAuditEntry};

use crate::render::ValueOverrides;

pub const SECRET_SCHEME: &str = "secret://";

/// One secret backend, addressed by provider name.
pub trait SecretProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the value at `path`. Only ever called in apply mode.
    fn resolve(&self, path: &str) -> Result<String>;
}

/// Whether references resolve to masks or to real values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Substitute deterministic placeholders; never touch a backend.
    Mask,
    /// Substitute real values.
    Reveal,
}

/// Resolves `secret://` references across a set of value overrides.
#[derive(Default, Clone)]
pub struct SecretResolver {
    providers: BTreeMap<String, Arc<dyn SecretProvider>>,
}

impl SecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn SecretProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Rewrite every `secret://` reference in `values` according to
    /// `mode`, returning the audit set. The audit is produced in both
    /// modes; an empty result means the values carried no references.
    pub fn resolve_overrides(
        &self,
        values: &mut ValueOverrides,
        mode: ResolveMode,
    ) -> Result<Vec<SecretAuditEntry>, KtlError> {
        let mut audit = Vec::new();
        for (_, value) in values
            .set
            .iter_mut()
            .chain(values.set_string.iter_mut())
            .chain(values.set_file.iter_mut())
        {
            let Some((provider, path)) = parse_reference(value) else {
                continue;
            };
            let reference = value.clone();
            *value = match mode {
                ResolveMode::Mask => masked_placeholder(&provider, &path),
                ResolveMode::Reveal => self.reveal(&provider, &path)?,
            };
            audit.push(SecretAuditEntry {
                provider,
                path,
                reference,
                masked: mode == ResolveMode::Mask,
            });
        }
        Ok(audit)
    }

    fn reveal(&self, provider: &str, path: &str) -> Result<String, KtlError> {
        let backend = self.providers.get(provider).ok_or_else(|| {
            KtlError::Input(format!("unknown secret provider {provider:?} in values"))
        })?;
        backend.resolve(path).map_err(|err| {
            KtlError::Input(format!("failed to resolve secret {provider}/{path}: {err:#}"))
        })
    }
}

/// Split `secret://<provider>/<path>`; `None` for ordinary values.
pub fn parse_reference(value: &str) -> Option<(String, String)> {
    let rest = value.strip_prefix(SECRET_SCHEME)?;
    let (provider, path) = rest.split_once('/')?;
    if provider.is_empty() || path.is_empty() {
        return None;
    }
    Some((provider.to_string(), path.to_string()))
}

/// Deterministic mask: the same reference always renders the same
/// placeholder, so masked plan artifacts diff cleanly run over run.
pub fn masked_placeholder(provider: &str, path: &str) -> String {
    format!("[masked:{provider}/{path}]")
}

/// Provider that reads process environment variables; the path is the
/// variable name.
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self, path: &str) -> Result<String> {
        std::env::var(path).map_err(|_| anyhow::anyhow!("environment variable {path} not set"))
    }
}
