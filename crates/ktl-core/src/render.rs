//! Chart rendering contract and value-override plumbing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use ktl_types::{KtlError, ValueSources};

/// Everything a renderer needs to turn a chart into a manifest.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub chart: String,
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    pub values: ValueOverrides,
    pub include_crds: bool,
    /// Allow the renderer to consult cluster capabilities.
    pub use_cluster: bool,
}

/// The renderer's output: the manifest blob, the chart version that was
/// actually resolved, and template provenance (document id -> source path).
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub manifest: String,
    pub version: String,
    pub sources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error)]
pub enum RenderFailure {
    #[error("chart not found: {0}")]
    ChartNotFound(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("value error: {0}")]
    Values(String),
}

impl From<RenderFailure> for KtlError {
    fn from(failure: RenderFailure) -> Self {
        match failure {
            RenderFailure::ChartNotFound(msg) => KtlError::Input(format!("chart not found: {msg}")),
            RenderFailure::Template(msg) | RenderFailure::Values(msg) => KtlError::Render(msg),
        }
    }
}

pub trait Renderer: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderFailure>;
}

/// Parsed value overrides, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueOverrides {
    pub files: Vec<PathBuf>,
    pub set: Vec<(String, String)>,
    pub set_string: Vec<(String, String)>,
    pub set_file: Vec<(String, String)>,
}

impl ValueOverrides {
    /// Parse `key=value` arguments as the CLI hands them over.
    pub fn parse(
        files: &[PathBuf],
        set: &[String],
        set_string: &[String],
        set_file: &[String],
    ) -> Result<Self, KtlError> {
        Ok(Self {
            files: files.to_vec(),
            set: parse_pairs(set, "--set")?,
            set_string: parse_pairs(set_string, "--set-string")?,
            set_file: parse_pairs(set_file, "--set-file")?,
        })
    }

    /// The reproducibility record written into plan artifacts.
    pub fn sources(&self) -> ValueSources {
        let join = |pairs: &[(String, String)]| {
            pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
        };
        ValueSources {
            files: self.files.clone(),
            set: join(&self.set),
            set_string: join(&self.set_string),
            set_file: join(&self.set_file),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.set.is_empty()
            && self.set_string.is_empty()
            && self.set_file.is_empty()
    }
}

fn parse_pairs(raw: &[String], flag: &str) -> Result<Vec<(String, String)>, KtlError> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    KtlError::Input(format!("malformed {flag} value {entry:?}: expected key=value"))
                })
        })
        .collect()
}
