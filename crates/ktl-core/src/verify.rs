//! Verify guard: tie an apply to a previously attested render.
//!
//! A verify report (JSON) attests the SHA-256 of the rendered chart
//! manifest. Before mutating anything, the apply recomputes the canonical
//! digest of what it is about to install and refuses on mismatch.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use ktl_types::KtlError;

#[derive(Debug, Deserialize)]
struct VerifyReport {
    #[serde(default)]
    inputs: Vec<VerifyInput>,
}

#[derive(Debug, Deserialize)]
struct VerifyInput {
    #[serde(default)]
    kind: String,
    #[serde(rename = "renderedSha256")]
    rendered_sha256: Option<String>,
}

/// Canonical digest of a rendered manifest: CRLF normalized to LF,
/// surrounding whitespace trimmed, exactly one trailing newline, SHA-256
/// over the UTF-8 bytes, lowercase hex.
///
/// The digest is computed over the renderer's output byte-for-byte; the
/// manifest is never re-serialized first.
pub fn canonical_digest(manifest: &str) -> String {
    let unixed = manifest.replace("\r\n", "\n");
    let canonical = format!("{}\n", unixed.trim());
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Enforce that `manifest` matches the chart digest attested in the
/// report at `path`.
pub fn enforce(path: &Path, manifest: &str) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read verify report {}", path.display()))?;
    let report: VerifyReport = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse verify report {}", path.display()))?;

    let attested = report
        .inputs
        .iter()
        .find(|input| input.kind == "chart")
        .and_then(|input| input.rendered_sha256.as_deref())
        .ok_or_else(|| {
            KtlError::Guard(format!(
                "verify-report-missing-input: {} has no chart input with a renderedSha256",
                path.display()
            ))
        })?;

    let actual = canonical_digest(manifest);
    if !attested.eq_ignore_ascii_case(&actual) {
        return Err(KtlError::Guard(format!(
            "verify-digest-mismatch: report attests {attested} but the rendered manifest digests to {actual}"
        ))
        .into());
    }
    Ok(())
}
