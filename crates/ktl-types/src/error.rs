use thiserror::Error;

/// Fatal error kinds, all distinguishable at the CLI boundary.
///
/// Non-fatal conditions (discovery misses, live-lookup fallback, observer
/// queue overflow) surface as warnings and never take this shape.
#[derive(Debug, Clone, Error)]
pub enum KtlError {
    /// Missing required input, malformed value override, unparseable
    /// quantity, duplicate manifest keys.
    #[error("{0}")]
    Input(String),

    /// The template engine rejected the chart or values.
    #[error("render failed: {0}")]
    Render(String),

    /// The REST mapper could not resolve a user-required kind.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Cluster unreachable or permission denied for a specific lookup.
    /// Triggers offline fallback during plan; fatal inside the drift guard.
    #[error("live lookup failed: {0}")]
    LiveLookup(String),

    /// Drift detected, verify digest mismatch, or a compare regression with
    /// `--compare-exit`. Always fatal before any mutation.
    #[error("{0}")]
    Guard(String),

    /// The installer rejected or failed the operation.
    #[error("install failed: {0}")]
    Install(String),

    /// Context cancelled or timed out.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl KtlError {
    /// Process exit code for the embedding CLI.
    ///
    /// 1 user input, 2 guard block, 3 cluster/installer failure,
    /// 4 cancellation/timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            KtlError::Input(_) | KtlError::Render(_) => 1,
            KtlError::Guard(_) => 2,
            KtlError::Discovery(_) | KtlError::LiveLookup(_) | KtlError::Install(_) => 3,
            KtlError::Cancelled(_) => 4,
        }
    }
}
