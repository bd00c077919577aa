//! Unified text diffs between normalized document sets.

use similar::TextDiff;

/// Unified diff with 3 lines of context, `live` -> `desired`.
///
/// Empty input on either side means "the object does not exist", which
/// produces a one-sided diff. Equal inputs return the empty string.
pub fn unified(live: &str, desired: &str) -> String {
    if live == desired {
        return String::new();
    }
    TextDiff::from_lines(live, desired)
        .unified_diff()
        .context_radius(3)
        .header("live", "desired")
        .to_string()
}
