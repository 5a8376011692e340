//! Post-processing of model output. Some deployments emit their internal
//! deliberation wrapped in `<think>...</think>` markers; end users must never
//! see it.

use once_cell::sync::Lazy;
use regex::Regex;

// (?s) so reasoning segments spanning multiple lines are caught; trailing
// whitespace after the closing marker goes with the segment.
static THINK_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").expect("valid reasoning pattern"));

/// Strip every well-formed reasoning segment and trim the remainder.
///
/// An unmatched opening marker is left intact: truncating to end-of-string
/// risks destroying a legitimate answer over a stray token.
pub fn strip_reasoning(raw: &str) -> String {
    THINK_SEGMENT.replace_all(raw, "").trim().to_string()
}
