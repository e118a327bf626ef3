//! Project-relative path normalization.
//!
//! Tool-call inputs report absolute paths while session-level diff
//! summaries report relative ones; both must normalize to the same string
//! or diff deduplication breaks.

/// Directory names treated as project roots. The first match wins, scanned
/// left to right.
const ROOT_TOKENS: &[&str] = &["src", "apps", "lib", "crates", "packages", "tests"];

const FALLBACK_SEGMENTS: usize = 3;

/// Canonicalize a path for diff-key purposes: strip everything before a
/// known root token, or keep the last three segments when no token matches.
pub fn normalize_project_path(raw: &str) -> String {
    let segments: Vec<&str> = raw
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "~")
        .collect();
    if segments.is_empty() {
        return String::new();
    }

    for (index, segment) in segments.iter().enumerate() {
        if ROOT_TOKENS.contains(segment) {
            return segments[index..].join("/");
        }
    }

    let start = segments.len().saturating_sub(FALLBACK_SEGMENTS);
    segments[start..].join("/")
}
