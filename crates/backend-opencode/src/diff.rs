//! Structured-diff synthesis and diff-key hashing for file-writing tools.

use sha2::{Digest, Sha256};
use similar::TextDiff;

const DIFF_CONTEXT_LINES: usize = 3;
const DIFF_KEY_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedDiff {
    pub unified: String,
    pub additions: u64,
    pub deletions: u64,
}

/// Unified context-3 hunks for a content transition. Writes pass
/// `("", content)`, edits pass `(old_string, new_string)`.
pub fn synthesize_diff(before: &str, after: &str) -> SynthesizedDiff {
    let diff = TextDiff::from_lines(before, after);
    let mut additions = 0u64;
    let mut deletions = 0u64;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => additions += 1,
            similar::ChangeTag::Delete => deletions += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    let unified = diff
        .unified_diff()
        .context_radius(DIFF_CONTEXT_LINES)
        .to_string();
    SynthesizedDiff {
        unified,
        additions,
        deletions,
    }
}

/// Dedup key correlating a tool-call diff with a later session-level diff
/// summary for the same content transition.
pub fn diff_key(session_id: &str, normalized_path: &str, before: &str, after: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(before.as_bytes());
    hasher.update(b"|");
    hasher.update(after.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(DIFF_KEY_HEX_LEN);
    for byte in digest.iter().take(DIFF_KEY_HEX_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{session_id}:{normalized_path}:{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_diff_counts_every_line_as_added() {
        let diff = synthesize_diff("", "line one\nline two\n");
        assert_eq!(diff.additions, 2);
        assert_eq!(diff.deletions, 0);
        assert!(diff.unified.contains("+line one"));
    }

    #[test]
    fn edit_diff_counts_changed_lines_both_ways() {
        let diff = synthesize_diff("a\nb\nc\n", "a\nB\nc\n");
        assert_eq!(diff.additions, 1);
        assert_eq!(diff.deletions, 1);
        assert!(diff.unified.contains("-b"));
        assert!(diff.unified.contains("+B"));
    }

    #[test]
    fn diff_keys_are_stable_and_content_sensitive() {
        let first = diff_key("ses-1", "src/a.rs", "", "x");
        let again = diff_key("ses-1", "src/a.rs", "", "x");
        let other_content = diff_key("ses-1", "src/a.rs", "", "y");
        let other_session = diff_key("ses-2", "src/a.rs", "", "x");
        assert_eq!(first, again);
        assert_ne!(first, other_content);
        assert_ne!(first, other_session);
        assert!(first.starts_with("ses-1:src/a.rs:"));
    }
}
