//! Shared utility functions used across the codebase.

use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;

const REASONING_OPEN: &str = "<think>";
const REASONING_CLOSE: &str = "</think>";

/// Remove reasoning-only spans (`<think>...</think>`) from a model answer.
///
/// Matching is ASCII case-insensitive. An unclosed opening marker hides the
/// rest of the text. The result is trimmed.
pub fn strip_reasoning(text: &str) -> String {
    // Search the original bytes; lowercasing first would shift offsets on non-ASCII input.
    fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
        let needle_len = needle.len();
        if haystack.len() < needle_len {
            return None;
        }
        haystack
            .as_bytes()
            .windows(needle_len)
            .position(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
    }

    if find_ci(text, REASONING_OPEN).is_none() {
        return text.trim().to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut pos = 0;

    while pos < text.len() {
        let Some(rel_start) = find_ci(&text[pos..], REASONING_OPEN) else {
            result.push_str(&text[pos..]);
            break;
        };
        let abs_start = pos + rel_start;
        result.push_str(&text[pos..abs_start]);

        let after_open = abs_start + REASONING_OPEN.len();
        match find_ci(&text[after_open..], REASONING_CLOSE) {
            Some(rel_close) => pos = after_open + rel_close + REASONING_CLOSE.len(),
            None => break,
        }
    }

    result.trim().to_string()
}

/// Reduce an uploaded file name to a safe single path component. Letters and
/// digits of any script are kept.
pub fn sanitize_file_name(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars =
        UNSAFE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}._-]+").expect("static regex"));

    // Browsers may send a full client path.
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = unsafe_chars.replace_all(base.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Check whether `target` stays inside `base`, even if it doesn't exist yet.
/// Returns false for traversal components or symlinks that escape `base`.
pub fn path_within(base: &Path, target: &Path) -> bool {
    if target
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return false;
    }

    let Ok(base_canonical) = base.canonicalize() else {
        return false;
    };

    if target.exists() {
        return match target.canonicalize() {
            Ok(target_canonical) => target_canonical.starts_with(&base_canonical),
            Err(_) => false,
        };
    }

    // Nearest existing ancestor decides.
    let mut current = target.to_path_buf();
    while let Some(parent) = current.parent() {
        if parent.exists() {
            return match parent.canonicalize() {
                Ok(parent_canonical) => parent_canonical.starts_with(&base_canonical),
                Err(_) => false,
            };
        }
        current = parent.to_path_buf();
    }
    false
}
