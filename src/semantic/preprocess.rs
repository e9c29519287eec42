//! Note preprocessing for embedding generation.
//!
//! Prepares a note's title and body for embedding:
//! 1. Trim whitespace
//! 2. Skip if both empty
//! 3. Concatenate with separator
//! 4. Truncate to max length with ellipsis

use sha2::{Digest, Sha256};

/// Maximum content length for embedding input (characters, not tokens)
pub const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Preprocess title and body for embedding generation.
///
/// Returns `None` if both are empty after trimming.
pub fn preprocess_content(title: &str, body: &str) -> Option<String> {
    let title = title.trim();
    let body = body.trim();

    if title.is_empty() && body.is_empty() {
        return None;
    }

    let content = if title.is_empty() {
        body.to_string()
    } else if body.is_empty() {
        title.to_string()
    } else {
        format!("{title} - {body}")
    };

    Some(truncate_content(&content))
}

/// Truncate to MAX_CONTENT_LENGTH characters, ellipsis included.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{truncated}{TRUNCATION_SUFFIX}")
}

/// Hash of the trimmed title and body, stable across processes and builds.
///
/// Stored in row metadata to decide whether a note needs re-embedding.
pub fn content_hash(title: &str, body: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    // separator so ("ab", "c") and ("a", "bc") differ
    hasher.update([0u8]);
    hasher.update(body.trim().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}
