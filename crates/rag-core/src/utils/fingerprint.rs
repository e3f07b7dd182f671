use sha2::{Digest, Sha256};

/// Canonical form of a query used for cache lookups: surrounding whitespace
/// removed, inner whitespace runs collapsed, lowercased.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable cache key for already-normalized text (hex SHA-256).
pub fn fingerprint(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}
