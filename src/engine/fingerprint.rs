//! Decision-Window Fingerprint
//!
//! Deterministic SHA-256 fingerprint over (prompt template version,
//! canonical context payload). Two windows built from identical inputs hash
//! identically, so a repeat within the dedupe horizon is served from cache
//! instead of issuing a new paid call.
//!
//! The canonicalization burden lives in the context builder (fixed field
//! order, sorted ticker selection); this module only frames and hashes.

use sha2::{Digest, Sha256};

/// Version prefix; bump when the framing or payload format changes.
pub const FINGERPRINT_VERSION: &str = "DECFP_V1";

/// Hex-encoded SHA-256 fingerprint of one decision window's input.
pub fn window_fingerprint(prompt_version: &str, canonical_context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_context.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_identical_fingerprint() {
        let a = window_fingerprint("v1", r#"{"as_of":"2025-01-02T10:00:00","tickers":[]}"#);
        let b = window_fingerprint("v1", r#"{"as_of":"2025-01-02T10:00:00","tickers":[]}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "sha256 hex digest");
    }

    #[test]
    fn prompt_version_is_part_of_the_input() {
        let payload = r#"{"as_of":"2025-01-02T10:00:00","tickers":[]}"#;
        assert_ne!(
            window_fingerprint("v1", payload),
            window_fingerprint("v2", payload)
        );
    }

    #[test]
    fn separator_prevents_boundary_ambiguity() {
        assert_ne!(window_fingerprint("ab", "c"), window_fingerprint("a", "bc"));
    }
}
