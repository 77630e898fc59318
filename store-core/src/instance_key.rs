//! Instance-key derivation (spec.md §4.6, testable property #5).
//!
//! Local "instance names" can carry a `name_key` suffix to distinguish
//! parallel installs of the same snap. That suffix must never reach the
//! wire: instead we derive an opaque key that the server can use to
//! correlate a `CurrentSnap`/`SnapAction` with its result, without learning
//! anything about the local naming scheme.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Derives the wire instance-key for a snap.
///
/// - If `instance_key_part` is `None`, the raw snap-id is used verbatim.
/// - Otherwise, the key is `<snap-id>:<base64url(sha256(snap_id ||
///   instance_key_part || salt))>`, with no padding.
pub fn derive(snap_id: &str, instance_key_part: Option<&str>, salt: &[u8]) -> String {
    match instance_key_part {
        None => snap_id.to_owned(),
        Some(part) => {
            let mut hasher = Sha256::new();
            hasher.update(snap_id.as_bytes());
            hasher.update(part.as_bytes());
            hasher.update(salt);
            let digest = hasher.finalize();

            format!("{}:{}", snap_id, URL_SAFE_NO_PAD.encode(digest))
        }
    }
}

/// Synthesizes the key for an install/download action, which has no
/// `CurrentSnap` counterpart to correlate against.
pub fn synthetic(prefix: &str, index: usize) -> String {
    format!("{}-{}", prefix, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_instance_key_part_uses_raw_snap_id() {
        assert_eq!(derive("abc123", None, b"salt"), "abc123");
    }

    #[test]
    fn instance_key_part_is_never_present_in_wire_form() {
        let key = derive("abc123", Some("my-secret-local-alias"), b"salt");
        assert!(key.starts_with("abc123:"));
        assert!(!key.contains("my-secret-local-alias"));
    }

    #[test]
    fn is_deterministic_given_the_same_salt() {
        let a = derive("abc123", Some("variant"), b"salt");
        let b = derive("abc123", Some("variant"), b"salt");
        assert_eq!(a, b);
    }

    #[test]
    fn differs_across_salts() {
        let a = derive("abc123", Some("variant"), b"salt-a");
        let b = derive("abc123", Some("variant"), b"salt-b");
        assert_ne!(a, b);
    }

    #[test]
    fn synthetic_keys_are_sequential() {
        assert_eq!(synthetic("install", 0), "install-0");
        assert_eq!(synthetic("download", 3), "download-3");
    }
}
