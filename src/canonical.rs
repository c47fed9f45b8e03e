//! Canonical serialization for hashing
//!
//! Values are converted to a `serde_json::Value` first. Its object map is
//! ordered, so every object is written with sorted keys and no whitespace,
//! giving one byte representation per logical value.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// `prev_hash` of the first ledger entry and root of an empty Merkle tree
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Deterministic, key-sorted JSON text for `value`
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| LedgerError::Serialization(format!("cannot canonicalize value: {}", e)))?;
    Ok(serde_json::to_string(&value)?)
}

/// Lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical serialization of `value`
pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// True for a 64 character lowercase hex digest
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 2]}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"m":[3,2],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_struct_field_order_does_not_matter() {
        #[derive(Serialize)]
        struct Ab {
            b: u32,
            a: u32,
        }
        let text = canonical_json(&Ab { b: 2, a: 1 }).unwrap();
        assert_eq!(text, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_hex_digest(&sha256_hex(b"")));
        assert!(is_hex_digest(GENESIS_HASH));
        assert!(!is_hex_digest("sha256:abc"));
    }
}
