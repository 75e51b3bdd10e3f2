//! Canonical JSON and the hash primitive.
//!
//! `canonicalize` renders compact JSON with object keys in sorted order
//! (`serde_json::Map` is a `BTreeMap` here), so the same value always yields
//! the same bytes regardless of struct field order.

use crate::core::error::CanonryError;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, CanonryError> {
    let value = serde_json::to_value(value)?;
    Ok(value.to_string())
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text);
    format!("{:x}", hasher.finalize())
}

/// `SHA256(previous_hash ‖ canonical_payload)` as lowercase hex.
pub fn chain_hash(previous_hash: &str, canonical_payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical_payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
