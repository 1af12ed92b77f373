//! Device fingerprint derivation.
//!
//! Clients normally send a precomputed fingerprint hash. When they only send
//! the raw attribute blob, the hash is derived here so the same attributes
//! always map to the same device row.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON text of the attributes, URL-safe base64.
///
/// `serde_json` objects are key-ordered maps, so attribute order in the
/// request does not change the hash.
pub fn fingerprint_hash(device_data: &Value) -> String {
    let canonical = device_data.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}
