//! Credential masking for the `Authorization` header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha512};

/// Mask a credential as `sha512-<base64 digest>?<last 4 chars>`.
///
/// The digest covers the whole value, so identical credentials map to
/// identical masks and can still be correlated without being stored.
pub fn mask(value: &str) -> String {
    let digest = Sha512::digest(value.as_bytes());
    let tail: String = {
        let chars: Vec<char> = value.chars().collect();
        let start = chars.len().saturating_sub(4);
        chars[start..].iter().collect()
    };

    format!("sha512-{}?{}", STANDARD.encode(digest), tail)
}
