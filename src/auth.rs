//! obs-websocket challenge/salt authentication.
//!
//! The server's `Hello` carries a per-install `salt` and a per-connection
//! `challenge`. The client proves knowledge of the password without sending it:
//!
//! ```text
//! secret = base64(sha256(password + salt))
//! auth   = base64(sha256(secret + challenge))
//! ```
//!
//! Both base64 steps use the standard alphabet with padding.

use base64::Engine;
use sha2::{Digest, Sha256};

/// Compute the `authentication` string for an `Identify` message.
pub fn authentication_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret = sha256_base64(&[password.as_bytes(), salt.as_bytes()]);
    sha256_base64(&[secret.as_bytes(), challenge.as_bytes()])
}

/// SHA-256 over the concatenation of `parts`, base64-encoded.
fn sha256_base64(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
