//! Credential hashing as an explicit, named transformation step. The
//! accounts handler calls this when a password is set or changed; nothing
//! hashes implicitly on save.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stored form is `salt$hex(sha256(salt $ password))`.
pub fn hash_credential(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, digest_hex(&salt, password))
}

pub fn verify_credential(password: &str, stored: &str) -> bool {
    let Some((salt, hex)) = stored.split_once('$') else {
        return false;
    };
    digest_hex(salt, password) == hex
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
