use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a short hex identifier (8 chars) for tasks and processes.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Current time as an ISO8601 UTC string, the format used throughout the
/// history store.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// SHA256[:16] hash of a prompt, used for deduplication in the task log.
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}
