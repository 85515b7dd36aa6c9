//! Identifier helpers: machine fingerprint and the per-response IDs the
//! OpenAI surface hands out.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable per-host/user fingerprint, sent to the upstream in the User-Agent.
///
/// Deterministic for a given hostname/username pair so the upstream sees the
/// same "machine" across process restarts.
pub fn machine_fingerprint() -> String {
    let hostname = hostname();
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let seed = format!("{hostname}-{username}-kiro-gateway");
    hex::encode(Sha256::digest(seed.as_bytes()))
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

/// `chatcmpl-` + 32 lowercase hex chars, stable across all chunks of one
/// response.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// `call_` + 8 hex chars, for tool calls the upstream didn't id itself.
pub fn tool_call_id() -> String {
    let hex32 = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex32[..8])
}

/// Fresh conversation UUID for each upstream request.
pub fn conversation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_hex() {
        let a = machine_fingerprint();
        let b = machine_fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn completion_id_shape() {
        let id = completion_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 32);
    }

    #[test]
    fn tool_call_id_shape() {
        let id = tool_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 8);
    }

    #[test]
    fn conversation_ids_are_unique() {
        assert_ne!(conversation_id(), conversation_id());
    }
}
