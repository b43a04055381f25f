//! Stable gateway identity.
//!
//! Mirrors the daemon's `identity` module: a SHA-256 fingerprint of stable
//! local inputs, hex-encoded. Used only for log correlation and the
//! `gateway_id` field of `network_stats.json` — it carries no protocol
//! meaning and is unrelated to peer public keys.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Derive (or load) a stable gateway id rooted at `data_dir`.
///
/// On first call, generates an id from the hostname plus a random salt
/// persisted at `{data_dir}/gateway_id`, so the id survives restarts but is
/// not derived purely from guessable machine properties.
pub fn get_or_create_gateway_id(data_dir: &Path) -> anyhow::Result<String> {
    let path = data_dir.join("gateway_id");

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }

    std::fs::create_dir_all(data_dir)?;

    let hostname = hostname_best_effort();
    let salt: [u8; 16] = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(salt);
    let id = hex::encode(hasher.finalize());

    std::fs::write(&path, &id)?;
    Ok(id)
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_calls() {
        let dir = tempfile_dir();
        let a = get_or_create_gateway_id(&dir).unwrap();
        let b = get_or_create_gateway_id(&dir).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("gateway-identity-test-{}", rand_suffix()));
        dir
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64
    }
}
