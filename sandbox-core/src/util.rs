use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use once_cell::sync::OnceCell;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Client;

use crate::error::{Result, SandboxError};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Get the shared HTTP client. The timeout is set from `OrchestratorConfig`
/// on first initialization and reused for all subsequent calls.
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT
        .get_or_try_init(|| {
            let config = crate::config::OrchestratorConfig::load();
            Client::builder()
                .timeout(config.http_timeout)
                .build()
                .map_err(|err| SandboxError::Http(format!("Failed to build HTTP client: {err}")))
        })
        .map_err(|err| SandboxError::Http(err.to_string()))
}

pub fn now_ts() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque process-unique identifier: `{prefix}-{unix_ts}-{seq}`.
///
/// The monotonic counter guarantees uniqueness within a process even when
/// two IDs are minted in the same second.
pub fn next_id(prefix: &str) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq}", now_ts())
}

pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Split `"org/repo"`, `"github.com/org/repo"`, or a full clone URL into
/// `(org, repo)`. Trailing `.git` is stripped.
pub fn parse_repository(repository: &str) -> Result<(String, String)> {
    let trimmed = repository
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git@")
        .trim_end_matches('/');
    let path = trimmed.replace(':', "/");
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(SandboxError::Validation(format!(
            "Cannot parse repository '{repository}'"
        )));
    }
    let repo = segments.pop().unwrap_or_default().trim_end_matches(".git");
    let org = segments.pop().unwrap_or_default();
    if org.is_empty() || repo.is_empty() {
        return Err(SandboxError::Validation(format!(
            "Cannot parse repository '{repository}'"
        )));
    }
    Ok((org.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = next_id("sandbox");
        let b = next_id("sandbox");
        assert_ne!(a, b);
        assert!(a.starts_with("sandbox-"));
    }

    #[test]
    fn parse_repository_variants() {
        for input in [
            "acme/app",
            "github.com/acme/app",
            "https://github.com/acme/app",
            "https://github.com/acme/app.git",
            "git@github.com:acme/app.git",
        ] {
            let (org, repo) = parse_repository(input).unwrap();
            assert_eq!(org, "acme", "input: {input}");
            assert_eq!(repo, "app", "input: {input}");
        }
    }

    #[test]
    fn parse_repository_rejects_bare_name() {
        assert!(parse_repository("justarepo").is_err());
        assert!(parse_repository("").is_err());
    }
}
