//! Built sandbox base images: the tag grammar and the in-process registry.

pub mod builder;
pub mod registry;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A built sandbox base image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub tag: String,
    pub digest: String,
    /// `"org/repo"`.
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub built_at: u64,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub services: Vec<String>,
    pub is_latest: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Parsed form of an image tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTag {
    pub registry: Option<String>,
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub timestamp: Option<u64>,
    pub is_latest: bool,
}

/// Emit a tag: `{registry?}/opencode/{org}/{repo}:{branch}-{ts|latest}`.
pub fn generate_tag(
    registry: Option<&str>,
    org: &str,
    repo: &str,
    branch: &str,
    timestamp: Option<u64>,
) -> String {
    let suffix = match timestamp {
        Some(ts) => ts.to_string(),
        None => "latest".to_string(),
    };
    match registry {
        Some(prefix) => format!("{prefix}/opencode/{org}/{repo}:{branch}-{suffix}"),
        None => format!("opencode/{org}/{repo}:{branch}-{suffix}"),
    }
}

/// Parse `{registry?}/opencode/{org}/{repo}:{branch}-{ts|latest}`.
///
/// The suffix after the final `-` is either the literal `latest` or a decimal
/// timestamp; branches themselves may contain dashes.
pub fn parse_tag(tag: &str) -> Option<ParsedTag> {
    let colon = tag.rfind(':')?;
    let (path, tag_part) = (&tag[..colon], &tag[colon + 1..]);
    if tag_part.is_empty() || tag_part.contains('/') {
        return None;
    }

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 3 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    let repo = segments[segments.len() - 1];
    let org = segments[segments.len() - 2];
    if segments[segments.len() - 3] != "opencode" {
        return None;
    }
    let registry = if segments.len() > 3 {
        Some(segments[..segments.len() - 3].join("/"))
    } else {
        None
    };

    let dash = tag_part.rfind('-')?;
    let (branch, suffix) = (&tag_part[..dash], &tag_part[dash + 1..]);
    if branch.is_empty() || suffix.is_empty() {
        return None;
    }

    let (timestamp, is_latest) = if suffix == "latest" {
        (None, true)
    } else {
        (Some(suffix.parse::<u64>().ok()?), false)
    };

    Some(ParsedTag {
        registry,
        org: org.to_string(),
        repo: repo.to_string(),
        branch: branch.to_string(),
        timestamp,
        is_latest,
    })
}
