use anyhow::{Context, Result};
use dirs;
use sha2::{Digest, Sha256};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn expand_home(path_str: &str) -> Option<PathBuf> {
    if path_str == "~" {
        return dirs::home_dir();
    }
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return Some(home.join(stripped));
        }
        return None;
    }
    Some(PathBuf::from(path_str))
}

pub fn normalize_path(path_str: &str) -> Result<PathBuf> {
    let expanded = expand_home(path_str).context("Could not expand home directory")?;
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .context("Could not resolve current directory")?
            .join(expanded)
    };

    absolute.canonicalize().or_else(|_| Ok(absolute))
}

/// Short unique token derived from pid, wall clock, and a per-call random
/// seed. Used to tag stash entries and scratch directories so concurrent or
/// interrupted runs never collide.
pub fn unique_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seed = RandomState::new().build_hasher().finish();

    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(seed.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}
