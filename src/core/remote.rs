use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;

use crate::core::error::{AgentError, Result};
use crate::core::fetch::fetch_url;

/// An agent file that came from a URL: its cached local copy plus the host
/// it must be trusted against.
#[derive(Debug, Clone)]
pub struct RemoteAgent {
    pub local_path: PathBuf,
    pub host: String,
    pub url: String,
}

pub fn is_url(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// Fetch a remote agent file into `~/.mdflow/cache/`, reusing the cached
/// copy unless `no_cache` is set.
pub async fn fetch_remote_agent(
    client: &reqwest::Client,
    url: &str,
    no_cache: bool,
) -> Result<RemoteAgent> {
    let host = host_of(url)?;
    let cache_path = cache_path_for(url)?;

    if !no_cache && cache_path.is_file() {
        tracing::debug!("using cached agent: {}", cache_path.display());
        return Ok(RemoteAgent {
            local_path: cache_path,
            host,
            url: url.to_string(),
        });
    }

    let body = fetch_url(client, url).await?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::from_io(parent, e))?;
    }
    std::fs::write(&cache_path, &body).map_err(|e| AgentError::from_io(&cache_path, e))?;

    Ok(RemoteAgent {
        local_path: cache_path,
        host,
        url: url.to_string(),
    })
}

/// True when the host already appears in `~/.mdflow/known_hosts`.
pub fn is_trusted(host: &str) -> bool {
    let Some(path) = known_hosts_path() else {
        return false;
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    content.lines().any(|line| line.trim() == host)
}

/// Record a trust-on-first-use decision.
pub fn trust(host: &str) -> Result<()> {
    let path = known_hosts_path().ok_or_else(|| {
        AgentError::Configuration("cannot locate home directory".to_string())
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::from_io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| AgentError::from_io(&path, e))?;
    writeln!(file, "{host}").map_err(|e| AgentError::from_io(&path, e))?;
    Ok(())
}

pub fn host_of(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| AgentError::Network {
        url: url.to_string(),
        reason: format!("invalid URL: {e}"),
    })?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| AgentError::Network {
            url: url.to_string(),
            reason: "URL has no host".to_string(),
        })
}

fn known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mdflow").join("known_hosts"))
}

/// Cache filename: a readable slug plus a short hash so distinct URLs never
/// collide.
fn cache_path_for(url: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        AgentError::Configuration("cannot locate home directory".to_string())
    })?;

    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    let digest = hasher.finish();

    let slug: String = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(60)
        .collect();

    Ok(home
        .join(".mdflow")
        .join("cache")
        .join(format!("{slug}-{digest:016x}.md")))
}
