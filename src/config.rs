use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP port to serve on. The CLI positional argument overrides this.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listener workers; 0 means hardware parallelism (at least 4).
    #[serde(default)]
    pub workers: usize,
    /// Seconds between stats report blocks.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Per-attempt upstream timeout (milliseconds).
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Upstream servers tried in order; empty falls back to the host
    /// resolver.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,
    /// Locally-authoritative names answered from the precompiled table.
    #[serde(default = "default_local_domains")]
    pub local_domains: HashMap<String, Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: 0,
            stats_interval_secs: default_stats_interval_secs(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            upstreams: default_upstreams(),
            local_domains: default_local_domains(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw).context("parse config json")?;
    info!(path = %path.display(), local_domains = cfg.local_domains.len(), "configuration loaded");
    Ok(cfg)
}

fn default_port() -> u16 {
    5353
}

fn default_stats_interval_secs() -> u64 {
    30
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_upstreams() -> Vec<String> {
    vec![
        "8.8.8.8:53".to_string(),
        "1.1.1.1:53".to_string(),
        "208.67.222.222:53".to_string(),
    ]
}

fn default_local_domains() -> HashMap<String, Ipv4Addr> {
    HashMap::from([("localhost".to_string(), Ipv4Addr::new(127, 0, 0, 1))])
}
