use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub version: Option<String>,
    /// UDP listen address. Defaults to 0.0.0.0:5354 to stay clear of mDNS and
    /// privileged ports.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// Recursive resolver consulted on cache misses.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Receive buffer per datagram; longer requests are truncated by the kernel.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Receive loops, each on its own SO_REUSEPORT socket. 0 means one per CPU.
    #[serde(default)]
    pub udp_workers: usize,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Seconds between metrics lines in the log; 0 disables them.
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Burst size per source address.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// One token is returned per elapsed interval.
    #[serde(default = "default_refill_ms")]
    pub refill_ms: u64,
    /// Buckets untouched this long are forgotten.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
    /// Upper bound on how long a resolved value is served from cache.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: None,
            bind_udp: default_bind_udp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            max_datagram_size: default_max_datagram_size(),
            udp_workers: 0,
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_ms: default_refill_ms(),
            idle_secs: default_idle_secs(),
            sweep_secs: default_sweep_secs(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            freshness_secs: default_freshness_secs(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_udp
            .parse()
            .with_context(|| format!("parse bind address: {}", self.bind_udp))
    }

    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        self.upstream
            .parse()
            .with_context(|| format!("parse upstream address: {}", self.upstream))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Overrides from `UPSTREAM_DNS`, `RATE_LIMIT_CAPACITY` and
    /// `RATE_LIMIT_REFILL` (whole seconds). `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(upstream) = lookup("UPSTREAM_DNS").filter(|v| !v.trim().is_empty()) {
            self.upstream = upstream.trim().to_string();
        }
        if let Some(raw) = lookup("RATE_LIMIT_CAPACITY") {
            self.rate_limit.capacity = raw
                .trim()
                .parse()
                .with_context(|| format!("parse RATE_LIMIT_CAPACITY: {raw}"))?;
        }
        if let Some(raw) = lookup("RATE_LIMIT_REFILL") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("parse RATE_LIMIT_REFILL: {raw}"))?;
            self.rate_limit.refill_ms = secs.saturating_mul(1000);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.upstream_addr()?;
        if self.rate_limit.capacity == 0 {
            anyhow::bail!("rate_limit.capacity must be at least 1");
        }
        if self.rate_limit.refill_ms == 0 {
            anyhow::bail!("rate_limit.refill_ms must be positive");
        }
        if self.rate_limit.sweep_secs == 0 {
            anyhow::bail!("rate_limit.sweep_secs must be positive");
        }
        if self.upstream_timeout_ms == 0 {
            anyhow::bail!("upstream_timeout_ms must be positive");
        }
        if self.max_datagram_size < crate::proto_utils::HEADER_LEN {
            anyhow::bail!("max_datagram_size {} cannot hold a header", self.max_datagram_size);
        }
        if self.cache.freshness_secs == 0 {
            anyhow::bail!("cache.freshness_secs must be positive");
        }
        Ok(())
    }
}

/// Reads `path` when given, otherwise starts from defaults, then applies
/// environment overrides. Not validated: callers layer CLI flags on top and
/// call [`ServerConfig::validate`] once.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    read_config(path, |key| std::env::var(key).ok())
}

fn read_config<F>(path: Option<&Path>, env: F) -> Result<ServerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read config file: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse config file: {}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.apply_env(env)?;
    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:5354".to_string()
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_max_datagram_size() -> usize {
    512
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_capacity() -> u32 {
    100
}

fn default_refill_ms() -> u64 {
    1000
}

fn default_idle_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_secs() -> u64 {
    60 * 60
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_freshness_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn empty_object_takes_all_defaults() {
        let cfg: ServerConfig = serde_json::from_value(json!({})).expect("parse config");
        assert_eq!(cfg.bind_udp, "0.0.0.0:5354");
        assert_eq!(cfg.upstream, "8.8.8.8:53");
        assert_eq!(cfg.max_datagram_size, 512);
        assert_eq!(cfg.rate_limit.capacity, 100);
        assert_eq!(cfg.rate_limit.refill_ms, 1000);
        assert_eq!(cfg.rate_limit.idle_secs, 86_400);
        assert_eq!(cfg.cache.freshness_secs, 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn nested_sections_fill_missing_fields() {
        let raw = json!({
            "upstream": "1.1.1.1:53",
            "rate_limit": { "capacity": 3 },
            "cache": { "max_capacity": 50 }
        });
        let cfg: ServerConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.upstream_addr().expect("addr"), "1.1.1.1:53".parse().unwrap());
        assert_eq!(cfg.rate_limit.capacity, 3);
        assert_eq!(cfg.rate_limit.refill_ms, 1000);
        assert_eq!(cfg.cache.max_capacity, 50);
        assert_eq!(cfg.cache.freshness_secs, 300);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("UPSTREAM_DNS", "9.9.9.9:53"),
            ("RATE_LIMIT_CAPACITY", "3"),
            ("RATE_LIMIT_REFILL", "2"),
        ]);
        let mut cfg = ServerConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()))
            .expect("apply env");
        assert_eq!(cfg.upstream, "9.9.9.9:53");
        assert_eq!(cfg.rate_limit.capacity, 3);
        assert_eq!(cfg.rate_limit.refill_ms, 2000);
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let mut cfg = ServerConfig::default();
        let err = cfg
            .apply_env(|k| (k == "RATE_LIMIT_CAPACITY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_CAPACITY"));
    }

    #[test]
    fn bad_env_upstream_can_be_replaced_before_validation() {
        let mut cfg = read_config(None, |k| (k == "UPSTREAM_DNS").then(|| "resolver.lan".to_string()))
            .expect("load without validating");
        assert_eq!(cfg.upstream, "resolver.lan");
        assert!(cfg.validate().is_err());

        cfg.upstream = "192.0.2.53:53".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_limits_and_bad_addresses() {
        let mut cfg = ServerConfig::default();
        cfg.rate_limit.capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.rate_limit.refill_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.upstream = "not-an-address".into();
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.bind_udp = "0.0.0.0".into();
        assert!(cfg.validate().is_err());
    }
}
