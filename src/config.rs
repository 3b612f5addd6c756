//! YAML configuration.
//!
//! One YAML file configures every runnable target; each process loads the
//! same file and selects its role via `target`. Durations are strings like
//! `"250ms"`, `"3s"`, `"10m"`, `"2h"`, `"1d"`. Rate-quota units are the
//! names `second`, `minute`, `hour`, `day`.
//!
//! When `expand_env` is enabled (or `QMS_EXPAND_ENV=true`), `${VAR}`
//! references in the raw file are replaced from the process environment
//! before parsing, so secrets and per-host addresses can stay out of the
//! checked-in file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Target ────────────────────────────────────────────────────────────────────

/// The role a process runs. `All` hosts every component in one binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Proxy,
    Rate,
    Alloc,
    All,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Proxy => "proxy",
            Target::Rate => "rate",
            Target::Alloc => "alloc",
            Target::All => "all",
        }
    }

    pub fn runs_proxy(&self) -> bool {
        matches!(self, Target::Proxy | Target::All)
    }

    pub fn runs_rate(&self) -> bool {
        matches!(self, Target::Rate | Target::All)
    }

    pub fn runs_alloc(&self) -> bool {
        matches!(self, Target::Alloc | Target::All)
    }
}

impl FromStr for Target {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proxy" => Ok(Target::Proxy),
            "rate" => Ok(Target::Rate),
            "alloc" => Ok(Target::Alloc),
            "all" => Ok(Target::All),
            other => Err(ConfigError::InvalidTarget(other.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Durations and time units ──────────────────────────────────────────────────

/// Duration format for YAML: either plain seconds or a string with a unit
/// suffix (`ms`, `s`, `m`, `h`, `d`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            DurationValue::Seconds(s) => Ok(Duration::from_secs(*s)),
            DurationValue::Text(s) => parse_duration_string(s),
        }
    }
}

/// Parses a duration string like "250ms", "3s", "10m", "2h", "1d".
pub fn parse_duration_string(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = |message: &str| ConfigError::InvalidDuration {
        value: s.to_string(),
        message: message.to_string(),
    };

    if s.is_empty() {
        return Err(invalid("duration string cannot be empty"));
    }

    let (value_str, multiplier_nanos) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1_000_000u64)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000_000_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60 * 1_000_000_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 60 * 60 * 1_000_000_000)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 24 * 60 * 60 * 1_000_000_000)
    } else {
        return Err(invalid("unknown unit, use 'ms', 's', 'm', 'h', or 'd'"));
    };

    let value: u64 = value_str
        .parse()
        .map_err(|_| invalid("invalid numeric value"))?;

    Ok(Duration::from_nanos(value * multiplier_nanos))
}

/// A rate-quota time unit, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUnit(pub i64);

impl TimeUnit {
    pub fn parse(unit: &str) -> Result<Self, ConfigError> {
        match unit {
            "second" => Ok(TimeUnit(1)),
            "minute" => Ok(TimeUnit(60)),
            "hour" => Ok(TimeUnit(60 * 60)),
            "day" => Ok(TimeUnit(24 * 60 * 60)),
            other => Err(ConfigError::UnsupportedUnit(other.to_string())),
        }
    }

    pub fn seconds(&self) -> i64 {
        self.0
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_http_port() -> u16 {
    6789
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberlistConfig {
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,

    /// Advertised bind host for gossip traffic.
    #[serde(default = "default_gossip_host")]
    pub gossip_host: String,

    /// Seed addresses: literal `host:port` or SRV names containing `+`.
    #[serde(default)]
    pub join_addresses: Vec<String>,

    /// Zero disables periodic rejoin.
    #[serde(default = "default_rejoin_interval")]
    pub rejoin_interval: DurationValue,

    #[serde(default = "default_min_join_backoff")]
    pub min_join_backoff: DurationValue,

    #[serde(default = "default_max_join_backoff")]
    pub max_join_backoff: DurationValue,

    #[serde(default = "default_max_join_retries")]
    pub max_join_retries: u32,

    #[serde(default = "default_leave_timeout")]
    pub leave_timeout: DurationValue,
}

fn default_cluster_id() -> String {
    "qms".to_string()
}

fn default_gossip_port() -> u16 {
    7946
}

fn default_gossip_host() -> String {
    "0.0.0.0".to_string()
}

fn default_rejoin_interval() -> DurationValue {
    DurationValue::Seconds(0)
}

fn default_min_join_backoff() -> DurationValue {
    DurationValue::Text("1s".to_string())
}

fn default_max_join_backoff() -> DurationValue {
    DurationValue::Text("30s".to_string())
}

fn default_max_join_retries() -> u32 {
    10
}

fn default_leave_timeout() -> DurationValue {
    DurationValue::Text("10s".to_string())
}

impl Default for MemberlistConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty memberlist config parses")
    }
}

/// Load-balancing policy for a proxy tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LbStrategy {
    /// Consistent hash on `namespace_resource`; one owner per key.
    #[serde(rename = "hash-ring")]
    HashRing,
    /// Contact every back-end in order until one succeeds. Used when the
    /// back-end is internally replicated and any replica can serve.
    #[serde(rename = "round-robin")]
    RoundRobin,
}

impl Default for LbStrategy {
    fn default() -> Self {
        LbStrategy::HashRing
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Discovery targets for the rate tier.
    #[serde(default)]
    pub rate_addresses: Vec<String>,

    /// Discovery targets for the alloc tier.
    #[serde(default)]
    pub alloc_addresses: Vec<String>,

    #[serde(default)]
    pub rate_lb_strategy: LbStrategy,

    #[serde(default)]
    pub alloc_lb_strategy: LbStrategy,
}

// ── Rate quotas ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateStrategyConfig {
    pub algorithm: String,
    pub unit: String,
    pub requests_per_unit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateQuotaConfig {
    pub namespace: String,
    pub resource: String,
    pub strategy: RateStrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default)]
    pub quotas: Vec<RateQuotaConfig>,
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            quotas: Vec::new(),
        }
    }
}

// ── Alloc quotas ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocStrategyConfig {
    pub capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocQuotaConfig {
    pub namespace: String,
    pub resource: String,
    pub strategy: AllocStrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_dir")]
    pub dir: String,
}

fn default_local_dir() -> String {
    "/tmp/qms/data/local".to_string()
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            dir: default_local_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStorageConfig {
    /// Whether this replica should join an existing cluster rather than
    /// bootstrap a new one. Replica 1 bootstraps regardless.
    #[serde(default)]
    pub join: bool,

    #[serde(default = "default_replica_id")]
    pub replica_id: u64,

    #[serde(default = "default_shards")]
    pub shards: u64,

    #[serde(default = "default_raft_dir")]
    pub dir: String,
}

fn default_replica_id() -> u64 {
    1
}

fn default_shards() -> u64 {
    4
}

fn default_raft_dir() -> String {
    "/tmp/qms/data/raft".to_string()
}

impl Default for RaftStorageConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty raft config parses")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocConfig {
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default)]
    pub local: LocalStorageConfig,

    #[serde(default)]
    pub raft: RaftStorageConfig,

    #[serde(default)]
    pub quotas: Vec<AllocQuotaConfig>,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            local: LocalStorageConfig::default(),
            raft: RaftStorageConfig::default(),
            quotas: Vec::new(),
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: Target,

    #[serde(default)]
    pub expand_env: bool,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub memberlist: MemberlistConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub rate: RateConfig,

    #[serde(default)]
    pub alloc: AllocConfig,
}

impl Config {
    /// Loads and parses the config file. `${VAR}` expansion runs when either
    /// the file sets `expand_env: true` or `QMS_EXPAND_ENV=true` is set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let first_pass: Config = serde_yaml::from_str(raw)?;

        let env_requested = std::env::var("QMS_EXPAND_ENV")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        if first_pass.expand_env || env_requested {
            let expanded = expand_env(raw);
            Ok(serde_yaml::from_str(&expanded)?)
        } else {
            Ok(first_pass)
        }
    }
}

/// Replaces `${VAR}` references with values from the environment. Unknown
/// variables expand to the empty string.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let cfg = Config::parse("target: all\n").unwrap();
        assert_eq!(cfg.target, Target::All);
        assert_eq!(cfg.server.http_port, 6789);
        assert_eq!(cfg.memberlist.gossip_port, 7946);
        assert_eq!(cfg.alloc.backend, "memory");
        assert_eq!(cfg.alloc.raft.shards, 4);
    }

    #[test]
    fn parses_quota_lists() {
        let yaml = r#"
target: alloc
alloc:
  backend: local
  local:
    dir: /var/lib/qms
  quotas:
    - namespace: pool
      resource: mem
      strategy:
        capacity: 10
rate:
  quotas:
    - namespace: svc
      resource: req
      strategy:
        algorithm: token-bucket
        unit: second
        requests_per_unit: 100
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.alloc.backend, "local");
        assert_eq!(cfg.alloc.local.dir, "/var/lib/qms");
        assert_eq!(cfg.alloc.quotas.len(), 1);
        assert_eq!(cfg.alloc.quotas[0].strategy.capacity, 10);
        assert_eq!(cfg.rate.quotas[0].strategy.requests_per_unit, 100);
    }

    #[test]
    fn rejects_unknown_targets() {
        assert!(Config::parse("target: shard\n").is_err());
        assert!("shard".parse::<Target>().is_err());
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(
            parse_duration_string("250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(parse_duration_string("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(
            parse_duration_string("10m").unwrap(),
            Duration::from_secs(600)
        );
        assert_eq!(
            parse_duration_string("2h").unwrap(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            parse_duration_string("1d").unwrap(),
            Duration::from_secs(86400)
        );
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("10x").is_err());
        assert!(parse_duration_string("tens").is_err());
    }

    #[test]
    fn time_units_parse() {
        assert_eq!(TimeUnit::parse("second").unwrap().seconds(), 1);
        assert_eq!(TimeUnit::parse("minute").unwrap().seconds(), 60);
        assert_eq!(TimeUnit::parse("hour").unwrap().seconds(), 3600);
        assert_eq!(TimeUnit::parse("day").unwrap().seconds(), 86400);
        assert!(TimeUnit::parse("fortnight").is_err());
    }

    #[test]
    fn lb_strategy_names_parse() {
        let yaml = r#"
target: proxy
proxy:
  rate_lb_strategy: hash-ring
  alloc_lb_strategy: round-robin
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.proxy.rate_lb_strategy, LbStrategy::HashRing);
        assert_eq!(cfg.proxy.alloc_lb_strategy, LbStrategy::RoundRobin);
    }

    #[test]
    fn env_expansion_replaces_references() {
        std::env::set_var("QMS_TEST_DIR", "/data/qms");
        let yaml = "target: alloc\nexpand_env: true\nalloc:\n  local:\n    dir: ${QMS_TEST_DIR}\n";
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.alloc.local.dir, "/data/qms");
        std::env::remove_var("QMS_TEST_DIR");
    }

    #[test]
    fn expand_env_leaves_plain_text_alone() {
        assert_eq!(expand_env("a: b\n"), "a: b\n");
        std::env::set_var("QMS_TEST_VAR", "x");
        assert_eq!(expand_env("v: ${QMS_TEST_VAR}!"), "v: x!");
        std::env::remove_var("QMS_TEST_VAR");
        assert_eq!(expand_env("v: ${QMS_TEST_MISSING}"), "v: ");
        assert_eq!(expand_env("v: ${unterminated"), "v: ${unterminated");
    }
}
