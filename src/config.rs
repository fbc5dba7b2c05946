use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub edns: EdnsConfig,
    #[serde(default)]
    pub bogus_nxdomain: BogusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址列表，UDP 与 TCP 各绑定一次 / every address gets one UDP and one TCP listener
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// 响应是否启用域名压缩 / name compression on replies
    #[serde(default = "default_true")]
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    Udp,
    Tcp,
    Dot,
    Doh,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_mode")]
    pub mode: UpstreamMode,
    /// 上游超时（秒） / per-attempt upstream timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_true")]
    pub skip_tls_verify: bool,
    /// DoT 的 SNI 域名，为空时取第一个上游地址 / SNI host, first address when empty
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub doh: DohConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohConfig {
    #[serde(default = "default_query_path")]
    pub query_path: String,
    #[serde(default)]
    pub idle: DohIdleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohIdleConfig {
    #[serde(default = "default_doh_max_conn")]
    pub max_conn: usize,
    #[serde(default = "default_doh_max_per_host")]
    pub max_per_host: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub use_hosts_file: bool,
    #[serde(default)]
    pub include_files: Vec<String>,
    #[serde(default)]
    pub static_records: Vec<StaticRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticRecord {
    pub domain: String,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub include_files: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ForwarderRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderRule {
    pub domain: String,
    pub upstreams: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// 0 即完全停用缓存 / 0 disables caching entirely
    #[serde(default = "default_cache_size")]
    pub size: usize,
    #[serde(default = "default_cache_shards")]
    pub shards: usize,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u64,
    #[serde(default = "default_neg_ttl")]
    pub neg_ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdnsConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_ipv4_mask")]
    pub ipv4_mask: u8,
    #[serde(default = "default_ipv6_mask")]
    pub ipv6_mask: u8,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BogusConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Include files carry the same section shapes as the main file.
#[derive(Debug, Clone, Deserialize, Default)]
struct IncludeFile {
    #[serde(default)]
    static_records: Vec<StaticRecord>,
    #[serde(default)]
    rules: Vec<ForwarderRule>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let mut cfg: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    cfg.upstream.addresses = cfg
        .upstream
        .addresses
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    for file in resolve_include_files(base_dir, &cfg.local.include_files) {
        match read_include(&file) {
            Ok(inc) => cfg.local.static_records.extend(inc.static_records),
            Err(err) => {
                warn!(target = "config", file = %file.display(), error = %err, "skipping local include")
            }
        }
    }

    for file in resolve_include_files(base_dir, &cfg.forwarder.include_files) {
        match read_include(&file) {
            Ok(inc) => cfg.forwarder.rules.extend(inc.rules),
            Err(err) => {
                warn!(target = "config", file = %file.display(), error = %err, "skipping forwarder include")
            }
        }
    }

    Ok(cfg)
}

fn read_include(path: &Path) -> Result<IncludeFile> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Expands include globs relative to the config directory, deduplicated
/// by absolute path. Bad patterns and unreadable matches are skipped.
fn resolve_include_files(base_dir: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    let mut files = Vec::new();

    for pattern in patterns {
        let full = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            base_dir.join(pattern).to_string_lossy().into_owned()
        };

        let matches = match glob::glob(&full) {
            Ok(m) => m,
            Err(_) => continue,
        };

        for entry in matches.flatten() {
            let canonical = entry.canonicalize().unwrap_or(entry);
            if seen.insert(canonical.clone()) {
                files.push(canonical);
            }
        }
    }

    files
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:5353".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_mode() -> UpstreamMode {
    UpstreamMode::Udp
}

fn default_timeout() -> u64 {
    5
}

fn default_keep_alive() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    4096
}

fn default_pool_size() -> usize {
    100
}

fn default_max_attempts() -> usize {
    3
}

fn default_query_path() -> String {
    "/dns-query".to_string()
}

fn default_doh_max_conn() -> usize {
    100
}

fn default_doh_max_per_host() -> usize {
    20
}

fn default_cache_size() -> usize {
    10_000
}

fn default_cache_shards() -> usize {
    256
}

fn default_min_ttl() -> u64 {
    60
}

fn default_neg_ttl() -> u64 {
    1
}

fn default_ipv4_mask() -> u8 {
    24
}

fn default_ipv6_mask() -> u8 {
    56
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            compress: true,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            timeout: default_timeout(),
            keep_alive: default_keep_alive(),
            buffer_size: default_buffer_size(),
            pool_size: default_pool_size(),
            max_attempts: default_max_attempts(),
            skip_tls_verify: true,
            domain: String::new(),
            addresses: Vec::new(),
            doh: DohConfig::default(),
        }
    }
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            query_path: default_query_path(),
            idle: DohIdleConfig::default(),
        }
    }
}

impl Default for DohIdleConfig {
    fn default() -> Self {
        Self {
            max_conn: default_doh_max_conn(),
            max_per_host: default_doh_max_per_host(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            shards: default_cache_shards(),
            min_ttl: default_min_ttl(),
            neg_ttl: default_neg_ttl(),
        }
    }
}

impl Default for EdnsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            ipv4_mask: default_ipv4_mask(),
            ipv6_mask: default_ipv6_mask(),
        }
    }
}
