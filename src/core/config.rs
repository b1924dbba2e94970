//! Configuration parsing and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LISTEN_DEFAULT: &str = "0.0.0.0:6060";

fn default_listen() -> String {
    LISTEN_DEFAULT.to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_size() -> u64 {
    8 << 20
}

fn default_gc_period_secs() -> u64 {
    60
}

fn default_gc_block_size() -> usize {
    100
}

fn default_idle_proxy_topic_timeout_secs() -> u64 {
    5
}

/// Top-level configuration for the server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on, or `unix:/path` for a Unix socket.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Accepted API keys. Empty accepts any non-empty key.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// `Cache-Control` max-age in seconds; zero disables the header.
    #[serde(default)]
    pub cache_max_age: u32,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_keys: Vec::new(),
            cache_max_age: 0,
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Plaintext address to answer with 307 redirects to the TLS port.
    #[serde(default)]
    pub redirect_http: Option<String>,
    /// `Strict-Transport-Security` max-age value; absent disables HSTS.
    #[serde(default)]
    pub strict_max_age: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory for the filesystem blob backend.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Maximum accepted upload size in bytes; zero disables the cap.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Orphan GC cadence in seconds; zero disables the collector.
    #[serde(default = "default_gc_period_secs")]
    pub gc_period_secs: u64,
    /// Maximum files deleted per GC pass.
    #[serde(default = "default_gc_block_size")]
    pub gc_block_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_upload_size: default_max_upload_size(),
            gc_period_secs: default_gc_period_secs(),
            gc_block_size: default_gc_block_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Seconds a proxy topic may sit with no attached sessions before it
    /// asks the hub to remove it.
    #[serde(default = "default_idle_proxy_topic_timeout_secs")]
    pub idle_proxy_topic_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            idle_proxy_topic_timeout_secs: default_idle_proxy_topic_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `herald=debug`.
    #[serde(default)]
    pub level: Option<String>,
    /// Emit one JSON object per line instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

/// True if the address names a Unix socket rather than a TCP endpoint.
pub fn is_unix_addr(addr: &str) -> bool {
    addr.starts_with("unix:")
}

impl Config {
    /// Load configuration from the path named by `HERALD_CONFIG`, falling
    /// back to `config/herald.toml`. Env overrides are applied after
    /// parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file, TOML or JSON by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path.display()))
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path.display()))
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("HERALD_LISTEN") {
            self.http.listen = listen;
        }
        if let Ok(level) = std::env::var("HERALD_LOG") {
            self.log.level = Some(level);
        }
    }

    /// Schema-level invariants checked before startup.
    pub fn validate(&self) -> Result<()> {
        if self.http.listen.is_empty() && self.http.tls.is_none() {
            bail!("http.listen must be set");
        }
        if let Some(tls) = &self.http.tls {
            if !tls.cert_file.exists() {
                bail!("tls cert_file {} missing", tls.cert_file.display());
            }
            if !tls.key_file.exists() {
                bail!("tls key_file {} missing", tls.key_file.display());
            }
            if let Some(redirect) = &tls.redirect_http {
                if is_unix_addr(redirect) || is_unix_addr(&self.http.listen) {
                    bail!("HTTP to HTTPS redirect: unix sockets not supported");
                }
            }
        }
        if self.cluster.idle_proxy_topic_timeout_secs == 0 {
            bail!("cluster.idle_proxy_topic_timeout_secs must be > 0");
        }
        if self.media.gc_period_secs > 0 && self.media.gc_block_size == 0 {
            bail!("media.gc_block_size must be > 0 when GC is enabled");
        }
        Ok(())
    }

    pub fn idle_proxy_topic_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.idle_proxy_topic_timeout_secs)
    }

    /// GC cadence, when the collector is enabled at all.
    pub fn media_gc_period(&self) -> Option<Duration> {
        (self.media.gc_period_secs > 0).then(|| Duration::from_secs(self.media.gc_period_secs))
    }
}

fn env_config_path() -> PathBuf {
    std::env::var("HERALD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/herald.toml"))
}
