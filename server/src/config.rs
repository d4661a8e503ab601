//! Server configuration.
//!
//! All sections deserialize from TOML (or any serde source) and every
//! field has a default, so `Config::default()` is a working local
//! server.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// A config listening on an ephemeral local port.
    pub fn local() -> Self {
        Self {
            listener: vec![ListenerConfig {
                address: Some("127.0.0.1:0".parse().unwrap()),
                path: None,
            }],
            ..Self::default()
        }
    }
}

/// One accept socket: a TCP address or a Unix socket path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default)]
    pub address: Option<SocketAddr>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Handler threads.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Bounded depth of the pending-transaction queue. Overflow is
    /// answered with 429 on the dispatching thread.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_threads() -> usize {
    4
}

fn default_queue_depth() -> usize {
    256
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingConfig {
    /// Submission queue entries for the main ring.
    #[serde(default = "default_entries")]
    pub entries: u32,
    /// Entries for each stream's write sub-ring.
    #[serde(default = "default_sub_entries")]
    pub sub_entries: u32,
    #[serde(default)]
    pub backend: io_ring::Backend,
}

fn default_entries() -> u32 {
    256
}

fn default_sub_entries() -> u32 {
    16
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            entries: default_entries(),
            sub_entries: default_sub_entries(),
            backend: io_ring::Backend::Auto,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepAliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Advisory timeout advertised in the Keep-Alive header.
    #[serde(default = "default_keep_alive_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_timeout() -> u64 {
    5
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_keep_alive_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default = "default_true")]
    pub target: bool,
    #[serde(default)]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.workers.threads, 4);
        assert_eq!(config.ring.entries, 256);
        assert!(config.keep_alive.enabled);
    }

    #[test]
    fn parses_toml() {
        let config: Config = toml::from_str(
            r#"
            [[listener]]
            address = "127.0.0.1:8080"

            [workers]
            threads = 2
            queue_depth = 64

            [ring]
            entries = 128
            backend = "poll"

            [keep_alive]
            enabled = true
            timeout_secs = 10

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.len(), 1);
        assert_eq!(config.workers.threads, 2);
        assert_eq!(config.ring.backend, io_ring::Backend::Poll);
        assert_eq!(config.keep_alive.timeout_secs, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [workers]
            threads = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.workers.threads, 1);
        assert_eq!(config.workers.queue_depth, 256);
        assert_eq!(config.ring.backend, io_ring::Backend::Auto);
    }
}
