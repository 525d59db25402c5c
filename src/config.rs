//! Service-wide tunables.
//!
//! Mirrors the teacher crate's `config::limits::Limits`: every field has a
//! `serde(default = ...)` so a partial (or absent) config file still yields
//! sane values, and `Config::default()` is the single source of truth for
//! those values rather than scattered process-wide globals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Interval between keepalive `ping` broadcasts to every open socket.
    #[serde(default = "defaults::ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How long a session may sit with no open channels before its
    /// transport is closed with reason `"timeout"`.
    #[serde(default = "defaults::agent_idle_timeout_secs")]
    pub agent_idle_timeout_secs: u64,
    /// Test-only override for the remote-shell port; `None` uses the
    /// standard port for the transport implementation.
    #[serde(default)]
    pub ssh_port_override: Option<u16>,
    /// Path to the session helper binary invoked on the remote host.
    #[serde(default = "defaults::session_helper_path")]
    pub session_helper_path: PathBuf,
    /// Path to the agent binary invoked on the remote host.
    #[serde(default = "defaults::agent_path")]
    pub agent_path: PathBuf,
    /// Path to the known-hosts file consulted by the remote-shell
    /// transport.
    #[serde(default = "defaults::known_hosts_path")]
    pub known_hosts_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_interval_secs: defaults::ping_interval_secs(),
            agent_idle_timeout_secs: defaults::agent_idle_timeout_secs(),
            ssh_port_override: None,
            session_helper_path: defaults::session_helper_path(),
            agent_path: defaults::agent_path(),
            known_hosts_path: defaults::known_hosts_path(),
        }
    }
}

impl Config {
    /// Build a config from environment variable overrides, falling back to
    /// the documented defaults. Grounded on the teacher's pattern of
    /// resolving a `ServerConfig` once at startup and then treating it as
    /// immutable for the service's lifetime.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("AGENTMUX_PING_INTERVAL_SECS") {
            if let Ok(v) = v.parse() {
                config.ping_interval_secs = v;
            }
        }
        if let Ok(v) = std::env::var("AGENTMUX_AGENT_TIMEOUT_SECS") {
            if let Ok(v) = v.parse() {
                config.agent_idle_timeout_secs = v;
            }
        }
        if let Ok(v) = std::env::var("AGENTMUX_SSH_PORT_OVERRIDE") {
            config.ssh_port_override = v.parse().ok();
        }
        config
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_interval_secs)
    }

    pub fn agent_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.agent_idle_timeout_secs)
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn ping_interval_secs() -> u64 {
        5
    }

    pub fn agent_idle_timeout_secs() -> u64 {
        30
    }

    pub fn session_helper_path() -> PathBuf {
        PathBuf::from("/usr/libexec/agentmux-ssh-helper")
    }

    pub fn agent_path() -> PathBuf {
        PathBuf::from("agentmux-bridge")
    }

    pub fn known_hosts_path() -> PathBuf {
        PathBuf::from("/var/lib/agentmux/known_hosts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.ping_interval_secs, 5);
        assert_eq!(config.agent_idle_timeout_secs, 30);
        assert!(config.ssh_port_override.is_none());
    }

    #[test]
    fn deserializes_partial_toml() {
        let config: Config = serde_json::from_str(r#"{"ping_interval_secs": 10}"#).unwrap();
        assert_eq!(config.ping_interval_secs, 10);
        assert_eq!(config.agent_idle_timeout_secs, 30);
    }
}
