//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! daemon. All types derive Serde traits for deserialization from the
//! JSON config file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Service domain whose registrations are watched
    /// (e.g. "webapi.us-east.example.com").
    pub name: String,

    /// Admin-side address; stats and internal frontends bind here.
    pub trusted_ip: String,

    /// Additional addresses on trusted networks, excluded from the
    /// untrusted bind list.
    #[serde(default)]
    pub trusted_ips: Vec<String>,

    /// Hardcoded untrusted (public) addresses. Non-empty skips NIC
    /// enumeration entirely.
    #[serde(default)]
    pub untrusted_ips: Vec<String>,

    /// Command that prints the NIC inventory as JSON. Platform default
    /// used when empty.
    #[serde(default)]
    pub nic_cmd: Vec<String>,

    /// Coordination-service settings.
    pub coordination: CoordinationConfig,

    /// Local HAProxy settings.
    pub haproxy: HaproxyConfig,
}

/// Where membership is published and how the session behaves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinationConfig {
    /// Coordination-service servers, for remote registry clients.
    #[serde(default)]
    pub servers: Vec<CoordinationServer>,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Local registration tree; selects the directory-backed registry.
    #[serde(default)]
    pub registrar_dir: Option<PathBuf>,

    /// Poll cadence for registries without native change notification.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinationServer {
    pub address: String,
    pub port: u16,
}

/// Paths and commands for driving the local HAProxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HaproxyConfig {
    /// HAProxy executable, used for config checks.
    pub exec: PathBuf,

    /// Active configuration file this daemon owns.
    pub config_path: PathBuf,

    /// Admin stats socket declared in the rendered config.
    pub socket_path: PathBuf,

    /// Port appended to backend addresses registered without one.
    pub backend_port: u16,

    /// Command line that signals HAProxy to adopt the new config.
    pub reload_cmd: String,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            exec: "/usr/sbin/haproxy".into(),
            config_path: "/etc/haproxy/haproxy.cfg".into(),
            socket_path: "/var/run/haproxy.sock".into(),
            backend_port: 80,
            reload_cmd: String::new(),
        }
    }
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
