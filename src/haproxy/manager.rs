//! Config reload pipeline.
//!
//! # Responsibilities
//! - Render a full HAProxy configuration from the backend set and the
//!   trusted/untrusted bind addresses
//! - Validate the candidate config before it can touch the live one
//! - Activate it atomically and signal the HAProxy process
//!
//! # Design Decisions
//! - Write → check → rename → reload; a config that fails the check never
//!   replaces the active file
//! - A mutex serializes reloads: at most one runs at a time, and a queued
//!   caller renders from its own, newer backend set once it gets the lock
//! - The reload command is exec'd directly (whitespace-split argv, no
//!   shell)

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::schema::HaproxyConfig;
use crate::core::backend::BackendSet;
use crate::core::Reloader;
use crate::haproxy::BACKEND_SECTION;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {cmd}: {source}")]
    Exec {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config check failed ({status}): {stderr}")]
    CheckFailed { status: ExitStatus, stderr: String },

    #[error("failed to activate config: {source}")]
    Activate {
        #[source]
        source: std::io::Error,
    },

    #[error("reload command exited with {status}")]
    ReloadFailed { status: ExitStatus },

    #[error("reload command is empty")]
    EmptyCommand,
}

/// Serialized owner of the on-disk HAProxy configuration.
pub struct LbManager {
    cfg: HaproxyConfig,
    // Guards the whole write/check/rename/signal sequence.
    lock: Mutex<()>,
}

impl LbManager {
    pub fn new(cfg: HaproxyConfig) -> Self {
        Self {
            cfg,
            lock: Mutex::new(()),
        }
    }

    async fn run_reload_cmd(&self) -> Result<(), ReloadError> {
        let mut argv = self.cfg.reload_cmd.split_whitespace();
        let Some(prog) = argv.next() else {
            return Err(ReloadError::EmptyCommand);
        };

        let status = Command::new(prog)
            .args(argv)
            .status()
            .await
            .map_err(|source| ReloadError::Exec {
                cmd: self.cfg.reload_cmd.clone(),
                source,
            })?;
        if !status.success() {
            return Err(ReloadError::ReloadFailed { status });
        }
        Ok(())
    }

    /// Validate a candidate config file with `haproxy -c -f`.
    pub async fn check_config(&self, path: &Path) -> Result<(), ReloadError> {
        let output = Command::new(&self.cfg.exec)
            .arg("-c")
            .arg("-f")
            .arg(path)
            .output()
            .await
            .map_err(|source| ReloadError::Exec {
                cmd: self.cfg.exec.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ReloadError::CheckFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl Reloader for LbManager {
    type Error = ReloadError;

    async fn reload(
        &self,
        trusted_ip: &str,
        untrusted_ips: &[String],
        servers: &BackendSet,
    ) -> Result<(), ReloadError> {
        // Everything below runs under the lock, so dueling reloads cannot
        // interleave writes and the later caller's (newer) set wins.
        let _guard = self.lock.lock().await;

        let rendered = render_config(&self.cfg, trusted_ip, untrusted_ips, servers);
        let tmp = self.cfg.config_path.with_extension("cfg.tmp");

        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|source| ReloadError::Write {
                path: tmp.clone(),
                source,
            })?;

        self.check_config(&tmp).await?;

        tokio::fs::rename(&tmp, &self.cfg.config_path)
            .await
            .map_err(|source| ReloadError::Activate { source })?;

        tracing::debug!(
            config = %self.cfg.config_path.display(),
            backends = servers.len(),
            "config activated, signalling haproxy"
        );
        self.run_reload_cmd().await
    }
}

fn bind_addr(ip: &str, port: u16) -> String {
    // IPv6 literals need brackets in bind lines.
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

fn server_addr(address: &str, default_port: u16) -> String {
    // A registration may carry its own port; bare v4 hosts get the default.
    // A bare IPv6 host cannot be told apart from host:port, so v6 backends
    // register with an explicit port.
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{default_port}")
    }
}

/// Render the full configuration text. Pure; exposed for tests.
pub fn render_config(
    cfg: &HaproxyConfig,
    trusted_ip: &str,
    untrusted_ips: &[String],
    servers: &BackendSet,
) -> String {
    let mut out = String::new();

    out.push_str("global\n");
    out.push_str("        log 127.0.0.1 len 4096 local0\n");
    out.push_str("        user nobody\n");
    out.push_str("        group nobody\n");
    out.push_str("        daemon\n");
    out.push_str("        maxconn 65536\n");
    out.push_str(&format!(
        "        stats socket {} mode 0600 level admin\n\n",
        cfg.socket_path.display()
    ));

    out.push_str("defaults\n");
    out.push_str("        log     global\n");
    out.push_str("        mode    http\n");
    out.push_str("        option  httplog\n");
    out.push_str("        retries 3\n");
    out.push_str("        timeout connect 2000\n");
    out.push_str("        timeout client  120000\n");
    out.push_str("        timeout server  120000\n\n");

    out.push_str(&format!("backend {BACKEND_SECTION}\n"));
    out.push_str("        option httpchk GET /ping\n");
    for (name, backend) in servers.iter() {
        if !backend.enabled {
            continue;
        }
        out.push_str(&format!(
            "        server {} {} check inter 30s slowstart 10s\n",
            name,
            server_addr(&backend.address, cfg.backend_port)
        ));
    }
    out.push('\n');

    out.push_str("frontend www\n");
    for ip in untrusted_ips {
        out.push_str(&format!("        bind {}\n", bind_addr(ip, 80)));
    }
    out.push_str(&format!("        bind {}\n", bind_addr(trusted_ip, 80)));
    out.push_str(&format!("        default_backend {BACKEND_SECTION}\n\n"));

    out.push_str("listen stats\n");
    out.push_str(&format!("        bind {}\n", bind_addr(trusted_ip, 8686)));
    out.push_str("        mode http\n");
    out.push_str("        stats enable\n");
    out.push_str("        stats uri /\n");

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> HaproxyConfig {
        HaproxyConfig {
            exec: "/bin/true".into(),
            config_path: "/tmp/haproxy.cfg".into(),
            socket_path: "/tmp/haproxy.sock".into(),
            backend_port: 80,
            reload_cmd: "/bin/true".into(),
        }
    }

    fn set(entries: &[(&str, &str, bool)]) -> BackendSet {
        let mut servers = BackendSet::new();
        for (name, address, enabled) in entries {
            servers.insert(*name, *address, *enabled);
        }
        servers
    }

    #[test]
    fn test_render_includes_only_enabled_servers() {
        let servers = set(&[("a.example.com", "10.0.0.1", true), ("b.example.com", "10.0.0.2", false)]);
        let rendered = render_config(&test_cfg(), "127.0.0.1", &[], &servers);

        assert!(rendered.contains("server a.example.com 10.0.0.1:80 check"));
        assert!(!rendered.contains("b.example.com"));
    }

    #[test]
    fn test_render_respects_explicit_port() {
        let servers = set(&[("a.example.com", "10.0.0.1:8081", true)]);
        let rendered = render_config(&test_cfg(), "127.0.0.1", &[], &servers);

        assert!(rendered.contains("server a.example.com 10.0.0.1:8081 check"));
    }

    #[test]
    fn test_render_binds_untrusted_and_trusted() {
        let servers = set(&[("a.example.com", "10.0.0.1", true)]);
        let untrusted = vec!["192.0.2.10".to_string(), "2001:db8::1".to_string()];
        let rendered = render_config(&test_cfg(), "10.77.77.7", &untrusted, &servers);

        assert!(rendered.contains("bind 192.0.2.10:80"));
        assert!(rendered.contains("bind [2001:db8::1]:80"));
        assert!(rendered.contains("bind 10.77.77.7:80"));
        assert!(rendered.contains("bind 10.77.77.7:8686"));
    }

    #[test]
    fn test_render_declares_stats_socket() {
        let rendered = render_config(&test_cfg(), "127.0.0.1", &[], &BackendSet::new());
        assert!(rendered.contains("stats socket /tmp/haproxy.sock mode 0600 level admin"));
    }
}
