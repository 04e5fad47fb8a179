//! Address classification.
//!
//! # Responsibilities
//! - Partition local NIC addresses into trusted (admin/internal) and
//!   untrusted (public-facing) sets at startup
//! - Produce the untrusted list the rendered config binds its frontends on
//!
//! # Design Decisions
//! - The NIC inventory comes from an external command emitting JSON, so
//!   the mechanism is swappable per platform without touching this code
//! - No safe default exists if enumeration fails or times out: the error
//!   is fatal for this setup attempt and the supervisor retries from the
//!   top

use std::collections::HashSet;
use std::net::IpAddr;
use std::process::ExitStatus;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time;

use crate::config::schema::Config;

/// Bound on the NIC enumeration exec.
pub const NIC_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_NIC_CMD: &[&str] = &["/usr/sbin/mdata-get", "sdc:nics"];

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("failed to run {cmd}: {source}")]
    Exec {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} exited with {status}: {stderr}")]
    Failed {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("timed out waiting for NIC enumeration")]
    Timeout,

    #[error("could not parse NIC information: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One NIC as reported by the enumeration command. Either a single `ip`
/// or a list of CIDR-suffixed `ips`.
#[derive(Debug, Deserialize)]
pub struct Nic {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ips: Option<Vec<String>>,
}

/// Determine the addresses to bind public frontends on.
///
/// A hardcoded list in the configuration wins outright; otherwise the NIC
/// inventory is fetched and classified.
pub async fn untrusted_addrs(config: &Config) -> Result<Vec<String>, AddrError> {
    if !config.untrusted_ips.is_empty() {
        return Ok(config.untrusted_ips.clone());
    }

    let argv: Vec<String> = if config.nic_cmd.is_empty() {
        DEFAULT_NIC_CMD.iter().map(|s| s.to_string()).collect()
    } else {
        config.nic_cmd.clone()
    };
    let cmd = argv.join(" ");
    tracing::info!(%cmd, "loading NIC information");

    let output = time::timeout(
        NIC_TIMEOUT,
        Command::new(&argv[0]).args(&argv[1..]).output(),
    )
    .await
    .map_err(|_| AddrError::Timeout)?
    .map_err(|source| AddrError::Exec {
        cmd: cmd.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(AddrError::Failed {
            cmd,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let nics: Vec<Nic> = serde_json::from_slice(&output.stdout)?;
    let trusted: HashSet<&str> = config
        .trusted_ips
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(config.trusted_ip.as_str()))
        .collect();

    let untrusted = classify(&nics, &trusted);
    tracing::info!(ips = ?untrusted, "selected addresses for untrusted networks");
    Ok(untrusted)
}

/// Keep every NIC address that is neither trusted nor malformed.
pub fn classify(nics: &[Nic], trusted: &HashSet<&str>) -> Vec<String> {
    let mut out = Vec::new();

    let mut push = |raw: &str, out: &mut Vec<String>| {
        // CIDR suffixes come along for the ride on some platforms.
        let ip = raw.split('/').next().unwrap_or(raw);
        if trusted.contains(ip) {
            return;
        }
        if ip.parse::<IpAddr>().is_err() {
            tracing::warn!(ip, "invalid address in NIC information");
            return;
        }
        out.push(ip.to_string());
    };

    for nic in nics {
        if let Some(ips) = &nic.ips {
            for addr in ips {
                push(addr, &mut out);
            }
        } else if let Some(ip) = &nic.ip {
            push(ip, &mut out);
        } else {
            tracing::warn!("NIC has no addresses");
        }
    }
    out
}
