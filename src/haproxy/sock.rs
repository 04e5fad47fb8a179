//! Runtime control socket client.
//!
//! # Responsibilities
//! - Read live per-backend status with `show stat`
//! - Flip individual servers in and out of maintenance without a reload
//!
//! # Design Decisions
//! - One connection per command; HAProxy closes the stats socket after
//!   each request
//! - Column positions are taken from the CSV header rather than
//!   hardcoded, since they shift between HAProxy versions
//! - `enable`/`disable server` never creates or removes a routing slot;
//!   that is the reload pipeline's job

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::core::audit::ServerStat;
use crate::core::backend::BackendSet;
use crate::core::Patcher;
use crate::haproxy::BACKEND_SECTION;

#[derive(Debug, thiserror::Error)]
pub enum SockError {
    #[error("control socket {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed `show stat` output: {0}")]
    Parse(String),

    #[error("command {cmd:?} rejected: {reply}")]
    Rejected { cmd: String, reply: String },
}

/// Client for the admin-level stats socket declared in the rendered
/// config.
#[derive(Debug, Clone)]
pub struct HaproxySock {
    path: PathBuf,
}

impl HaproxySock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn command(&self, cmd: &str) -> Result<String, SockError> {
        let io_err = |source| SockError::Io {
            path: self.path.clone(),
            source,
        };

        let mut stream = UnixStream::connect(&self.path).await.map_err(io_err)?;
        stream
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(io_err)?;
        stream.shutdown().await.map_err(io_err)?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.map_err(io_err)?;
        Ok(reply)
    }
}

/// Parse `show stat` CSV into per-server rows, dropping the FRONTEND and
/// BACKEND aggregate rows.
pub fn parse_stats(raw: &str) -> Result<Vec<ServerStat>, SockError> {
    let mut lines = raw.lines();
    let header = lines
        .next()
        .and_then(|l| l.strip_prefix("# "))
        .ok_or_else(|| SockError::Parse("missing CSV header".into()))?;

    let columns: Vec<&str> = header.split(',').collect();
    let index = |name: &str| columns.iter().position(|c| *c == name);

    let pxname = index("pxname").ok_or_else(|| SockError::Parse("no pxname column".into()))?;
    let svname = index("svname").ok_or_else(|| SockError::Parse("no svname column".into()))?;
    let status = index("status").ok_or_else(|| SockError::Parse("no status column".into()))?;
    // Older versions do not report addresses; the audit copes.
    let addr = index("addr");

    let mut stats = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or_default();

        let name = field(svname);
        if name == "FRONTEND" || name == "BACKEND" {
            continue;
        }

        stats.push(ServerStat {
            pxname: field(pxname).to_string(),
            svname: name.to_string(),
            status: field(status).to_string(),
            addr: addr
                .map(field)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
        });
    }
    Ok(stats)
}

impl Patcher for HaproxySock {
    type Error = SockError;

    /// Bring each server's maintenance state in line with its `enabled`
    /// flag. Unknown servers surface as rejected commands, which the
    /// controller treats as a reason to reload.
    async fn sync_server_state(&self, servers: &BackendSet) -> Result<(), SockError> {
        for (name, backend) in servers.iter() {
            let verb = if backend.enabled { "enable" } else { "disable" };
            let cmd = format!("{verb} server {BACKEND_SECTION}/{name}");

            let reply = self.command(&cmd).await?;
            let reply = reply.trim();
            // HAProxy answers success with an empty line.
            if !reply.is_empty() {
                return Err(SockError::Rejected {
                    cmd,
                    reply: reply.to_string(),
                });
            }
            tracing::debug!(server = %name, verb, "server state patched");
        }
        Ok(())
    }

    async fn server_stats(&self) -> Result<Vec<ServerStat>, SockError> {
        let raw = self.command("show stat").await?;
        parse_stats(&raw)
    }
}
