//! Peer list builder
//!
//! Resolves every ranked container host to an address and writes the
//! hostfile workers read at startup. One line per peer:
//!
//! ```text
//! <rank> <ip> <port>
//! ```
//!
//! Ranks are contiguous from 0 and the port is the job-wide listen port.

use super::MasterContext;
use crate::cohort::record::RankedHost;
use crate::error::MasterError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the peer list, in shared storage and in each workspace
pub const HOSTFILE_NAME: &str = "hostfile";

pub struct PeerListBuilder {
    ctx: Arc<MasterContext>,
}

impl PeerListBuilder {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        Self { ctx }
    }

    /// Storage-relative location of the hostfile
    pub fn hostfile_path(&self) -> PathBuf {
        PathBuf::from(&self.ctx.config.storage.path_prefix).join(HOSTFILE_NAME)
    }

    /// Resolve every ranked peer and persist the hostfile.
    ///
    /// Returns the storage-relative path once the file is durably written.
    pub async fn build(&self) -> Result<PathBuf, MasterError> {
        let peers = self.ctx.containers.ranked_hosts();
        let mut resolved = Vec::with_capacity(peers.len());
        for RankedHost { rank, host } in peers {
            let ip = resolve(&host).await?;
            debug!(rank, host = %host, ip = %ip, "Resolved peer");
            resolved.push((rank, ip));
        }

        let contents = render(&resolved, self.ctx.config.job.listen_port);
        let path = self.hostfile_path();
        self.ctx
            .storage
            .write_durable(&path, &contents)
            .map_err(|e| MasterError::PeerList(format!("{:#}", e)))?;

        info!(peers = resolved.len(), path = %path.display(), "Peer list written");
        Ok(path)
    }
}

/// Render the hostfile body
pub fn render(peers: &[(usize, IpAddr)], port: u16) -> String {
    let lines: Vec<String> = peers
        .iter()
        .map(|(rank, ip)| format!("{} {} {}", rank, ip, port))
        .collect();
    lines.join("\n").trim().to_string()
}

/// Resolve a host name to an address, preferring IPv4
pub async fn resolve(host: &str) -> Result<IpAddr, MasterError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| MasterError::PeerList(format!("cannot resolve {}: {}", host, e)))?
        .map(|addr| addr.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| MasterError::PeerList(format!("no address for {}", host)))
}
