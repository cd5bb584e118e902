//! Bind address selection for local forwards that name a host instead of an IP literal.

use std::net::IpAddr;

use tokio::net::lookup_host;

use crate::error::BindError;

/// Picks the address a local forward should bind for a host name.
///
/// Scans `candidates` in order and takes the first loopback address. Failing that, the first
/// candidate this machine actually owns (`local`). Anything else would bind an interface no
/// caller could reach, so `None` is returned instead.
pub fn select_bind_address(candidates: &[IpAddr], local: &[IpAddr]) -> Option<IpAddr> {
    candidates.iter().find(|ip| ip.is_loopback()).or_else(|| candidates.iter().find(|ip| local.contains(ip))).copied()
}

/// Addresses assigned to this host's interfaces.
pub fn local_addresses() -> Vec<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => ifas.into_iter().map(|(_name, ip)| ip).collect(),
        Err(e) => {
            log::warn!("[Resolver] list local interfaces error {e}");
            Vec::new()
        }
    }
}

/// Resolves `host` and selects a bindable address from it, see [`select_bind_address`].
pub async fn resolve_bind_address(host: &str, local: &[IpAddr]) -> Result<IpAddr, BindError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let candidates: Vec<IpAddr> = lookup_host((host, 0))
        .await
        .map_err(|source| BindError::Resolve {
            host: host.to_string(),
            source,
        })?
        .map(|addr| addr.ip())
        .collect();
    log::debug!("[Resolver] {host} resolved to {candidates:?}");

    select_bind_address(&candidates, local).ok_or_else(|| BindError::NoBindableAddress(host.to_string()))
}
