//! Deployment server hostname validation.

use hal_core::{Error, Result};
use std::net::Ipv4Addr;
use tracing::debug;

async fn resolves(host: &str) -> bool {
    match tokio::net::lookup_host((host, 22)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(_) => false,
    }
}

/// Find the name under which `host` resolves.
///
/// IPv4 literals are returned unchanged. Otherwise the bare name is tried
/// first, then the name with each configured suffix appended.
pub async fn validate_hostname(host: &str, suffixes: &[String]) -> Result<String> {
    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(host.to_string());
    }
    if host.is_empty() {
        return Err(Error::InvalidInput("hostname is empty".to_string()));
    }

    if resolves(host).await {
        return Ok(host.to_string());
    }
    for suffix in suffixes {
        let candidate = format!("{host}{suffix}");
        if resolves(&candidate).await {
            debug!(host, %candidate, "Resolved hostname with suffix");
            return Ok(candidate);
        }
    }

    Err(Error::InvalidInput(format!(
        "Could not resolve hostname \"{host}\""
    )))
}
