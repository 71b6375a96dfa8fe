use anyhow::Context as _;
use tracing::{info, warn};

/// Resolves `service_name` and pairs every returned address with `port`.
///
/// Addresses keep the resolver's order; duplicates are dropped.
pub async fn discover_peers(service_name: &str, port: u16) -> anyhow::Result<Vec<String>> {
    let addrs = tokio::net::lookup_host((service_name, port))
        .await
        .with_context(|| format!("resolve discovery service {service_name}"))?;

    let mut peers: Vec<String> = Vec::new();
    for addr in addrs {
        let peer = addr.to_string();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }
    Ok(peers)
}

/// Startup wrapper: a failed lookup is logged and yields no peers.
pub async fn discover_peers_or_empty(service_name: &str, port: u16) -> Vec<String> {
    match discover_peers(service_name, port).await {
        Ok(peers) => {
            info!(service = service_name, count = peers.len(), "discovered peers");
            peers
        }
        Err(err) => {
            warn!(
                service = service_name,
                error = %format!("{err:#}"),
                "peer discovery failed; starting without discovered peers"
            );
            Vec::new()
        }
    }
}
