use tracing::{info, warn};

use crate::{
    config::{Config, NodeRole},
    discovery::discover_peers_or_empty,
};

/// Who this node is, who leads, and where accepted writes are pushed.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub self_addr: String,
    pub leader_addr: String,
    pub peers: Vec<String>,
}

impl NodeConfig {
    pub fn new(self_addr: impl Into<String>, leader_addr: impl Into<String>) -> Self {
        Self {
            self_addr: self_addr.into(),
            leader_addr: leader_addr.into(),
            peers: Vec::new(),
        }
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = String>) -> Self {
        for peer in peers {
            push_unique(&mut self.peers, peer);
        }
        self
    }

    pub fn is_leader(&self) -> bool {
        self.self_addr == self.leader_addr
    }

    /// Static `--peers` first, then (followers only) whatever discovery returns.
    pub async fn resolve(config: &Config) -> Self {
        let mut node = Self::new(config.self_addr.clone(), config.leader_addr.clone())
            .with_peers(config.peers.iter().cloned());

        if config.role == NodeRole::Follower
            && let Some(service) = config.discovery_service.as_deref()
        {
            let discovered = discover_peers_or_empty(service, config.peer_port).await;
            node = node.with_peers(discovered);
        }

        if node.is_leader() != (config.role == NodeRole::Leader) {
            warn!(
                role = config.role.as_str(),
                self_addr = %node.self_addr,
                leader_addr = %node.leader_addr,
                "configured role disagrees with leader address; leader address wins"
            );
        }

        info!(
            self_addr = %node.self_addr,
            leader_addr = %node.leader_addr,
            is_leader = node.is_leader(),
            peers = ?node.peers,
            "node configuration resolved"
        );
        node
    }
}

fn push_unique(peers: &mut Vec<String>, peer: String) {
    let peer = peer.trim().to_string();
    if !peer.is_empty() && !peers.contains(&peer) {
        peers.push(peer);
    }
}

/// `host:port` becomes `http://host:port`; explicit schemes are kept.
pub fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

pub fn node_url(addr: &str, path_and_query: &str) -> String {
    format!(
        "{}/{}",
        base_url(addr),
        path_and_query.trim_start_matches('/')
    )
}
