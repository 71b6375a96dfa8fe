//! Leader-side fan-out of accepted writes.
//!
//! Peers are contacted one at a time in configured order. The first peer that does
//! not acknowledge ends the round: later peers are never contacted, and nothing is
//! rolled back on the leader or on the peers that already applied the operation.

use std::fmt;

use tracing::{debug, warn};

use crate::{
    cluster::node_url,
    protocol::{REPLICATE_PATH, ReplicationOp},
};

#[derive(Debug)]
pub enum ReplicationFailure {
    Unreachable(reqwest::Error),
    Rejected { status: u16 },
}

#[derive(Debug)]
pub struct ReplicationError {
    pub peer: String,
    /// Peers that acknowledged before the failure, in fan-out order.
    pub applied: Vec<String>,
    pub failure: ReplicationFailure,
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            ReplicationFailure::Unreachable(e) => {
                write!(f, "failed to replicate to {}: {e}", self.peer)
            }
            ReplicationFailure::Rejected { status } => {
                write!(
                    f,
                    "replication to {} failed with status: {status}",
                    self.peer
                )
            }
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.failure {
            ReplicationFailure::Unreachable(e) => Some(e),
            ReplicationFailure::Rejected { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct Replicator {
    client: reqwest::Client,
    peers: Vec<String>,
}

impl Replicator {
    pub fn new(client: reqwest::Client, peers: Vec<String>) -> Self {
        Self { client, peers }
    }

    /// Pushes `op` to every peer in order and returns once all of them acknowledged.
    pub async fn replicate(&self, op: &ReplicationOp) -> Result<(), ReplicationError> {
        let mut applied = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            if let Err(failure) = self.push(peer, op).await {
                warn!(
                    peer = %peer,
                    key = %op.key,
                    op = op.kind.as_str(),
                    acknowledged = applied.len(),
                    "replication stopped at unacknowledged peer"
                );
                return Err(ReplicationError {
                    peer: peer.clone(),
                    applied,
                    failure,
                });
            }
            debug!(peer = %peer, key = %op.key, op = op.kind.as_str(), "replicated");
            applied.push(peer.clone());
        }
        Ok(())
    }

    async fn push(&self, peer: &str, op: &ReplicationOp) -> Result<(), ReplicationFailure> {
        let resp = self
            .client
            .post(node_url(peer, REPLICATE_PATH))
            .json(op)
            .send()
            .await
            .map_err(ReplicationFailure::Unreachable)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ReplicationFailure::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
