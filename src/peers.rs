//! Known-peer directory: id -> address, failure domain, quorum flag.
//!
//! Mutated only by topology operations (`update_cluster`, the legacy
//! add/remove path), never by gossip data.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum PeerBookError {
    #[error("peer {addr} already present")]
    DuplicatePeer { addr: String },
    #[error("peer {addr} not found")]
    UnknownPeer { addr: String },
}

/// One row of the cluster topology as provided by the embedder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub cluster_domain: String,
    #[serde(default = "default_quorum_member")]
    pub quorum_member: bool,
}

fn default_quorum_member() -> bool {
    true
}

/// Topology change computed by [`PeerBook::update_cluster`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDelta {
    pub added: Vec<PeerEntry>,
    pub removed: Vec<NodeId>,
}

pub struct PeerBook {
    self_id: NodeId,
    peers: Mutex<BTreeMap<NodeId, PeerEntry>>,
}

impl PeerBook {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, PeerEntry>> {
        self.peers.lock().expect("peer book lock poisoned")
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Replace the topology with `desired`, reporting what changed.
    /// Entries for the local node are tracked too (they carry its
    /// domain and quorum flag) but are never handed to the sender loop.
    pub fn update_cluster(&self, desired: BTreeMap<NodeId, PeerEntry>) -> ClusterDelta {
        let mut peers = self.lock();
        let mut delta = ClusterDelta::default();

        let stale: Vec<NodeId> = peers
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            peers.remove(&id);
            delta.removed.push(id);
        }

        for (id, entry) in desired {
            let existing = peers.get(&id);
            if existing == Some(&entry) {
                continue;
            }
            if existing.is_none() {
                delta.added.push(entry.clone());
            }
            peers.insert(id, entry);
        }

        delta
    }

    /// Legacy path: register a peer by address alone. The id is derived
    /// from the address until topology supplies a real one.
    pub fn add_node(&self, addr: &str) -> Result<NodeId, PeerBookError> {
        let mut peers = self.lock();
        if peers.values().any(|entry| entry.address == addr) {
            return Err(PeerBookError::DuplicatePeer {
                addr: addr.to_string(),
            });
        }
        let id = NodeId::new(addr);
        peers.insert(
            id.clone(),
            PeerEntry {
                id: id.clone(),
                address: addr.to_string(),
                cluster_domain: String::new(),
                quorum_member: true,
            },
        );
        Ok(id)
    }

    pub fn remove_node(&self, addr: &str) -> Result<NodeId, PeerBookError> {
        let mut peers = self.lock();
        let id = peers
            .values()
            .find(|entry| entry.address == addr)
            .map(|entry| entry.id.clone())
            .ok_or_else(|| PeerBookError::UnknownPeer {
                addr: addr.to_string(),
            })?;
        peers.remove(&id);
        Ok(id)
    }

    /// Uniformly random peer other than self, if any.
    pub fn random_peer(&self) -> Option<PeerEntry> {
        let peers = self.lock();
        let candidates: Vec<&PeerEntry> = peers
            .values()
            .filter(|entry| entry.id != self.self_id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    pub fn get(&self, id: &NodeId) -> Option<PeerEntry> {
        self.lock().get(id).cloned()
    }

    pub fn find_by_id(&self, id: &NodeId) -> Option<PeerEntry> {
        self.get(id)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|entry| entry.id != self.self_id)
            .map(|entry| entry.address.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<PeerEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
