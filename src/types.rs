//! Core identifiers and replicated node state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Opaque node identifier, unique within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque key in a node's replicated key/value payload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(pub String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Liveness / quorum disposition of a node as seen by the local engine.
///
/// For the local node the value is authoritative; for remote nodes it is
/// derived locally and never adopted from received gossip data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum NodeStatus {
    Invalid,
    NeverGossiped,
    Up,
    SuspectNotInQuorum,
    NotInQuorum,
    SuspectDown,
    Down,
}

impl NodeStatus {
    /// Whether this entry carries usable data. Invalid and NeverGossiped
    /// entries are placeholders and are skipped by read accessors.
    pub fn is_valid(self) -> bool {
        !matches!(self, NodeStatus::Invalid | NodeStatus::NeverGossiped)
    }

    /// Statuses that count toward quorum majorities.
    pub fn counts_for_quorum(self) -> bool {
        matches!(
            self,
            NodeStatus::Up | NodeStatus::NotInQuorum | NodeStatus::SuspectNotInQuorum
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Invalid => "invalid",
            NodeStatus::NeverGossiped => "never-gossiped",
            NodeStatus::Up => "up",
            NodeStatus::SuspectNotInQuorum => "suspect-not-in-quorum",
            NodeStatus::NotInQuorum => "not-in-quorum",
            NodeStatus::SuspectDown => "suspect-down",
            NodeStatus::Down => "down",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<NodeStatus> for u8 {
    fn from(status: NodeStatus) -> u8 {
        match status {
            NodeStatus::Invalid => 0,
            NodeStatus::NeverGossiped => 1,
            NodeStatus::Up => 2,
            NodeStatus::SuspectNotInQuorum => 3,
            NodeStatus::NotInQuorum => 4,
            NodeStatus::SuspectDown => 5,
            NodeStatus::Down => 6,
        }
    }
}

impl TryFrom<u8> for NodeStatus {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(NodeStatus::Invalid),
            1 => Ok(NodeStatus::NeverGossiped),
            2 => Ok(NodeStatus::Up),
            3 => Ok(NodeStatus::SuspectNotInQuorum),
            4 => Ok(NodeStatus::NotInQuorum),
            5 => Ok(NodeStatus::SuspectDown),
            6 => Ok(NodeStatus::Down),
            other => Err(format!("unknown node status {other}")),
        }
    }
}

/// Replicated key/value payload of one node.
pub type StoreMap = BTreeMap<StoreKey, serde_json::Value>;

/// Full replicated record for one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub gen_number: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_ts: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub wait_for_gen_update_ts: OffsetDateTime,
    pub status: NodeStatus,
    #[serde(default)]
    pub value: StoreMap,
    #[serde(default)]
    pub cluster_domain: String,
    #[serde(default)]
    pub quorum_member: bool,
}

impl NodeInfo {
    pub fn new(id: NodeId, gen_number: u64, now: OffsetDateTime, status: NodeStatus) -> Self {
        Self {
            id,
            gen_number,
            last_update_ts: now,
            wait_for_gen_update_ts: now,
            status,
            value: StoreMap::new(),
            cluster_domain: String::new(),
            quorum_member: true,
        }
    }
}

/// Local view of the whole cluster, keyed by node id.
pub type NodeInfoMap = BTreeMap<NodeId, NodeInfo>;

/// Lightweight per-node advertisement used to drive anti-entropy diffs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetaInfo {
    pub id: NodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_ts: OffsetDateTime,
    pub gen_number: u64,
    pub gossip_version: String,
}

/// Activation state of one failure domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Active,
    Inactive,
}

impl DomainState {
    pub fn is_active(self) -> bool {
        matches!(self, DomainState::Active)
    }
}

/// Domain tag -> activation state. Drives the failure-domain quorum policy.
pub type DomainActiveMap = BTreeMap<String, DomainState>;

/// Domain tag -> externally provided quorum-member count.
pub type DomainMemberCounts = BTreeMap<String, usize>;

/// Snapshot of one node's value for a single key, as returned by
/// key-oriented read accessors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeValue {
    pub id: NodeId,
    pub gen_number: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_ts: OffsetDateTime,
    pub status: NodeStatus,
    pub value: Option<serde_json::Value>,
}
