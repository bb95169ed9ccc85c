#![forbid(unsafe_code)]

//! Anti-entropy gossip engine for clusters of long-running nodes.
//!
//! Each participating process embeds a [`Gossiper`]: an eventually
//! consistent replica of every member's key/value state, per-peer
//! liveness derived from direct gossip contact, and the local node's
//! quorum disposition (Up, Suspect-Not-In-Quorum, Not-In-Quorum,
//! Down) under a pluggable quorum policy — flat majority or
//! failure-domain aware, so an operator can deactivate entire zones
//! and keep the survivors in quorum.

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod gossiper;
pub mod history;
pub mod peers;
pub mod probation;
pub mod quorum;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::clock::{ManualTime, SystemTime, TimeSource};
pub use crate::config::GossipConfig;
pub use crate::gossiper::{Gossiper, GossiperOptions, QuorumPolicyChoice};
pub use crate::history::{SessionDirection, SessionOutcome, SessionRecord};
pub use crate::peers::{ClusterDelta, PeerEntry};
pub use crate::quorum::{FailureDomainQuorum, FlatQuorum, QuorumPolicy, QuorumPolicyKind};
pub use crate::state::NodeState;
pub use crate::types::{
    DomainActiveMap, DomainMemberCounts, DomainState, NodeId, NodeInfo, NodeInfoMap, NodeMetaInfo,
    NodeStatus, NodeValue, StoreKey, StoreMap,
};
