//! Shared fixtures: engines on loopback with shortened intervals.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use murmur::{
    Gossiper, GossiperOptions, GossipConfig, NodeId, NodeStatus, PeerEntry, QuorumPolicyChoice,
};

pub const CLUSTER_ID: &str = "itest";

/// Engine tuned for tests: fast ticks, short quorum and probation
/// windows, no death sweeper unless a test opts in.
pub fn fast_config() -> GossipConfig {
    let mut config = GossipConfig::default();
    config.gossip_interval = Duration::from_millis(100);
    config.quorum_timeout = Duration::from_millis(600);
    config.suspect_down_timeout = Duration::from_secs(3);
    config.io_deadline = Duration::from_secs(2);
    config.dial_deadline = Duration::from_millis(500);
    config
}

pub struct TestNode {
    pub id: NodeId,
    pub engine: Gossiper,
}

impl TestNode {
    /// Start an engine bound to an ephemeral loopback port.
    pub fn start(id: &str, config: GossipConfig) -> Self {
        Self::start_with(id, config, |_| {})
    }

    pub fn start_with(
        id: &str,
        config: GossipConfig,
        customize: impl FnOnce(&mut GossiperOptions),
    ) -> Self {
        let mut options = GossiperOptions::new(id, "127.0.0.1:0");
        options.cluster_id = CLUSTER_ID.to_string();
        options.quorum_policy = QuorumPolicyChoice::Flat;
        customize(&mut options);

        let engine = Gossiper::new(options, config).expect("engine construction failed");
        engine.start(&[]).expect("engine start failed");
        Self {
            id: NodeId::from(id),
            engine,
        }
    }

    pub fn addr(&self) -> String {
        self.engine
            .local_addr()
            .expect("engine not started")
            .to_string()
    }

    pub fn stop(&self) {
        let _ = self.engine.stop(Duration::from_secs(5));
    }
}

pub fn cluster_map(nodes: &[(&NodeId, &str)]) -> BTreeMap<NodeId, PeerEntry> {
    let with_domains: Vec<(&NodeId, &str, &str)> =
        nodes.iter().map(|(id, addr)| (*id, *addr, "")).collect();
    domain_cluster_map(&with_domains)
}

pub fn domain_cluster_map(nodes: &[(&NodeId, &str, &str)]) -> BTreeMap<NodeId, PeerEntry> {
    nodes
        .iter()
        .map(|(id, addr, zone)| {
            (
                (*id).clone(),
                PeerEntry {
                    id: (*id).clone(),
                    address: addr.to_string(),
                    cluster_domain: zone.to_string(),
                    quorum_member: true,
                },
            )
        })
        .collect()
}

pub fn wait_for(deadline: Duration, what: &str, predicate: impl Fn() -> bool) {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

pub fn wait_for_self_status(node: &TestNode, status: NodeStatus) {
    wait_for(
        Duration::from_secs(10),
        &format!("{} to reach {status}", node.id),
        || node.engine.get_self_status() == status,
    );
}

pub fn wait_for_peer_status(node: &TestNode, peer: &NodeId, status: NodeStatus) {
    wait_for(
        Duration::from_secs(10),
        &format!("{} to see {peer} as {status}", node.id),
        || {
            node.engine
                .get_local_node_info(peer)
                .map(|info| info.status == status)
                .unwrap_or(false)
        },
    );
}
