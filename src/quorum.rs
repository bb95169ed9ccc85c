//! Pluggable quorum policies.
//!
//! Both variants are pure over their inputs: they read a snapshot of
//! the node map and their own configuration, perform no I/O, and hold
//! no lock beyond the configuration mutex.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::{DomainActiveMap, DomainMemberCounts, NodeId, NodeInfoMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumPolicyKind {
    Flat,
    FailureDomains,
}

pub trait QuorumPolicy: Send + Sync {
    /// Does the local node currently belong to a majority?
    fn is_node_in_quorum(&self, node_map: &NodeInfoMap) -> bool;

    /// Externally provided sizing, per domain. The flat policy reads
    /// the summed total.
    fn update_member_counts(&self, counts: DomainMemberCounts);

    /// Returns whether any domain changed activation state.
    fn update_active_domains(&self, active: &DomainActiveMap) -> bool;

    fn kind(&self) -> QuorumPolicyKind;
}

/// Majority over a flat, externally sized member count.
pub struct FlatQuorum {
    num_members: Mutex<usize>,
}

impl FlatQuorum {
    pub fn new(num_members: usize) -> Self {
        Self {
            num_members: Mutex::new(num_members),
        }
    }
}

impl QuorumPolicy for FlatQuorum {
    fn is_node_in_quorum(&self, node_map: &NodeInfoMap) -> bool {
        let num_members = *self.num_members.lock().expect("quorum lock poisoned");
        let up = node_map
            .values()
            .filter(|info| info.quorum_member && info.status.counts_for_quorum())
            .count();
        up >= num_members / 2 + 1
    }

    fn update_member_counts(&self, counts: DomainMemberCounts) {
        let total: usize = counts.values().sum();
        *self.num_members.lock().expect("quorum lock poisoned") = total;
    }

    fn update_active_domains(&self, _active: &DomainActiveMap) -> bool {
        false
    }

    fn kind(&self) -> QuorumPolicyKind {
        QuorumPolicyKind::Flat
    }
}

struct DomainConfig {
    active: DomainActiveMap,
    counts: DomainMemberCounts,
}

/// Majority over the active failure domains only. A node whose own
/// domain is deactivated is out of quorum no matter the counts.
pub struct FailureDomainQuorum {
    self_id: NodeId,
    config: Mutex<DomainConfig>,
}

impl FailureDomainQuorum {
    pub fn new(self_id: NodeId, active: DomainActiveMap) -> Self {
        Self {
            self_id,
            config: Mutex::new(DomainConfig {
                active,
                counts: DomainMemberCounts::new(),
            }),
        }
    }
}

impl QuorumPolicy for FailureDomainQuorum {
    fn is_node_in_quorum(&self, node_map: &NodeInfoMap) -> bool {
        let config = self.config.lock().expect("quorum lock poisoned");

        let Some(self_info) = node_map.get(&self.self_id) else {
            return false;
        };
        if !domain_is_active(&config.active, &self_info.cluster_domain) {
            return false;
        }

        let mut visible: BTreeMap<&str, usize> = BTreeMap::new();
        let mut up_active = 0usize;
        for info in node_map.values() {
            if !info.quorum_member {
                continue;
            }
            if !domain_is_active(&config.active, &info.cluster_domain) {
                continue;
            }
            *visible.entry(info.cluster_domain.as_str()).or_default() += 1;
            if info.status.counts_for_quorum() {
                up_active += 1;
            }
        }

        // External sizing wins when it knows about more members than we
        // have heard from.
        let mut total_active = 0usize;
        for (domain, state) in &config.active {
            if !state.is_active() {
                continue;
            }
            let local = visible.get(domain.as_str()).copied().unwrap_or(0);
            let external = config.counts.get(domain).copied().unwrap_or(0);
            total_active += local.max(external);
        }
        // Domains we see members in but which were never configured.
        for (domain, local) in &visible {
            if !config.active.contains_key(*domain) {
                total_active += local;
            }
        }

        up_active >= total_active / 2 + 1
    }

    fn update_member_counts(&self, counts: DomainMemberCounts) {
        self.config.lock().expect("quorum lock poisoned").counts = counts;
    }

    fn update_active_domains(&self, active: &DomainActiveMap) -> bool {
        let mut config = self.config.lock().expect("quorum lock poisoned");
        let mut changed = false;
        for (domain, state) in active {
            if config.active.get(domain) != Some(state) {
                changed = true;
                if state.is_active() {
                    tracing::info!(domain = %domain, "marking domain active");
                } else {
                    tracing::info!(domain = %domain, "marking domain inactive");
                }
            }
        }
        for domain in config.active.keys() {
            if !active.contains_key(domain) {
                changed = true;
            }
        }
        config.active = active.clone();
        changed
    }

    fn kind(&self) -> QuorumPolicyKind {
        QuorumPolicyKind::FailureDomains
    }
}

fn domain_is_active(active: &DomainActiveMap, domain: &str) -> bool {
    // A domain nobody configured is treated as active: domain-unaware
    // clusters leave every tag empty.
    if active.is_empty() {
        return true;
    }
    match active.get(domain) {
        Some(state) => state.is_active(),
        None => false,
    }
}
