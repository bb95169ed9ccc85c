//! Process-local replicated node map and the anti-entropy primitives.
//!
//! All operations serialize on one mutex and hold it only for the
//! duration of the call, never across network I/O. Ordering between
//! replicas uses `last_update_ts` alone; generation numbers are carried
//! through for restart detection but do not participate in ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::clock::TimeSource;
use crate::types::{
    NodeId, NodeInfo, NodeInfoMap, NodeMetaInfo, NodeStatus, NodeValue, StoreKey, StoreMap,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {id} not found")]
    UnknownNode { id: NodeId },
}

struct StoreInner {
    self_id: NodeId,
    gossip_version: String,
    gen_number: u64,
    node_map: NodeInfoMap,
}

pub struct NodeStore {
    inner: Mutex<StoreInner>,
    time: Arc<dyn TimeSource>,
}

impl NodeStore {
    /// Create the store with the self entry installed. `initial_status`
    /// is the embedder's choice for the local node at boot, typically
    /// `NotInQuorum` until the state machine proves otherwise.
    pub fn new(
        self_id: NodeId,
        gossip_version: impl Into<String>,
        gen_number: u64,
        initial_status: NodeStatus,
        cluster_domain: impl Into<String>,
        quorum_member: bool,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let now = time.now();
        let mut self_info = NodeInfo::new(self_id.clone(), gen_number, now, initial_status);
        self_info.cluster_domain = cluster_domain.into();
        self_info.quorum_member = quorum_member;

        let mut node_map = NodeInfoMap::new();
        node_map.insert(self_id.clone(), self_info);

        Self {
            inner: Mutex::new(StoreInner {
                self_id,
                gossip_version: gossip_version.into(),
                gen_number,
                node_map,
            }),
            time,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("node store lock poisoned")
    }

    pub fn self_id(&self) -> NodeId {
        self.lock().self_id.clone()
    }

    pub fn gossip_version(&self) -> String {
        self.lock().gossip_version.clone()
    }

    pub fn gen_number(&self) -> u64 {
        self.lock().gen_number
    }

    /// Set one key in the local node's payload and advance its version.
    pub fn update_self(&self, key: StoreKey, value: serde_json::Value) {
        let now = self.time.now();
        let mut inner = self.lock();
        let self_id = inner.self_id.clone();
        let info = inner
            .node_map
            .get_mut(&self_id)
            .expect("self entry always present");
        info.value.insert(key, value);
        info.last_update_ts = now;
    }

    pub fn update_self_status(&self, status: NodeStatus) {
        let now = self.time.now();
        let mut inner = self.lock();
        let self_id = inner.self_id.clone();
        let info = inner
            .node_map
            .get_mut(&self_id)
            .expect("self entry always present");
        info.status = status;
        info.last_update_ts = now;
    }

    pub fn get_self_status(&self) -> NodeStatus {
        let inner = self.lock();
        inner
            .node_map
            .get(&inner.self_id)
            .expect("self entry always present")
            .status
    }

    /// Advance only the local entry's version. Used by the
    /// self-correction pass so a quiet node keeps winning merges for
    /// its own record.
    pub fn restamp_self(&self) {
        let now = self.time.now();
        let mut inner = self.lock();
        let self_id = inner.self_id.clone();
        let info = inner
            .node_map
            .get_mut(&self_id)
            .expect("self entry always present");
        info.last_update_ts = now;
    }

    pub fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> Result<(), StoreError> {
        let now = self.time.now();
        let mut inner = self.lock();
        let info = inner
            .node_map
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownNode { id: id.clone() })?;
        info.status = status;
        info.last_update_ts = now;
        Ok(())
    }

    /// Update failure-domain and quorum membership for a known node.
    /// Self-writes advance the version; remote entries are patched in
    /// place and converge through gossip from their owner.
    pub fn update_node_membership(
        &self,
        id: &NodeId,
        cluster_domain: &str,
        quorum_member: bool,
    ) -> Result<(), StoreError> {
        let now = self.time.now();
        let mut inner = self.lock();
        let is_self = *id == inner.self_id;
        let info = inner
            .node_map
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownNode { id: id.clone() })?;
        info.cluster_domain = cluster_domain.to_string();
        info.quorum_member = quorum_member;
        if is_self {
            info.last_update_ts = now;
        }
        Ok(())
    }

    /// Insert a NeverGossiped placeholder for a peer learned from
    /// topology, if absent.
    pub fn new_node(&self, id: NodeId, cluster_domain: &str, quorum_member: bool) {
        let now = self.time.now();
        let mut inner = self.lock();
        if inner.node_map.contains_key(&id) {
            return;
        }
        let mut info = NodeInfo::new(id.clone(), 0, now, NodeStatus::NeverGossiped);
        info.cluster_domain = cluster_domain.to_string();
        info.quorum_member = quorum_member;
        inner.node_map.insert(id, info);
    }

    /// Drop a node on explicit membership removal. Removing self or an
    /// unknown id is a no-op.
    pub fn remove_node(&self, id: &NodeId) {
        let mut inner = self.lock();
        if *id == inner.self_id {
            return;
        }
        inner.node_map.remove(id);
    }

    /// Per-node view of one key, filtered to valid entries. Nodes with
    /// an empty payload are reported with no value so consumers can see
    /// they are alive but silent on this key.
    pub fn get_store_key_value(&self, key: &StoreKey) -> BTreeMap<NodeId, NodeValue> {
        let inner = self.lock();
        let mut out = BTreeMap::new();
        for (id, info) in &inner.node_map {
            if !info.status.is_valid() {
                continue;
            }
            let value = info.value.get(key);
            if value.is_none() && !info.value.is_empty() {
                continue;
            }
            out.insert(
                id.clone(),
                NodeValue {
                    id: info.id.clone(),
                    gen_number: info.gen_number,
                    last_update_ts: info.last_update_ts,
                    status: info.status,
                    value: value.cloned(),
                },
            );
        }
        out
    }

    pub fn get_store_keys(&self) -> Vec<StoreKey> {
        let inner = self.lock();
        let mut keys = BTreeSet::new();
        for info in inner.node_map.values() {
            if !info.status.is_valid() {
                continue;
            }
            for key in info.value.keys() {
                keys.insert(key.clone());
            }
        }
        keys.into_iter().collect()
    }

    /// Per-node metadata advertisement for the anti-entropy exchange.
    /// Placeholder entries carry no replicated data and are withheld so
    /// a peer never pulls them over a real record.
    pub fn meta_info(&self) -> Vec<NodeMetaInfo> {
        let inner = self.lock();
        inner
            .node_map
            .values()
            .filter(|info| info.status.is_valid())
            .map(|info| NodeMetaInfo {
                id: info.id.clone(),
                last_update_ts: info.last_update_ts,
                gen_number: info.gen_number,
                gossip_version: inner.gossip_version.clone(),
            })
            .collect()
    }

    /// Classify every id mentioned on either side by who holds the
    /// newer copy: `peer_newer` are ids the remote side wins,
    /// `self_newer` are ids we win. Missing or invalid local entries
    /// concede to the peer; equal timestamps go to neither list.
    pub fn diff(&self, remote_meta: &[NodeMetaInfo]) -> (Vec<NodeId>, Vec<NodeId>) {
        let inner = self.lock();
        let mut peer_newer = Vec::new();
        let mut self_newer = Vec::new();

        let mut remote_ids = BTreeSet::new();
        for meta in remote_meta {
            remote_ids.insert(meta.id.clone());
            match inner.node_map.get(&meta.id) {
                None => peer_newer.push(meta.id.clone()),
                Some(local) if !local.status.is_valid() => peer_newer.push(meta.id.clone()),
                Some(local) => {
                    if meta.last_update_ts > local.last_update_ts {
                        peer_newer.push(meta.id.clone());
                    } else if meta.last_update_ts < local.last_update_ts {
                        self_newer.push(meta.id.clone());
                    }
                }
            }
        }

        for (id, info) in &inner.node_map {
            if info.status.is_valid() && !remote_ids.contains(id) {
                self_newer.push(id.clone());
            }
        }

        (peer_newer, self_newer)
    }

    /// Copies of the requested records. Unknown ids and placeholder
    /// entries are omitted.
    pub fn subset(&self, ids: &[NodeId]) -> NodeInfoMap {
        let inner = self.lock();
        let mut out = NodeInfoMap::new();
        for id in ids {
            if let Some(info) = inner.node_map.get(id) {
                if info.status.is_valid() {
                    out.insert(id.clone(), info.clone());
                }
            }
        }
        out
    }

    /// Apply a delta from a peer. A record wins when the local copy is
    /// missing, a placeholder, or strictly older. The locally derived
    /// status always survives; the self entry is never touched.
    pub fn merge(&self, delta: NodeInfoMap) {
        let mut inner = self.lock();
        let self_id = inner.self_id.clone();
        for (id, mut incoming) in delta {
            if id == self_id {
                continue;
            }
            let keep_status = match inner.node_map.get(&id) {
                None => Some(NodeStatus::NeverGossiped),
                Some(local)
                    if !local.status.is_valid()
                        || local.last_update_ts < incoming.last_update_ts =>
                {
                    Some(local.status)
                }
                Some(_) => None,
            };
            if let Some(status) = keep_status {
                incoming.status = status;
                inner.node_map.insert(id, incoming);
            }
        }
    }

    pub fn get_local_state(&self) -> NodeInfoMap {
        self.lock().node_map.clone()
    }

    pub fn get_local_node_info(&self, id: &NodeId) -> Result<NodeInfo, StoreError> {
        self.lock()
            .node_map
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownNode { id: id.clone() })
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lock().node_map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().node_map.is_empty()
    }
}

/// Payload map helper for tests and embedders.
pub fn store_map(entries: &[(&str, serde_json::Value)]) -> StoreMap {
    entries
        .iter()
        .map(|(key, value)| (StoreKey::from(*key), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use serde_json::json;
    use time::macros::datetime;

    fn test_store(id: &str) -> (NodeStore, Arc<ManualTime>) {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let store = NodeStore::new(
            NodeId::from(id),
            "v1",
            1,
            NodeStatus::Up,
            "",
            true,
            clock.clone(),
        );
        (store, clock)
    }

    fn peer_info(id: &str, ts: time::OffsetDateTime, status: NodeStatus) -> NodeInfo {
        NodeInfo::new(NodeId::from(id), 1, ts, status)
    }

    #[test]
    fn update_self_advances_version() {
        let (store, clock) = test_store("n0");
        let before = store.get_local_node_info(&NodeId::from("n0")).unwrap();

        clock.advance(time::Duration::seconds(1));
        store.update_self(StoreKey::from("disk"), json!("ok"));

        let after = store.get_local_node_info(&NodeId::from("n0")).unwrap();
        assert!(after.last_update_ts > before.last_update_ts);
        assert_eq!(after.value.get(&StoreKey::from("disk")), Some(&json!("ok")));
    }

    #[test]
    fn update_self_leaves_other_nodes_alone() {
        let (store, clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);
        let before = store.get_local_node_info(&NodeId::from("n1")).unwrap();

        clock.advance(time::Duration::seconds(1));
        store.update_self(StoreKey::from("disk"), json!("ok"));

        let after = store.get_local_node_info(&NodeId::from("n1")).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn unknown_node_status_update_errors() {
        let (store, _clock) = test_store("n0");
        let err = store
            .update_node_status(&NodeId::from("ghost"), NodeStatus::Down)
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownNode { .. }));
    }

    #[test]
    fn diff_classifies_by_timestamp() {
        let (store, clock) = test_store("n0");
        let t0 = clock.now();

        // Known peer, local copy older than the advertised one.
        store.new_node(NodeId::from("n1"), "", true);
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();
        let local_n1 = store.get_local_node_info(&NodeId::from("n1")).unwrap();

        let remote = vec![
            NodeMetaInfo {
                id: NodeId::from("n1"),
                last_update_ts: local_n1.last_update_ts + time::Duration::seconds(5),
                gen_number: 1,
                gossip_version: "v1".to_string(),
            },
            // Unknown to us entirely.
            NodeMetaInfo {
                id: NodeId::from("n2"),
                last_update_ts: t0,
                gen_number: 1,
                gossip_version: "v1".to_string(),
            },
            // Our self entry is newer than their stale copy.
            NodeMetaInfo {
                id: NodeId::from("n0"),
                last_update_ts: t0 - time::Duration::seconds(60),
                gen_number: 1,
                gossip_version: "v1".to_string(),
            },
        ];

        let (peer_newer, self_newer) = store.diff(&remote);
        assert_eq!(peer_newer, vec![NodeId::from("n1"), NodeId::from("n2")]);
        assert_eq!(self_newer, vec![NodeId::from("n0")]);
    }

    #[test]
    fn diff_ties_go_to_neither_side() {
        let (store, _clock) = test_store("n0");
        let local = store.get_local_node_info(&NodeId::from("n0")).unwrap();

        let remote = vec![NodeMetaInfo {
            id: NodeId::from("n0"),
            last_update_ts: local.last_update_ts,
            gen_number: 1,
            gossip_version: "v1".to_string(),
        }];

        let (peer_newer, self_newer) = store.diff(&remote);
        assert!(peer_newer.is_empty());
        assert!(self_newer.is_empty());
    }

    #[test]
    fn diff_concedes_placeholder_entries() {
        let (store, clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);

        // Advertised copy is older than our placeholder's creation time,
        // but a placeholder always loses.
        let remote = vec![NodeMetaInfo {
            id: NodeId::from("n1"),
            last_update_ts: clock.now() - time::Duration::minutes(10),
            gen_number: 1,
            gossip_version: "v1".to_string(),
        }];

        let (peer_newer, self_newer) = store.diff(&remote);
        assert_eq!(peer_newer, vec![NodeId::from("n1")]);
        assert!(self_newer.is_empty());
    }

    #[test]
    fn subset_skips_unknown_and_placeholder_ids() {
        let (store, _clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);

        let subset = store.subset(&[
            NodeId::from("n0"),
            NodeId::from("n1"),
            NodeId::from("ghost"),
        ]);
        assert_eq!(subset.len(), 1);
        assert!(subset.contains_key(&NodeId::from("n0")));
    }

    #[test]
    fn merge_takes_newer_and_preserves_local_status() {
        let (store, clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::SuspectDown)
            .unwrap();

        clock.advance(time::Duration::seconds(10));
        let mut incoming = peer_info("n1", clock.now(), NodeStatus::Up);
        incoming.value.insert(StoreKey::from("disk"), json!("full"));

        store.merge(NodeInfoMap::from([(NodeId::from("n1"), incoming.clone())]));

        let merged = store.get_local_node_info(&NodeId::from("n1")).unwrap();
        assert_eq!(merged.last_update_ts, incoming.last_update_ts);
        assert_eq!(merged.value, incoming.value);
        // Remote said Up; our local suspicion stands.
        assert_eq!(merged.status, NodeStatus::SuspectDown);
    }

    #[test]
    fn merge_ignores_older_copies() {
        let (store, clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();
        let local = store.get_local_node_info(&NodeId::from("n1")).unwrap();

        let stale = peer_info(
            "n1",
            clock.now() - time::Duration::minutes(5),
            NodeStatus::Up,
        );
        store.merge(NodeInfoMap::from([(NodeId::from("n1"), stale)]));

        assert_eq!(
            store.get_local_node_info(&NodeId::from("n1")).unwrap(),
            local
        );
    }

    #[test]
    fn merge_never_overwrites_self() {
        let (store, clock) = test_store("n0");
        let local = store.get_local_node_info(&NodeId::from("n0")).unwrap();

        let mut forged = peer_info("n0", clock.now() + time::Duration::hours(1), NodeStatus::Down);
        forged.value.insert(StoreKey::from("disk"), json!("lies"));
        store.merge(NodeInfoMap::from([(NodeId::from("n0"), forged)]));

        assert_eq!(
            store.get_local_node_info(&NodeId::from("n0")).unwrap(),
            local
        );
    }

    #[test]
    fn merge_of_unknown_node_starts_as_never_gossiped() {
        let (store, clock) = test_store("n0");
        let incoming = peer_info("n9", clock.now(), NodeStatus::Up);
        store.merge(NodeInfoMap::from([(NodeId::from("n9"), incoming)]));

        let merged = store.get_local_node_info(&NodeId::from("n9")).unwrap();
        assert_eq!(merged.status, NodeStatus::NeverGossiped);
    }

    #[test]
    fn merge_updates_timestamp_to_max_of_both() {
        let (store, clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();

        clock.advance(time::Duration::seconds(3));
        let newer_ts = clock.now();
        store.merge(NodeInfoMap::from([(
            NodeId::from("n1"),
            peer_info("n1", newer_ts, NodeStatus::Up),
        )]));

        let merged = store.get_local_node_info(&NodeId::from("n1")).unwrap();
        assert_eq!(merged.last_update_ts, newer_ts);
    }

    #[test]
    fn key_value_reads_filter_placeholders() {
        let (store, clock) = test_store("n0");
        store.update_self(StoreKey::from("disk"), json!("ok"));
        store.new_node(NodeId::from("n1"), "", true);
        store.new_node(NodeId::from("n2"), "", true);

        // n1 gossiped and carries the key; n2 never gossiped.
        clock.advance(time::Duration::seconds(1));
        let mut n1 = peer_info("n1", clock.now(), NodeStatus::Up);
        n1.value.insert(StoreKey::from("disk"), json!("low"));
        store.merge(NodeInfoMap::from([(NodeId::from("n1"), n1)]));
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();

        let view = store.get_store_key_value(&StoreKey::from("disk"));
        assert_eq!(view.len(), 2);
        assert_eq!(view[&NodeId::from("n0")].value, Some(json!("ok")));
        assert_eq!(view[&NodeId::from("n1")].value, Some(json!("low")));
        assert!(!view.contains_key(&NodeId::from("n2")));
    }

    #[test]
    fn nodes_with_empty_payload_appear_valueless() {
        let (store, _clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);
        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();
        store.update_self(StoreKey::from("disk"), json!("ok"));

        let view = store.get_store_key_value(&StoreKey::from("disk"));
        assert_eq!(view[&NodeId::from("n1")].value, None);
    }

    #[test]
    fn store_keys_span_valid_nodes() {
        let (store, clock) = test_store("n0");
        store.update_self(StoreKey::from("disk"), json!("ok"));

        store.new_node(NodeId::from("n1"), "", true);
        let mut n1 = peer_info("n1", clock.now() + time::Duration::seconds(1), NodeStatus::Up);
        n1.value.insert(StoreKey::from("cpu"), json!(0.3));
        store.merge(NodeInfoMap::from([(NodeId::from("n1"), n1)]));

        // Placeholder: its (empty) payload is invisible either way.
        assert_eq!(
            store.get_store_keys(),
            vec![StoreKey::from("disk")],
            "never-gossiped payloads stay hidden"
        );

        store
            .update_node_status(&NodeId::from("n1"), NodeStatus::Up)
            .unwrap();
        assert_eq!(
            store.get_store_keys(),
            vec![StoreKey::from("cpu"), StoreKey::from("disk")]
        );
    }

    #[test]
    fn meta_info_withholds_placeholders() {
        let (store, _clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);

        let meta = store.meta_info();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].id, NodeId::from("n0"));
        assert_eq!(meta[0].gossip_version, "v1");
    }

    #[test]
    fn remove_node_is_idempotent_and_protects_self() {
        let (store, _clock) = test_store("n0");
        store.new_node(NodeId::from("n1"), "", true);

        store.remove_node(&NodeId::from("n1"));
        store.remove_node(&NodeId::from("n1"));
        store.remove_node(&NodeId::from("n0"));

        assert!(store.contains(&NodeId::from("n0")));
        assert!(!store.contains(&NodeId::from("n1")));
    }
}
