//! One anti-entropy session: the four-step push/pull exchange.
//!
//! ```text
//! initiator                         responder
//!   | -- advertisement ----------------> |   (1)
//!   | <-------------------- id list --- |   (2) ids the responder wants
//!   | -- delta for those ids ---------> |   (3) responder merges
//!   | <----- delta the responder wins - |   (4) initiator merges
//! ```
//!
//! Any channel or protocol error aborts the session; both sides count
//! only a full four-step exchange as successful contact.

use thiserror::Error;

use crate::channel::proto::{Advertisement, Delta, IdList};
use crate::channel::{ChannelError, MessageChannel};
use crate::store::NodeStore;
use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("gossip version mismatch: ours {ours} theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("cluster id mismatch: ours {ours} theirs {theirs}")]
    ClusterMismatch { ours: String, theirs: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A failed responder session, with the peer attribution when the
/// advertisement got far enough to identify it.
#[derive(Debug, Error)]
#[error("session with {peer:?} failed: {source}")]
pub struct RespondFailure {
    pub peer: Option<NodeId>,
    #[source]
    pub source: SessionError,
}

fn advertisement(store: &NodeStore, cluster_id: &str) -> Advertisement {
    Advertisement {
        version: store.gossip_version(),
        cluster_id: cluster_id.to_string(),
        sender_id: store.self_id(),
        meta_infos: store.meta_info(),
    }
}

/// Drive a session as the initiator. The store lock is taken per
/// primitive, never across the wire waits.
pub fn initiate(
    store: &NodeStore,
    cluster_id: &str,
    channel: &mut MessageChannel,
) -> Result<(), SessionError> {
    channel.send(&advertisement(store, cluster_id))?;

    let wanted: IdList = channel.receive()?;
    channel.send(&Delta(store.subset(&wanted.0)))?;

    let delta: Delta = channel.receive()?;
    store.merge(delta.0);
    Ok(())
}

/// Service a session as the responder. Returns the initiator's id.
pub fn respond(
    store: &NodeStore,
    cluster_id: &str,
    channel: &mut MessageChannel,
) -> Result<NodeId, RespondFailure> {
    let ad: Advertisement = channel.receive().map_err(|err| RespondFailure {
        peer: None,
        source: err.into(),
    })?;
    let peer = ad.sender_id.clone();

    let fail = |source: SessionError| RespondFailure {
        peer: Some(peer.clone()),
        source,
    };

    let ours = store.gossip_version();
    if ad.version != ours {
        return Err(fail(
            ProtocolError::VersionMismatch {
                ours,
                theirs: ad.version,
            }
            .into(),
        ));
    }
    if ad.cluster_id != cluster_id {
        return Err(fail(
            ProtocolError::ClusterMismatch {
                ours: cluster_id.to_string(),
                theirs: ad.cluster_id,
            }
            .into(),
        ));
    }

    let (peer_newer, self_newer) = store.diff(&ad.meta_infos);

    channel
        .send(&IdList(peer_newer))
        .map_err(|err| fail(err.into()))?;

    let delta: Delta = channel.receive().map_err(|err| fail(err.into()))?;
    store.merge(delta.0);

    channel
        .send(&Delta(store.subset(&self_newer)))
        .map_err(|err| fail(err.into()))?;

    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::clock::ManualTime;
    use crate::store::NodeStore;
    use crate::types::{NodeStatus, StoreKey};
    use time::macros::datetime;

    const CLUSTER: &str = "test-cluster";

    fn store_at(id: &str, clock: &Arc<ManualTime>) -> Arc<NodeStore> {
        Arc::new(NodeStore::new(
            NodeId::from(id),
            "v1",
            1,
            NodeStatus::Up,
            "",
            true,
            clock.clone(),
        ))
    }

    fn channel_pair() -> (MessageChannel, MessageChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || listener.accept().unwrap().0);
        let deadline = Duration::from_secs(2);
        let dialed =
            MessageChannel::dial(&addr.to_string(), deadline, deadline, 1 << 20).unwrap();
        let accepted =
            MessageChannel::from_stream(join.join().unwrap(), deadline, 1 << 20).unwrap();
        (dialed, accepted)
    }

    fn run_session(
        a: &Arc<NodeStore>,
        b: &Arc<NodeStore>,
    ) -> (Result<(), SessionError>, Result<NodeId, RespondFailure>) {
        let (mut dialed, mut accepted) = channel_pair();
        let responder_store = Arc::clone(b);
        let responder =
            std::thread::spawn(move || respond(&responder_store, CLUSTER, &mut accepted));
        let initiated = initiate(a, CLUSTER, &mut dialed);
        dialed.close();
        (initiated, responder.join().unwrap())
    }

    #[test]
    fn two_stores_converge_in_one_session() {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let a = store_at("n0", &clock);
        let b = store_at("n1", &clock);
        clock.advance(time::Duration::seconds(1));
        a.update_self(StoreKey::from("k"), json!("x"));
        clock.advance(time::Duration::seconds(1));
        b.update_self(StoreKey::from("k"), json!("y"));

        let (initiated, responded) = run_session(&a, &b);
        initiated.unwrap();
        assert_eq!(responded.unwrap(), NodeId::from("n0"));

        let a_view_of_b = a.get_local_node_info(&NodeId::from("n1")).unwrap();
        let b_view_of_a = b.get_local_node_info(&NodeId::from("n0")).unwrap();
        assert_eq!(a_view_of_b.value.get(&StoreKey::from("k")), Some(&json!("y")));
        assert_eq!(b_view_of_a.value.get(&StoreKey::from("k")), Some(&json!("x")));

        // Timestamps match the owner's copy on both sides.
        assert_eq!(
            a_view_of_b.last_update_ts,
            b.get_local_node_info(&NodeId::from("n1"))
                .unwrap()
                .last_update_ts
        );
    }

    #[test]
    fn session_between_equal_stores_changes_nothing() {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let a = store_at("n0", &clock);
        let b = store_at("n1", &clock);
        clock.advance(time::Duration::seconds(1));
        a.update_self(StoreKey::from("k"), json!("x"));

        let (initiated, responded) = run_session(&a, &b);
        initiated.unwrap();
        responded.unwrap();

        let a_state = a.get_local_state();
        let b_state = b.get_local_state();

        let (initiated, responded) = run_session(&a, &b);
        initiated.unwrap();
        responded.unwrap();

        assert_eq!(a.get_local_state(), a_state);
        assert_eq!(b.get_local_state(), b_state);
    }

    #[test]
    fn restart_with_higher_generation_replaces_the_old_record() {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let a = store_at("n0", &clock);
        let b = store_at("n1", &clock);
        clock.advance(time::Duration::seconds(1));
        a.update_self(StoreKey::from("k"), json!("before-restart"));

        let (initiated, responded) = run_session(&a, &b);
        initiated.unwrap();
        responded.unwrap();
        b.update_node_status(&NodeId::from("n0"), NodeStatus::Up)
            .unwrap();

        // n0 restarts: new generation, fresh timestamp.
        clock.advance(time::Duration::seconds(5));
        let a2 = Arc::new(NodeStore::new(
            NodeId::from("n0"),
            "v1",
            2,
            NodeStatus::Up,
            "",
            true,
            clock.clone(),
        ));
        clock.advance(time::Duration::seconds(1));
        a2.update_self(StoreKey::from("k"), json!("after-restart"));

        let (initiated, responded) = run_session(&a2, &b);
        initiated.unwrap();
        responded.unwrap();

        let b_view = b.get_local_node_info(&NodeId::from("n0")).unwrap();
        assert_eq!(b_view.gen_number, 2);
        assert_eq!(
            b_view.value.get(&StoreKey::from("k")),
            Some(&json!("after-restart"))
        );
        // B's locally derived status survives the replacement.
        assert_eq!(b_view.status, NodeStatus::Up);
    }

    #[test]
    fn version_mismatch_aborts_before_any_merge() {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let a = store_at("n0", &clock);
        let b = Arc::new(NodeStore::new(
            NodeId::from("n1"),
            "v2",
            1,
            NodeStatus::Up,
            "",
            true,
            clock.clone(),
        ));
        clock.advance(time::Duration::seconds(1));
        a.update_self(StoreKey::from("k"), json!("x"));

        let (initiated, responded) = run_session(&a, &b);
        let failure = responded.unwrap_err();
        assert_eq!(failure.peer, Some(NodeId::from("n0")));
        assert!(matches!(
            failure.source,
            SessionError::Protocol(ProtocolError::VersionMismatch { .. })
        ));
        assert!(initiated.is_err());
        assert!(!b.contains(&NodeId::from("n0")));
    }

    #[test]
    fn cluster_mismatch_aborts() {
        let clock = Arc::new(ManualTime::new(datetime!(2024-01-01 00:00:00 UTC)));
        let a = store_at("n0", &clock);
        let b = store_at("n1", &clock);

        let (mut dialed, mut accepted) = channel_pair();
        let responder_store = Arc::clone(&b);
        let responder =
            std::thread::spawn(move || respond(&responder_store, "other-cluster", &mut accepted));
        let _ = initiate(&a, CLUSTER, &mut dialed);
        dialed.close();

        let failure = responder.join().unwrap().unwrap_err();
        assert!(matches!(
            failure.source,
            SessionError::Protocol(ProtocolError::ClusterMismatch { .. })
        ));
    }
}
