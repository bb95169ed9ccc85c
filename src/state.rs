//! Local-node state machine.
//!
//! One worker owns the state and consumes every event, so transitions
//! never race. The SNIQ countdown is the worker's receive deadline:
//! armed when SNIQ is entered, cleared when it is left, and expiry
//! synthesizes a `Timeout` event. Only `SelfLeave` can reach `Down`.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::quorum::QuorumPolicy;
use crate::store::NodeStore;
use crate::types::{DomainActiveMap, DomainMemberCounts, NodeInfoMap, NodeStatus};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state machine worker failed to spawn: {0}")]
    Spawn(std::io::Error),
}

/// The four dispositions of the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Up,
    SuspectNotInQuorum,
    NotInQuorum,
    Down,
}

impl NodeState {
    pub fn as_status(self) -> NodeStatus {
        match self {
            NodeState::Up => NodeStatus::Up,
            NodeState::SuspectNotInQuorum => NodeStatus::SuspectNotInQuorum,
            NodeState::NotInQuorum => NodeStatus::NotInQuorum,
            NodeState::Down => NodeStatus::Down,
        }
    }

    pub fn from_status(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Up => NodeState::Up,
            NodeStatus::SuspectNotInQuorum => NodeState::SuspectNotInQuorum,
            NodeStatus::Down => NodeState::Down,
            _ => NodeState::NotInQuorum,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StateEventKind {
    /// The local node started or reconnected.
    SelfAlive,
    /// A remote peer was observed Up.
    NodeAlive,
    /// A remote peer was observed Down.
    NodeLeave,
    /// The local node is terminating.
    SelfLeave,
    /// Topology change; per-domain quorum member counts.
    UpdateClusterSize(DomainMemberCounts),
    /// Failure-domain activation change.
    UpdateActiveDomains(DomainActiveMap),
    /// The quorum-suspect countdown fired.
    Timeout,
}

#[derive(Clone, Debug)]
pub struct StateEvent {
    pub kind: StateEventKind,
    pub node_map: NodeInfoMap,
}

/// Pure transition: one row of the table per current state.
fn transition(current: NodeState, event: &StateEvent, policy: &dyn QuorumPolicy) -> NodeState {
    let in_quorum = || policy.is_node_in_quorum(&event.node_map);

    match (current, &event.kind) {
        (_, StateEventKind::SelfLeave) => NodeState::Down,
        (NodeState::Down, _) => NodeState::Down,

        (NodeState::Up, StateEventKind::SelfAlive | StateEventKind::NodeAlive) => NodeState::Up,
        (NodeState::Up, StateEventKind::Timeout) => NodeState::Up,
        (
            NodeState::Up,
            StateEventKind::NodeLeave
            | StateEventKind::UpdateClusterSize(_)
            | StateEventKind::UpdateActiveDomains(_),
        ) => {
            if in_quorum() {
                NodeState::Up
            } else {
                NodeState::SuspectNotInQuorum
            }
        }

        (NodeState::SuspectNotInQuorum, StateEventKind::Timeout) => NodeState::NotInQuorum,
        (NodeState::SuspectNotInQuorum, _) => {
            if in_quorum() {
                NodeState::Up
            } else {
                NodeState::SuspectNotInQuorum
            }
        }

        (NodeState::NotInQuorum, StateEventKind::Timeout) => NodeState::NotInQuorum,
        (NodeState::NotInQuorum, _) => {
            if in_quorum() {
                NodeState::Up
            } else {
                NodeState::NotInQuorum
            }
        }
    }
}

/// Handle to the state worker. Cloneable senders submit events; the
/// worker writes status changes back to the store.
pub struct StateMachine {
    tx: Sender<StateEvent>,
    submit_timeout: Duration,
    current: Arc<Mutex<NodeState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateMachine {
    pub fn start(
        store: Arc<NodeStore>,
        policy: Arc<dyn QuorumPolicy>,
        quorum_timeout: Duration,
        queue_depth: usize,
        submit_timeout: Duration,
    ) -> Result<Self, StateError> {
        let initial = NodeState::from_status(store.get_self_status());
        let current = Arc::new(Mutex::new(initial));
        let (tx, rx) = channel::bounded::<StateEvent>(queue_depth.max(1));

        let worker_current = Arc::clone(&current);
        let handle = std::thread::Builder::new()
            .name("gossip-state".to_string())
            .spawn(move || {
                let mut state = initial;
                let mut sniq_deadline: Option<Instant> = None;

                loop {
                    let event = match sniq_deadline {
                        Some(deadline) => match rx.recv_deadline(deadline) {
                            Ok(event) => event,
                            Err(RecvTimeoutError::Timeout) => StateEvent {
                                kind: StateEventKind::Timeout,
                                node_map: store.get_local_state(),
                            },
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(event) => event,
                            Err(_) => break,
                        },
                    };

                    match &event.kind {
                        StateEventKind::UpdateClusterSize(counts) => {
                            policy.update_member_counts(counts.clone());
                        }
                        StateEventKind::UpdateActiveDomains(active) => {
                            policy.update_active_domains(active);
                        }
                        _ => {}
                    }

                    let next = transition(state, &event, policy.as_ref());
                    if next != state {
                        tracing::info!(
                            from = %state.as_status(),
                            to = %next.as_status(),
                            event = ?event.kind,
                            "local node state change"
                        );
                        store.update_self_status(next.as_status());
                        *worker_current.lock().expect("state lock poisoned") = next;
                    }

                    if next == NodeState::SuspectNotInQuorum {
                        if state != NodeState::SuspectNotInQuorum {
                            sniq_deadline = Some(Instant::now() + quorum_timeout);
                        }
                    } else {
                        sniq_deadline = None;
                    }

                    state = next;
                    if state == NodeState::Down {
                        break;
                    }
                }
            })
            .map_err(StateError::Spawn)?;

        Ok(Self {
            tx,
            submit_timeout,
            current,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue an event. Blocks up to the submit timeout; a full queue
    /// drops the event — the next periodic signal recomputes.
    pub fn submit(&self, kind: StateEventKind, node_map: NodeInfoMap) {
        let event = StateEvent { kind, node_map };
        match self.tx.send_timeout(event, self.submit_timeout) {
            Ok(()) => {}
            Err(err) => {
                let kind = match err {
                    channel::SendTimeoutError::Timeout(event) => event.kind,
                    channel::SendTimeoutError::Disconnected(event) => event.kind,
                };
                tracing::warn!(event = ?kind, "state event dropped");
            }
        }
    }

    /// Non-blocking submit for use inside callbacks.
    pub fn try_submit(&self, kind: StateEventKind, node_map: NodeInfoMap) {
        let event = StateEvent { kind, node_map };
        if let Err(err) = self.tx.try_send(event) {
            let kind = match err {
                TrySendError::Full(event) => event.kind,
                TrySendError::Disconnected(event) => event.kind,
            };
            tracing::warn!(event = ?kind, "state event dropped");
        }
    }

    pub fn current(&self) -> NodeState {
        *self.current.lock().expect("state lock poisoned")
    }

    /// Wait for the worker to exit after SelfLeave. Returns false on
    /// overrun.
    pub fn join(&self, deadline: Duration) -> bool {
        let handle = {
            let mut worker = self.worker.lock().expect("state lock poisoned");
            worker.take()
        };
        let Some(handle) = handle else {
            return true;
        };

        let end = Instant::now() + deadline;
        while !handle.is_finished() {
            if Instant::now() >= end {
                let mut worker = self.worker.lock().expect("state lock poisoned");
                *worker = Some(handle);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}
