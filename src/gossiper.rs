//! The engine orchestrator: periodic sender loop, inbound acceptor,
//! probation wiring, and the public embedding API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::channel::{Acceptor, MessageChannel};
use crate::clock::{SystemTime, TimeSource};
use crate::config::GossipConfig;
use crate::error::Error;
use crate::history::{SessionDirection, SessionHistory, SessionOutcome, SessionRecord};
use crate::peers::{PeerBook, PeerEntry};
use crate::probation::{Probation, ProbationCallback};
use crate::quorum::{FailureDomainQuorum, FlatQuorum, QuorumPolicy};
use crate::session;
use crate::state::{StateEventKind, StateMachine};
use crate::store::NodeStore;
use crate::types::{
    DomainActiveMap, DomainMemberCounts, NodeId, NodeInfo, NodeInfoMap, NodeStatus, NodeValue,
    StoreKey,
};
use crate::Result;

/// Which quorum policy the engine runs with. Chosen at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumPolicyChoice {
    Flat,
    FailureDomains,
}

/// Identity and cluster placement of the local node.
#[derive(Clone, Debug)]
pub struct GossiperOptions {
    pub self_id: NodeId,
    /// Bind address of the acceptor, also the address peers dial.
    pub self_address: String,
    pub cluster_id: String,
    pub gossip_version: String,
    pub cluster_domain: String,
    pub quorum_member: bool,
    /// Generation advertised to detect restarts. Defaults to the
    /// wall-clock second of engine construction.
    pub gen_number: Option<u64>,
    /// Local status at boot, before the state machine has evidence.
    pub initial_status: NodeStatus,
    pub quorum_policy: QuorumPolicyChoice,
    pub active_domains: DomainActiveMap,
}

impl GossiperOptions {
    pub fn new(self_id: impl Into<String>, self_address: impl Into<String>) -> Self {
        Self {
            self_id: NodeId::new(self_id),
            self_address: self_address.into(),
            cluster_id: "default".to_string(),
            gossip_version: "v1".to_string(),
            cluster_domain: String::new(),
            quorum_member: true,
            gen_number: None,
            initial_status: NodeStatus::NotInQuorum,
            quorum_policy: QuorumPolicyChoice::Flat,
            active_domains: DomainActiveMap::new(),
        }
    }
}

/// Everything the session-outcome paths need; shared by the sender
/// loop, the acceptor handler, and the probation callback.
struct EngineCtx {
    store: Arc<NodeStore>,
    machine: Arc<StateMachine>,
    probation: Arc<Probation<()>>,
    history: Arc<SessionHistory>,
    cluster_id: String,
}

impl EngineCtx {
    fn on_session_success(&self, peer: &NodeId, direction: SessionDirection) {
        self.history
            .record(Some(peer.clone()), direction, SessionOutcome::Completed);

        if self.probation.remove(peer) {
            tracing::info!(peer = %peer, "peer recovered while on probation");
        }
        if self.store.contains(peer) {
            if let Err(err) = self.store.update_node_status(peer, NodeStatus::Up) {
                tracing::warn!(peer = %peer, "failed to mark peer up: {err}");
            }
        }
        self.machine
            .submit(StateEventKind::NodeAlive, self.store.get_local_state());
    }

    fn on_session_failure(
        &self,
        peer: Option<&NodeId>,
        direction: SessionDirection,
        reason: String,
    ) {
        self.history.record(
            peer.cloned(),
            direction,
            SessionOutcome::Failed {
                reason: reason.clone(),
            },
        );

        let Some(peer) = peer else {
            tracing::debug!("unattributed session failure: {reason}");
            return;
        };
        tracing::warn!(peer = %peer, "gossip session failed: {reason}");

        let last_known = self
            .store
            .get_local_node_info(peer)
            .map(|info| info.status)
            .unwrap_or(NodeStatus::Invalid);
        if last_known == NodeStatus::Up {
            if let Err(err) = self
                .store
                .update_node_status(peer, NodeStatus::SuspectDown)
            {
                tracing::warn!(peer = %peer, "failed to mark peer suspect-down: {err}");
            }
            self.probation.add(peer.clone(), (), true);
        }
        self.machine
            .submit(StateEventKind::NodeLeave, self.store.get_local_state());
    }
}

struct Tunables {
    gossip_interval: Duration,
    node_death_interval: Duration,
}

struct Runtime {
    acceptor: Acceptor,
    sender: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
    // Dropping the senders disconnects the worker loops.
    _done_txs: Vec<Sender<()>>,
}

pub struct Gossiper {
    options: GossiperOptions,
    config: GossipConfig,
    tunables: Arc<Mutex<Tunables>>,
    time: Arc<dyn TimeSource>,
    store: Arc<NodeStore>,
    peers: Arc<PeerBook>,
    policy: Arc<dyn QuorumPolicy>,
    machine: Arc<StateMachine>,
    probation: Arc<Probation<()>>,
    history: Arc<SessionHistory>,
    ctx: Arc<EngineCtx>,
    runtime: Mutex<Option<Runtime>>,
}

impl Gossiper {
    pub fn new(options: GossiperOptions, config: GossipConfig) -> Result<Self> {
        Self::with_time_source(options, config, Arc::new(SystemTime::new()))
    }

    pub fn with_time_source(
        mut options: GossiperOptions,
        config: GossipConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let gen_number = options
            .gen_number
            .get_or_insert_with(|| time.now().unix_timestamp().max(0) as u64)
            .to_owned();

        let store = Arc::new(NodeStore::new(
            options.self_id.clone(),
            options.gossip_version.clone(),
            gen_number,
            options.initial_status,
            options.cluster_domain.clone(),
            options.quorum_member,
            Arc::clone(&time),
        ));

        let policy: Arc<dyn QuorumPolicy> = match options.quorum_policy {
            QuorumPolicyChoice::Flat => Arc::new(FlatQuorum::new(1)),
            QuorumPolicyChoice::FailureDomains => Arc::new(FailureDomainQuorum::new(
                options.self_id.clone(),
                options.active_domains.clone(),
            )),
        };

        let machine = Arc::new(StateMachine::start(
            Arc::clone(&store),
            Arc::clone(&policy),
            config.quorum_timeout,
            config.event_queue_depth,
            config.event_submit_timeout,
        )?);

        let callback_store = Arc::clone(&store);
        let callback_machine = Arc::clone(&machine);
        let callback: ProbationCallback<()> = Arc::new(move |id, ()| {
            tracing::warn!(peer = %id, "probation expired, marking peer down");
            if let Err(err) = callback_store.update_node_status(&id, NodeStatus::Down) {
                tracing::debug!(peer = %id, "peer vanished before probation expiry: {err}");
                return;
            }
            callback_machine.try_submit(StateEventKind::NodeLeave, callback_store.get_local_state());
        });
        let probation = Arc::new(Probation::new(
            options.self_id.as_str(),
            config.suspect_down_timeout,
            callback,
        ));

        let history = Arc::new(SessionHistory::new(
            config.history_capacity,
            Arc::clone(&time),
        ));

        let ctx = Arc::new(EngineCtx {
            store: Arc::clone(&store),
            machine: Arc::clone(&machine),
            probation: Arc::clone(&probation),
            history: Arc::clone(&history),
            cluster_id: options.cluster_id.clone(),
        });

        let tunables = Arc::new(Mutex::new(Tunables {
            gossip_interval: config.gossip_interval,
            node_death_interval: config.node_death_interval,
        }));

        Ok(Self {
            peers: Arc::new(PeerBook::new(options.self_id.clone())),
            options,
            config,
            tunables,
            time,
            store,
            policy,
            machine,
            probation,
            history,
            ctx,
            runtime: Mutex::new(None),
        })
    }

    /// Begin gossiping: start the probation timers, the acceptor, the
    /// sender loop, and the optional death sweeper. `peer_hints` seeds
    /// the peer book through the legacy address-only path.
    pub fn start(&self, peer_hints: &[String]) -> Result<()> {
        let mut runtime = self.runtime.lock().expect("gossiper lock poisoned");
        if runtime.is_some() {
            return Err(Error::AlreadyStarted);
        }

        for addr in peer_hints {
            if let Err(err) = self.peers.add_node(addr) {
                tracing::debug!(addr = %addr, "peer hint skipped: {err}");
            }
        }

        self.probation.start()?;

        let handler_ctx = Arc::clone(&self.ctx);
        let acceptor = Acceptor::start(
            &self.options.self_address,
            self.config.io_deadline,
            self.config.max_frame_bytes,
            self.config.max_inbound_sessions,
            Arc::new(move |peer_addr, mut channel: MessageChannel| {
                let result =
                    session::respond(&handler_ctx.store, &handler_ctx.cluster_id, &mut channel);
                channel.close();
                match result {
                    Ok(peer) => {
                        tracing::debug!(peer = %peer, from = %peer_addr, "inbound session complete");
                        handler_ctx.on_session_success(&peer, SessionDirection::Accepted);
                    }
                    Err(failure) => {
                        handler_ctx.on_session_failure(
                            failure.peer.as_ref(),
                            SessionDirection::Accepted,
                            failure.source.to_string(),
                        );
                    }
                }
            }),
        )?;

        let mut done_txs = Vec::new();

        let (sender_done_tx, sender_done_rx) = channel::bounded::<()>(0);
        done_txs.push(sender_done_tx);
        let sender = spawn_sender_loop(
            Arc::clone(&self.ctx),
            Arc::clone(&self.peers),
            Arc::clone(&self.tunables),
            self.config.clone(),
            sender_done_rx,
        )?;

        let sweeper = if self.config.death_sweeper_enabled() {
            let (sweeper_done_tx, sweeper_done_rx) = channel::bounded::<()>(0);
            done_txs.push(sweeper_done_tx);
            Some(spawn_death_sweeper(
                Arc::clone(&self.ctx),
                Arc::clone(&self.tunables),
                Arc::clone(&self.time),
                sweeper_done_rx,
            )?)
        } else {
            None
        };

        self.machine
            .submit(StateEventKind::SelfAlive, self.store.get_local_state());

        tracing::info!(
            node = %self.options.self_id,
            addr = %acceptor.local_addr(),
            "gossip engine started"
        );

        *runtime = Some(Runtime {
            acceptor,
            sender,
            sweeper,
            _done_txs: done_txs,
        });
        Ok(())
    }

    /// Emit SelfLeave and wind the workers down. Returns
    /// `ShutdownIncomplete` when they fail to drain within
    /// `drain_timeout`; the engine cannot be restarted afterwards.
    pub fn stop(&self, drain_timeout: Duration) -> Result<()> {
        let mut runtime = {
            let mut slot = self.runtime.lock().expect("gossiper lock poisoned");
            slot.take().ok_or(Error::NotStarted)?
        };

        self.machine
            .submit(StateEventKind::SelfLeave, self.store.get_local_state());

        let deadline = Instant::now() + drain_timeout;
        runtime.acceptor.shutdown();
        drop(runtime._done_txs);
        self.probation.stop();

        let mut pending = Vec::new();
        if !join_until(runtime.sender, deadline) {
            pending.push("sender loop");
        }
        if let Some(sweeper) = runtime.sweeper {
            if !join_until(sweeper, deadline) {
                pending.push("death sweeper");
            }
        }
        if !self
            .machine
            .join(deadline.saturating_duration_since(Instant::now()))
        {
            pending.push("state machine");
        }
        while runtime.acceptor.active_sessions() > 0 {
            if Instant::now() >= deadline {
                pending.push("session workers");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if pending.is_empty() {
            tracing::info!(node = %self.options.self_id, "gossip engine stopped");
            Ok(())
        } else {
            Err(Error::ShutdownIncomplete {
                waited: drain_timeout,
                pending: pending.join(", "),
            })
        }
    }

    /// Set one key of the local node's replicated payload.
    pub fn update_self(&self, key: StoreKey, value: serde_json::Value) {
        self.store.update_self(key, value);
    }

    /// Administrative override of the local status, bypassing the
    /// state machine.
    pub fn update_self_status(&self, status: NodeStatus) {
        self.store.update_self_status(status);
    }

    /// Reconcile the peer book and the store with a full topology map,
    /// then let the state machine re-evaluate quorum with the new
    /// per-domain member counts.
    pub fn update_cluster(&self, desired: BTreeMap<NodeId, PeerEntry>) {
        let counts = quorum_member_counts(&desired);
        let delta = self.peers.update_cluster(desired.clone());

        for entry in &delta.added {
            if entry.id != self.options.self_id {
                self.store
                    .new_node(entry.id.clone(), &entry.cluster_domain, entry.quorum_member);
                tracing::info!(peer = %entry.id, addr = %entry.address, "peer added to cluster");
            }
        }
        for (id, entry) in &desired {
            if let Err(err) =
                self.store
                    .update_node_membership(id, &entry.cluster_domain, entry.quorum_member)
            {
                tracing::debug!(peer = %id, "membership patch skipped: {err}");
            }
        }
        for id in &delta.removed {
            self.probation.remove(id);
            self.store.remove_node(id);
            tracing::info!(peer = %id, "peer removed from cluster");
        }

        self.machine.submit(
            StateEventKind::UpdateClusterSize(counts),
            self.store.get_local_state(),
        );
    }

    /// Reconcile failure-domain activation and re-evaluate quorum.
    pub fn update_cluster_domains_active_map(&self, active: DomainActiveMap) {
        self.machine.submit(
            StateEventKind::UpdateActiveDomains(active),
            self.store.get_local_state(),
        );
    }

    /// Externally provided per-domain quorum member sizing.
    pub fn update_quorum_member_counts(&self, counts: DomainMemberCounts) {
        self.policy.update_member_counts(counts);
    }

    pub fn get_self_status(&self) -> NodeStatus {
        self.store.get_self_status()
    }

    pub fn get_local_node_info(&self, id: &NodeId) -> Result<NodeInfo> {
        Ok(self.store.get_local_node_info(id)?)
    }

    pub fn get_local_state(&self) -> NodeInfoMap {
        self.store.get_local_state()
    }

    pub fn get_store_keys(&self) -> Vec<StoreKey> {
        self.store.get_store_keys()
    }

    pub fn get_store_key_value(&self, key: &StoreKey) -> BTreeMap<NodeId, NodeValue> {
        self.store.get_store_key_value(key)
    }

    pub fn node_id(&self) -> NodeId {
        self.options.self_id.clone()
    }

    pub fn gossip_interval(&self) -> Duration {
        self.tunables
            .lock()
            .expect("gossiper lock poisoned")
            .gossip_interval
    }

    pub fn set_gossip_interval(&self, interval: Duration) {
        self.tunables
            .lock()
            .expect("gossiper lock poisoned")
            .gossip_interval = interval;
    }

    pub fn node_death_interval(&self) -> Duration {
        self.tunables
            .lock()
            .expect("gossiper lock poisoned")
            .node_death_interval
    }

    pub fn set_node_death_interval(&self, interval: Duration) {
        self.tunables
            .lock()
            .expect("gossiper lock poisoned")
            .node_death_interval = interval;
    }

    /// Legacy path: register a peer address without topology metadata.
    pub fn add_node(&self, addr: &str) -> Result<()> {
        let id = self.peers.add_node(addr)?;
        tracing::info!(peer = %id, addr = %addr, "peer address added");
        Ok(())
    }

    pub fn remove_node(&self, addr: &str) -> Result<()> {
        let id = self.peers.remove_node(addr)?;
        tracing::info!(peer = %id, addr = %addr, "peer address removed");
        Ok(())
    }

    pub fn get_nodes(&self) -> Vec<String> {
        self.peers.addresses()
    }

    pub fn history(&self) -> Vec<SessionRecord> {
        self.history.records()
    }

    /// Acceptor bind address, useful when binding to port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.runtime
            .lock()
            .expect("gossiper lock poisoned")
            .as_ref()
            .map(|runtime| runtime.acceptor.local_addr())
    }
}

fn quorum_member_counts(desired: &BTreeMap<NodeId, PeerEntry>) -> DomainMemberCounts {
    let mut counts = DomainMemberCounts::new();
    for entry in desired.values() {
        if entry.quorum_member {
            *counts.entry(entry.cluster_domain.clone()).or_default() += 1;
        }
    }
    counts
}

fn spawn_sender_loop(
    ctx: Arc<EngineCtx>,
    peers: Arc<PeerBook>,
    tunables: Arc<Mutex<Tunables>>,
    config: GossipConfig,
    done_rx: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("gossip-sender".to_string())
        .spawn(move || {
            loop {
                let interval = tunables
                    .lock()
                    .expect("gossiper lock poisoned")
                    .gossip_interval;
                match done_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                if config.self_correct {
                    ctx.store.restamp_self();
                }

                let Some(peer) = peers.random_peer() else {
                    tracing::trace!("no peers to gossip with");
                    continue;
                };

                gossip_once(&ctx, &peer, &config);
            }
            tracing::debug!("sender loop exiting");
        })
        .map_err(|err| Error::Channel(err.into()))?;
    Ok(handle)
}

fn gossip_once(ctx: &EngineCtx, peer: &PeerEntry, config: &GossipConfig) {
    let mut channel = match MessageChannel::dial(
        &peer.address,
        config.dial_deadline,
        config.io_deadline,
        config.max_frame_bytes,
    ) {
        Ok(channel) => channel,
        Err(err) => {
            ctx.on_session_failure(
                Some(&peer.id),
                SessionDirection::Initiated,
                err.to_string(),
            );
            return;
        }
    };

    let result = session::initiate(&ctx.store, &ctx.cluster_id, &mut channel);
    channel.close();
    match result {
        Ok(()) => {
            tracing::debug!(peer = %peer.id, "outbound session complete");
            ctx.on_session_success(&peer.id, SessionDirection::Initiated);
        }
        Err(err) => {
            ctx.on_session_failure(Some(&peer.id), SessionDirection::Initiated, err.to_string());
        }
    }
}

fn spawn_death_sweeper(
    ctx: Arc<EngineCtx>,
    tunables: Arc<Mutex<Tunables>>,
    time: Arc<dyn TimeSource>,
    done_rx: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("gossip-sweeper".to_string())
        .spawn(move || {
            loop {
                let interval = tunables
                    .lock()
                    .expect("gossiper lock poisoned")
                    .node_death_interval;
                let wait = if interval.is_zero() {
                    Duration::from_secs(1)
                } else {
                    interval
                };
                match done_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if interval.is_zero() {
                    continue;
                }

                sweep_dead_nodes(&ctx, time.as_ref(), interval);
            }
            tracing::debug!("death sweeper exiting");
        })
        .map_err(|err| Error::Channel(err.into()))?;
    Ok(handle)
}

/// Declare Down every non-self node whose record went stale. Runs off
/// the gossip path so a peer that stops gossiping is still demoted in
/// bounded time.
fn sweep_dead_nodes(ctx: &EngineCtx, time: &dyn TimeSource, interval: Duration) {
    let now = time.now();
    let self_id = ctx.store.self_id();
    let mut any_death = false;

    for (id, info) in ctx.store.get_local_state() {
        if id == self_id || !info.status.is_valid() || info.status == NodeStatus::Down {
            continue;
        }
        let age = now - info.last_update_ts;
        if age > interval {
            tracing::warn!(peer = %id, age = ?age, "peer record went stale, marking down");
            ctx.probation.remove(&id);
            if ctx.store.update_node_status(&id, NodeStatus::Down).is_ok() {
                any_death = true;
            }
        }
    }

    if any_death {
        ctx.machine
            .submit(StateEventKind::NodeLeave, ctx.store.get_local_state());
    }
}

fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    true
}
