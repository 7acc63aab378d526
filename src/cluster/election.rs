//! Domain leader election
//!
//! A weighted bully election run among the connected nodes of the local
//! domain. Every node announces a candidacy weight; once every connected
//! domain peer has answered, or the phase timeout fires, the heaviest
//! candidate announces itself with `Leader` and takes office after the
//! acks arrive (or the next timeout). Any change in connectivity or
//! configuration starts a new round.
//!
//! The state machine itself is pure: [`ElectionCore`] turns events into
//! [`ElectionAction`]s, which [`ElectionManager`] executes outside its lock.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::ClusterConfig;
use super::node::{DomainId, NodeId};
use crate::rpc::protocol::{
    AsyncMessageHeader, LeaderAckMessage, LeaderCandMessage, LeaderMessage, SyncMessage,
};
use crate::sync::manager::SyncManager;

/// Callbacks fired when the local node's role changes
pub trait ClusterListener: Send + Sync {
    /// The local node took office as domain leader
    fn notify_leader(&self) {}

    /// Another node leads the local domain
    fn notify_follower(&self, _leader: NodeId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Init,
    Election,
    LeaderElect,
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElectionAction {
    Broadcast(ElectionMessage),
    Send(NodeId, ElectionMessage),
    Timeout(u64),
    BecameLeader,
    BecameFollower(NodeId),
}

/// Election traffic before it is wrapped into a [`SyncMessage`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElectionMessage {
    Cand { weight: i32 },
    Leader { weight: i32 },
    Ack { leader: NodeId },
}

const MAX: i32 = i16::MAX as i32;

/// Candidacy weight of `node_id`
pub fn election_weight(node_id: NodeId, incumbent: bool, rigged: bool, leader_allowed: bool) -> i32 {
    let id = node_id as i32;
    let mut weight = id;
    if incumbent {
        weight += MAX;
    }
    if rigged {
        weight += 2 * MAX;
    }
    if !leader_allowed {
        weight -= id;
    }
    weight
}

#[derive(Debug)]
pub struct ElectionCore {
    state: ElectionState,
    generation: u64,
    local: NodeId,
    domain: DomainId,
    leader_allowed: bool,
    domain_peers: HashSet<NodeId>,
    connected: HashSet<NodeId>,
    candidates: HashMap<NodeId, i32>,
    acks: HashSet<NodeId>,
    leader: Option<NodeId>,
    pending_winner: Option<NodeId>,
    rigged: bool,
}

impl ElectionCore {
    pub fn new(local: NodeId, domain: DomainId) -> Self {
        Self {
            state: ElectionState::Init,
            generation: 0,
            local,
            domain,
            leader_allowed: true,
            domain_peers: HashSet::new(),
            connected: HashSet::new(),
            candidates: HashMap::new(),
            acks: HashSet::new(),
            leader: None,
            pending_winner: None,
            rigged: false,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Elected leader, once the local node has settled on one
    pub fn leader(&self) -> Option<NodeId> {
        match self.state {
            ElectionState::Leader | ElectionState::Follower => self.leader,
            _ => None,
        }
    }

    pub fn configure(&mut self, config: &ClusterConfig) {
        self.local = config.local_node_id();
        self.domain = config.local_domain_id();
        self.leader_allowed = config.leader_allowed();
        self.domain_peers = config
            .domain_nodes()
            .map(|n| n.node_id)
            .filter(|id| *id != self.local)
            .collect();
    }

    pub fn set_connected(&mut self, node_id: NodeId, connected: bool) {
        if connected {
            self.connected.insert(node_id);
        } else {
            self.connected.remove(&node_id);
        }
    }

    pub fn is_domain_peer(&self, node_id: NodeId) -> bool {
        self.domain_peers.contains(&node_id)
    }

    fn live_peers(&self) -> HashSet<NodeId> {
        self.domain_peers
            .intersection(&self.connected)
            .copied()
            .collect()
    }

    fn weight(&self, rigged: bool) -> i32 {
        let incumbent = self.leader == Some(self.local)
            && matches!(self.state, ElectionState::Leader | ElectionState::LeaderElect);
        election_weight(self.local, incumbent, rigged, self.leader_allowed)
    }

    /// Begin a new round
    pub fn start(&mut self, rigged: bool) -> Vec<ElectionAction> {
        let weight = self.weight(rigged);
        self.generation += 1;
        self.state = ElectionState::Election;
        self.rigged = rigged;
        self.candidates.clear();
        self.acks.clear();
        self.pending_winner = None;
        self.candidates.insert(self.local, weight);
        debug!(
            "Node {} starts election round {} with weight {}",
            self.local, self.generation, weight
        );

        let mut actions = vec![
            ElectionAction::Broadcast(ElectionMessage::Cand { weight }),
            ElectionAction::Timeout(self.generation),
        ];
        actions.extend(self.try_resolve(false));
        actions
    }

    /// Pick the winner once everyone answered, or on timeout with whoever did
    fn try_resolve(&mut self, timed_out: bool) -> Vec<ElectionAction> {
        if self.state != ElectionState::Election || self.pending_winner.is_some() {
            return Vec::new();
        }
        let live = self.live_peers();
        if !timed_out && !live.iter().all(|id| self.candidates.contains_key(id)) {
            return Vec::new();
        }

        let winner = self
            .candidates
            .iter()
            .filter(|(id, _)| **id == self.local || live.contains(id))
            .max_by_key(|(id, weight)| (**weight, **id))
            .map(|(id, _)| *id)
            .unwrap_or(self.local);

        if winner == self.local {
            let weight = self.candidates.get(&self.local).copied().unwrap_or_default();
            self.state = ElectionState::LeaderElect;
            self.generation += 1;
            let mut actions = vec![
                ElectionAction::Broadcast(ElectionMessage::Leader { weight }),
                ElectionAction::Timeout(self.generation),
            ];
            if live.is_empty() {
                actions.extend(self.take_office());
            }
            actions
        } else {
            debug!("Node {} expects {} to lead", self.local, winner);
            self.pending_winner = Some(winner);
            self.generation += 1;
            vec![ElectionAction::Timeout(self.generation)]
        }
    }

    fn take_office(&mut self) -> Vec<ElectionAction> {
        self.state = ElectionState::Leader;
        self.leader = Some(self.local);
        self.generation += 1;
        info!("Node {} is leader of domain {}", self.local, self.domain);
        vec![ElectionAction::BecameLeader]
    }

    pub fn on_timeout(&mut self, generation: u64) -> Vec<ElectionAction> {
        if generation != self.generation {
            return Vec::new();
        }
        match self.state {
            ElectionState::Election if self.pending_winner.is_some() => {
                warn!(
                    "Node {} never announced itself leader, restarting election",
                    self.pending_winner.unwrap_or_default()
                );
                self.start(false)
            }
            ElectionState::Election => self.try_resolve(true),
            ElectionState::LeaderElect => self.take_office(),
            _ => Vec::new(),
        }
    }

    pub fn on_cand(&mut self, node_id: NodeId, domain: DomainId, weight: i32) -> Vec<ElectionAction> {
        if domain != self.domain || node_id == self.local {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match self.state {
            ElectionState::Election => {}
            ElectionState::LeaderElect => {
                self.candidates.insert(node_id, weight);
                return actions;
            }
            _ => actions.extend(self.start(false)),
        }
        self.candidates.insert(node_id, weight);
        actions.extend(self.try_resolve(false));
        actions
    }

    pub fn on_leader(&mut self, node_id: NodeId, domain: DomainId, weight: i32) -> Vec<ElectionAction> {
        if domain != self.domain || node_id == self.local {
            return Vec::new();
        }
        let ours = self.candidates.get(&self.local).copied().unwrap_or_else(|| self.weight(false));
        let contest = match self.state {
            ElectionState::Leader | ElectionState::LeaderElect => {
                (ours, self.local) > (weight, node_id)
            }
            _ => self.rigged && (ours, self.local) > (weight, node_id),
        };
        if contest {
            debug!(
                "Node {} contests leadership claim of {} ({} < {})",
                self.local, node_id, weight, ours
            );
            return self.start(self.rigged);
        }

        self.state = ElectionState::Follower;
        self.leader = Some(node_id);
        self.pending_winner = None;
        self.rigged = false;
        self.generation += 1;
        info!("Node {} follows leader {} of domain {}", self.local, node_id, domain);
        vec![
            ElectionAction::Send(node_id, ElectionMessage::Ack { leader: node_id }),
            ElectionAction::BecameFollower(node_id),
        ]
    }

    pub fn on_ack(&mut self, node_id: NodeId, domain: DomainId, leader: NodeId) -> Vec<ElectionAction> {
        if domain != self.domain || leader != self.local {
            return Vec::new();
        }
        if self.state != ElectionState::LeaderElect {
            return Vec::new();
        }
        self.acks.insert(node_id);
        let live = self.live_peers();
        if live.iter().all(|id| self.acks.contains(id)) {
            self.take_office()
        } else {
            Vec::new()
        }
    }

    /// Leave the election entirely, e.g. while unassigned
    pub fn reset(&mut self) {
        self.state = ElectionState::Init;
        self.leader = None;
        self.pending_winner = None;
        self.candidates.clear();
        self.acks.clear();
        self.generation += 1;
    }
}

struct Runtime {
    handle: tokio::runtime::Handle,
    manager: SyncManager,
}

/// Runs [`ElectionCore`] against the RPC service
pub struct ElectionManager {
    timeout: Duration,
    core: Mutex<ElectionCore>,
    listeners: RwLock<Vec<Arc<dyn ClusterListener>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl ElectionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            core: Mutex::new(ElectionCore::new(super::node::UNASSIGNED_NODE_ID, 0)),
            listeners: RwLock::new(Vec::new()),
            runtime: Mutex::new(None),
        }
    }

    /// Bind to the running manager. Must be called from within a runtime.
    pub(crate) fn start(&self, manager: SyncManager) {
        *self.runtime.lock() = Some(Runtime {
            handle: tokio::runtime::Handle::current(),
            manager,
        });
    }

    pub(crate) fn shutdown(&self) {
        self.runtime.lock().take();
        self.core.lock().reset();
    }

    pub fn state(&self) -> ElectionState {
        self.core.lock().state()
    }

    pub fn get_domain_leader(&self) -> Option<NodeId> {
        self.core.lock().leader()
    }

    pub fn register_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.listeners.write().push(listener);
    }

    pub fn new_election(&self, rigged: bool) {
        let actions = {
            let mut core = self.core.lock();
            if !super::node::is_assigned(core.local) {
                return;
            }
            core.start(rigged)
        };
        self.execute(actions);
    }

    pub(crate) fn on_config_change(&self, config: &ClusterConfig) {
        let actions = {
            let mut core = self.core.lock();
            core.configure(config);
            if config.is_unassigned() {
                core.reset();
                Vec::new()
            } else {
                core.start(false)
            }
        };
        self.execute(actions);
    }

    pub(crate) fn on_connection_change(&self, node_id: NodeId, connected: bool) {
        let actions = {
            let mut core = self.core.lock();
            core.set_connected(node_id, connected);
            // links to other domains never change this domain's leader
            if !super::node::is_assigned(core.local) || !core.is_domain_peer(node_id) {
                return;
            }
            core.start(false)
        };
        self.execute(actions);
    }

    pub fn on_leader_cand(&self, node_id: NodeId, domain_id: DomainId, weight: i32) {
        let actions = self.core.lock().on_cand(node_id, domain_id, weight);
        self.execute(actions);
    }

    pub fn on_leader(&self, node_id: NodeId, domain_id: DomainId, weight: i32) {
        let actions = self.core.lock().on_leader(node_id, domain_id, weight);
        self.execute(actions);
    }

    pub fn on_leader_ack(&self, node_id: NodeId, domain_id: DomainId, leader: NodeId) {
        let actions = self.core.lock().on_ack(node_id, domain_id, leader);
        self.execute(actions);
    }

    fn on_timeout(&self, generation: u64) {
        let actions = self.core.lock().on_timeout(generation);
        self.execute(actions);
    }

    fn execute(&self, actions: Vec<ElectionAction>) {
        if actions.is_empty() {
            return;
        }
        let (local, domain, peers) = {
            let core = self.core.lock();
            (core.local, core.domain, core.live_peers())
        };
        let runtime = self
            .runtime
            .lock()
            .as_ref()
            .map(|r| (r.handle.clone(), r.manager.clone()));

        for action in actions {
            match action {
                ElectionAction::BecameLeader => {
                    for listener in self.listeners.read().iter() {
                        listener.notify_leader();
                    }
                }
                ElectionAction::BecameFollower(leader) => {
                    for listener in self.listeners.read().iter() {
                        listener.notify_follower(leader);
                    }
                }
                ElectionAction::Broadcast(msg) => {
                    if let Some((_, manager)) = &runtime {
                        for peer in &peers {
                            let wire = to_wire(manager, local, domain, msg);
                            manager.rpc().write_to_node(*peer, wire);
                        }
                    }
                }
                ElectionAction::Send(node_id, msg) => {
                    if let Some((_, manager)) = &runtime {
                        let wire = to_wire(manager, local, domain, msg);
                        manager.rpc().write_to_node(node_id, wire);
                    }
                }
                ElectionAction::Timeout(generation) => {
                    if let Some((handle, manager)) = &runtime {
                        let manager = manager.clone();
                        let timeout = self.timeout;
                        handle.spawn(async move {
                            tokio::time::sleep(timeout).await;
                            manager.election().on_timeout(generation);
                        });
                    }
                }
            }
        }
    }
}

fn to_wire(manager: &SyncManager, local: NodeId, domain: DomainId, msg: ElectionMessage) -> SyncMessage {
    let header = AsyncMessageHeader::new(manager.rpc().next_transaction_id());
    match msg {
        ElectionMessage::Cand { weight } => SyncMessage::LeaderCand(LeaderCandMessage {
            header,
            node_id: local,
            domain_id: domain,
            weight,
        }),
        ElectionMessage::Leader { weight } => SyncMessage::Leader(LeaderMessage {
            header,
            node_id: local,
            domain_id: domain,
            weight,
        }),
        ElectionMessage::Ack { leader } => SyncMessage::LeaderAck(LeaderAckMessage {
            header,
            node_id: local,
            domain_id: domain,
            leader_node_id: leader,
        }),
    }
}
