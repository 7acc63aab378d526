//! Joining a cluster through a seed
//!
//! Bootstrap is a one-shot exchange: connect to a seed, say hello, send a
//! join request carrying the local node descriptor, merge the node store
//! snapshot from the response into the local system node store and record
//! the node id the seed assigned. The connection is closed afterwards
//! whatever the outcome.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::node::{is_assigned, ClusterNode, NodeId};
use crate::error::{SyncError, SyncResult};
use crate::rpc::auth::AuthContext;
use crate::rpc::handler::{finish_client_handshake, run_channel, send_client_hello, Channel, RpcChannelHandler};
use crate::rpc::protocol::*;
use crate::storage::StorageEngine;
use crate::sync::byte_array::{encode_key, encode_value};
use crate::sync::manager::{unsync_keys, SyncManager, SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE};

/// Upper bound for one bootstrap attempt against one seed
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Init,
    HelloSent,
    JoinRequested,
    Joined,
    Failed,
}

/// Client side of the join exchange
pub struct BootstrapChannelHandler {
    manager: SyncManager,
    auth: AuthContext,
    local: NodeDescriptor,
    state: BootstrapState,
    challenge: Option<Vec<u8>>,
    transaction_id: TransactionId,
    remote_node_id: Option<NodeId>,
    assigned: Option<NodeId>,
    error: Option<SyncError>,
}

impl BootstrapChannelHandler {
    pub fn new(manager: SyncManager, auth: AuthContext, local: NodeDescriptor) -> Self {
        let transaction_id = manager.rpc().next_transaction_id();
        Self {
            manager,
            auth,
            local,
            state: BootstrapState::Init,
            challenge: None,
            transaction_id,
            remote_node_id: None,
            assigned: None,
            error: None,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Node id assigned by the seed, if it assigned a new one
    pub fn assigned_node_id(&self) -> Option<NodeId> {
        self.assigned
    }

    async fn open(&mut self, channel: &mut Channel) -> SyncResult<()> {
        self.challenge =
            send_client_hello(channel, &self.auth, self.local.node_id, self.transaction_id).await?;
        self.state = BootstrapState::HelloSent;
        Ok(())
    }

    /// Join request under its own transaction id, distinct from the hello's
    fn join_request(&self) -> SyncMessage {
        SyncMessage::ClusterJoinRequest(ClusterJoinRequestMessage {
            header: AsyncMessageHeader::new(self.manager.rpc().next_transaction_id()),
            node: self.local.clone(),
        })
    }

    fn apply_join_response(&mut self, msg: ClusterJoinResponseMessage) -> SyncResult<()> {
        let count = msg.node_store.len();
        for kv in msg.node_store {
            self.manager
                .write_sync_value(SYSTEM_NODE_STORE, &kv.key, kv.values)?;
        }
        debug!("Merged {} node store entries from seed", count);

        if let Some(node_id) = msg.new_node_id {
            let unsync = self.manager.store_handle(SYSTEM_UNSYNC_STORE)?;
            unsync.put_with_retry(
                &encode_key(&unsync_keys::LOCAL_NODE_ID.to_string())?,
                Some(encode_value(&node_id.to_string())?),
                node_id,
            )?;
            self.assigned = Some(node_id);
        }
        Ok(())
    }

    async fn fail(&mut self, channel: &mut Channel, transaction_id: TransactionId, e: SyncError) -> SyncResult<()> {
        self.state = BootstrapState::Failed;
        if channel.is_open() {
            let _ = channel
                .send(&SyncMessage::error(transaction_id, e.code(), e.to_string()))
                .await;
        }
        channel.disconnect();
        let message = e.to_string();
        self.error = Some(e);
        Err(SyncError::Protocol(message))
    }
}

#[async_trait]
impl RpcChannelHandler for BootstrapChannelHandler {
    fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            BootstrapState::JoinRequested | BootstrapState::Joined
        )
    }

    async fn handle_hello(&mut self, msg: HelloMessage, channel: &mut Channel) -> SyncResult<()> {
        if self.state != BootstrapState::HelloSent {
            return Err(SyncError::Protocol("Unexpected HELLO".to_string()));
        }
        self.remote_node_id = msg.node_id;
        if let Err(e) = finish_client_handshake(
            channel,
            &self.auth,
            self.challenge.as_deref(),
            &msg,
            self.transaction_id,
        )
        .await
        {
            self.state = BootstrapState::Failed;
            return Err(e);
        }

        channel.send(&self.join_request()).await?;
        self.state = BootstrapState::JoinRequested;
        Ok(())
    }

    async fn handle_cluster_join_response(
        &mut self,
        msg: ClusterJoinResponseMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        let transaction_id = msg.header.transaction_id;
        match self.apply_join_response(msg) {
            Ok(()) => {
                self.state = BootstrapState::Joined;
                info!(
                    "Joined cluster through node {:?} at {}",
                    self.remote_node_id,
                    channel.peer()
                );
                channel.disconnect();
                Ok(())
            }
            Err(e) => self.fail(channel, transaction_id, e).await,
        }
    }

    async fn handle_error(&mut self, msg: ErrorMessage, channel: &mut Channel) -> SyncResult<()> {
        warn!(
            "Seed {} refused bootstrap (txn {}): {}",
            channel.peer(),
            msg.header.transaction_id,
            msg.message
        );
        self.state = BootstrapState::Failed;
        self.error = Some(SyncError::from_remote(msg.code, msg.message));
        channel.disconnect();
        Ok(())
    }
}

/// Run the join exchange against `seed`. Returns the node id the seed
/// assigned, or `None` when it confirmed the one we sent.
pub async fn bootstrap(
    manager: &SyncManager,
    seed: &str,
    auth: AuthContext,
    local: NodeDescriptor,
) -> SyncResult<Option<NodeId>> {
    debug!("Bootstrapping against {}", seed);
    let mut channel = Channel::connect(seed).await?;
    let mut handler = BootstrapChannelHandler::new(manager.clone(), auth, local);
    handler.open(&mut channel).await?;

    let result = run_channel(&mut handler, &mut channel).await;
    match handler.state {
        BootstrapState::Joined => Ok(handler.assigned),
        _ => Err(handler
            .error
            .take()
            .or_else(|| result.err())
            .unwrap_or_else(|| {
                SyncError::Protocol(format!("{} closed the connection during bootstrap", seed))
            })),
    }
}

/// Try each seed in turn until one accepts the join
pub async fn bootstrap_seeds(
    manager: &SyncManager,
    seeds: &[String],
    auth: &AuthContext,
    local: &NodeDescriptor,
) -> SyncResult<Option<NodeId>> {
    let mut last = SyncError::Config("No seeds configured".to_string());
    for seed in seeds {
        let attempt = tokio::time::timeout(
            BOOTSTRAP_TIMEOUT,
            bootstrap(manager, seed, auth.clone(), local.clone()),
        )
        .await;
        match attempt {
            Ok(Ok(assigned)) => return Ok(assigned),
            Ok(Err(e)) => {
                debug!("Bootstrap against {} failed: {}", seed, e);
                last = e;
            }
            Err(_) => {
                debug!("Bootstrap against {} timed out", seed);
                last = SyncError::Timeout(format!("bootstrap against {}", seed));
            }
        }
    }
    Err(last)
}

/// Pick an id in `1..i16::MAX` not used by any of `taken`
pub fn allocate_node_id(taken: &HashSet<NodeId>) -> SyncResult<NodeId> {
    if taken.len() >= (i16::MAX as usize - 1) {
        return Err(SyncError::Config("No node ids left".to_string()));
    }
    let mut rng = rand::thread_rng();
    loop {
        let candidate: NodeId = rng.gen_range(1..i16::MAX);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Write `node` into the system node store as `as_node`
pub(crate) fn write_node_entry(manager: &SyncManager, node: &ClusterNode, as_node: NodeId) -> SyncResult<()> {
    let store = manager.store_handle(SYSTEM_NODE_STORE)?;
    store.put_with_retry(
        &encode_key(&node.node_id)?,
        Some(encode_value(node)?),
        as_node,
    )?;
    Ok(())
}

/// Serve a join request on a node that is already part of the cluster.
///
/// A descriptor carrying an id keeps it; otherwise a node already
/// registered at the same address gets its old id back and anything else
/// gets a fresh random one. Returns the node store snapshot and the id if
/// it was assigned here.
pub fn process_join_request(
    manager: &SyncManager,
    node: NodeDescriptor,
) -> SyncResult<(Vec<KeyedValues>, Option<NodeId>)> {
    let config = manager.cluster_config();
    if config.is_unassigned() {
        return Err(SyncError::Config(
            "This node has not joined a cluster yet".to_string(),
        ));
    }

    let nodes = manager.get_store_client::<NodeId, ClusterNode>(SYSTEM_NODE_STORE)?;
    let existing: Vec<ClusterNode> = nodes.entries()?.into_iter().filter_map(|(_, v)| v.into_value()).collect();

    let rejoining = node.node_id.filter(|id| is_assigned(*id)).is_some();
    let (node_id, new_node_id) = match node.node_id.filter(|id| is_assigned(*id)) {
        Some(id) => (id, None),
        None => {
            let same_address = existing
                .iter()
                .find(|n| n.hostname == node.hostname && n.port == node.port);
            let id = match same_address {
                Some(n) => n.node_id,
                None => {
                    let taken: HashSet<NodeId> = existing.iter().map(|n| n.node_id).collect();
                    allocate_node_id(&taken)?
                }
            };
            (id, Some(id))
        }
    };
    let domain_id = node.domain_id.filter(|d| is_assigned(*d)).unwrap_or(node_id);

    let entry = ClusterNode::new(node.hostname, node.port, node_id, domain_id);
    // a rejoining node deleted its own entry; the delete may not have reached us yet
    if rejoining || !existing.contains(&entry) {
        write_node_entry(manager, &entry, config.local_node_id())?;
    }
    info!("Admitted {} into the cluster", entry);

    let snapshot = manager
        .store_handle(SYSTEM_NODE_STORE)?
        .engine()
        .entries()?
        .into_iter()
        .map(KeyedValues::from)
        .collect();
    Ok((snapshot, new_node_id))
}
