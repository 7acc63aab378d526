//! Node-to-node connectivity
//!
//! The [`RpcService`] owns the listening socket and one outbound
//! connection task per peer in the current [`ClusterConfig`]. Outbound
//! connections carry replication and election traffic; inbound ones are
//! served by [`NodeChannelHandler`]. Each peer has its own bounded queue,
//! so a slow or unreachable peer never holds up the others.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::auth::AuthContext;
use super::codec::{read_message, write_message};
use super::handler::{client_handshake, run_channel, Channel};
use super::protocol::SyncMessage;
use super::server::NodeChannelHandler;
use crate::cluster::config::ClusterConfig;
use crate::cluster::node::{ClusterNode, NodeId};
use crate::error::{SyncError, SyncResult};
use crate::sync::manager::SyncManager;

/// First reconnect delay; doubles up to the configured maximum
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

struct PeerHandle {
    node: ClusterNode,
    tx: mpsc::Sender<SyncMessage>,
    task: JoinHandle<()>,
}

struct ListenerHandle {
    address: String,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct RpcInner {
    transaction_id: AtomicU32,
    peers: Mutex<std::collections::HashMap<NodeId, PeerHandle>>,
    connected: DashMap<NodeId, ()>,
    listener: Mutex<Option<ListenerHandle>>,
    auth: RwLock<AuthContext>,
    queue_capacity: usize,
    reconnect_max: Duration,
}

#[derive(Clone)]
pub struct RpcService {
    inner: Arc<RpcInner>,
}

impl RpcService {
    pub fn new(queue_capacity: usize, reconnect_max: Duration) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                transaction_id: AtomicU32::new(1),
                peers: Mutex::new(std::collections::HashMap::new()),
                connected: DashMap::new(),
                listener: Mutex::new(None),
                auth: RwLock::new(AuthContext::none()),
                queue_capacity: queue_capacity.max(1),
                reconnect_max,
            }),
        }
    }

    /// Allocate a transaction id for an outgoing request
    pub fn next_transaction_id(&self) -> u32 {
        self.inner.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn auth(&self) -> AuthContext {
        self.inner.auth.read().clone()
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.inner.connected.contains_key(&node_id)
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.connected.iter().map(|e| *e.key()).collect();
        nodes.sort_unstable();
        nodes
    }

    /// Queue `msg` for `node_id` without waiting. Returns false when the
    /// node is unknown, not connected, or its queue is full.
    pub fn write_to_node(&self, node_id: NodeId, msg: SyncMessage) -> bool {
        if !self.is_connected(node_id) {
            return false;
        }
        let peers = self.inner.peers.lock();
        let Some(peer) = peers.get(&node_id) else {
            return false;
        };
        match peer.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Queue to node {} is full, dropping message", node_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue `msg` for every connected peer; returns how many accepted it
    pub fn broadcast(&self, msg: &SyncMessage) -> usize {
        let targets: Vec<NodeId> = self.inner.peers.lock().keys().copied().collect();
        targets
            .into_iter()
            .filter(|node_id| self.write_to_node(*node_id, msg.clone()))
            .count()
    }

    /// Align listener and peer connections with `config`
    pub async fn reconfigure(&self, manager: &SyncManager, config: &ClusterConfig) -> SyncResult<()> {
        let auth = match AuthContext::from_settings(
            config.auth_scheme(),
            config.keystore_path(),
            config.keystore_password(),
        ) {
            Ok(auth) => auth,
            Err(e) => {
                error!("Cannot load authentication settings: {}", e);
                AuthContext::without_secret(config.auth_scheme())
            }
        };
        *self.inner.auth.write() = auth;

        self.ensure_listener(manager, &config.listen_address()).await?;

        // Without an id the node only answers administrative requests
        if config.is_unassigned() {
            self.disconnect_all();
            return Ok(());
        }

        let local_id = config.local_node_id();
        let wanted: Vec<ClusterNode> = config.peers().cloned().collect();
        let wanted_ids: HashSet<NodeId> = wanted.iter().map(|n| n.node_id).collect();

        let mut peers = self.inner.peers.lock();
        let stale: Vec<NodeId> = peers
            .iter()
            .filter(|(id, handle)| {
                !wanted_ids.contains(id)
                    || wanted
                        .iter()
                        .any(|n| n.node_id == **id && n.address() != handle.node.address())
            })
            .map(|(id, _)| *id)
            .collect();
        for node_id in stale {
            if let Some(handle) = peers.remove(&node_id) {
                info!("Disconnecting from {}", handle.node);
                handle.task.abort();
                self.inner.connected.remove(&node_id);
            }
        }

        for node in wanted {
            if peers.contains_key(&node.node_id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
            let task = tokio::spawn(run_peer(
                self.clone(),
                manager.clone(),
                node.clone(),
                local_id,
                rx,
            ));
            peers.insert(node.node_id, PeerHandle { node, tx, task });
        }
        Ok(())
    }

    async fn ensure_listener(&self, manager: &SyncManager, address: &str) -> SyncResult<()> {
        if let Some(current) = self.inner.listener.lock().as_ref() {
            if current.address == address {
                return Ok(());
            }
        }
        self.stop_listener();

        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!("RPC service listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(listener, self.clone(), manager.clone()));
        *self.inner.listener.lock() = Some(ListenerHandle {
            address: address.to_string(),
            local_addr,
            task,
        });
        Ok(())
    }

    fn stop_listener(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.task.abort();
            debug!("Stopped listening on {}", listener.local_addr);
        }
    }

    fn disconnect_all(&self) {
        for (_, handle) in self.inner.peers.lock().drain() {
            handle.task.abort();
        }
        self.inner.connected.clear();
    }

    fn set_connected(&self, node_id: NodeId, connected: bool) {
        if connected {
            self.inner.connected.insert(node_id, ());
        } else {
            self.inner.connected.remove(&node_id);
        }
    }

    pub async fn shutdown(&self) {
        self.stop_listener();
        self.disconnect_all();
        info!("RPC service stopped");
    }
}

async fn accept_loop(listener: TcpListener, service: RpcService, manager: SyncManager) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let auth = service.auth();
                let manager = manager.clone();
                tokio::spawn(async move {
                    let mut channel = match Channel::accept(stream).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            debug!("Rejected connection from {}: {}", addr, e);
                            return;
                        }
                    };
                    let mut handler = NodeChannelHandler::new(manager, auth);
                    if let Err(e) = run_channel(&mut handler, &mut channel).await {
                        debug!("Channel from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(INITIAL_BACKOFF).await;
            }
        }
    }
}

/// Keep one authenticated outbound connection to `node` alive
async fn run_peer(
    service: RpcService,
    manager: SyncManager,
    node: ClusterNode,
    local_id: NodeId,
    mut rx: mpsc::Receiver<SyncMessage>,
) {
    let mut delay = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match connect_peer(&service, &node, local_id).await {
            Ok(channel) => {
                delay = INITIAL_BACKOFF;
                attempt = 0;
                info!("Connected to {}", node);
                service.set_connected(node.node_id, true);
                manager.on_peer_connection_change(node.node_id, true);

                let closed = serve_peer(&manager, &node, channel, &mut rx).await;

                service.set_connected(node.node_id, false);
                manager.on_peer_connection_change(node.node_id, false);
                match closed {
                    Ok(true) => {
                        debug!("Peer task for {} finished", node);
                        return;
                    }
                    Ok(false) => info!("Disconnected from {}", node),
                    Err(e) => warn!("Connection to {} lost: {}", node, e),
                }
            }
            Err(SyncError::Auth(e)) => warn!("Authentication with {} failed: {}", node, e),
            Err(e) => {
                if attempt == 1 || attempt % 20 == 0 {
                    debug!("Connection attempt {} to {} failed: {}", attempt, node, e);
                }
            }
        }
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, service.inner.reconnect_max);
    }
}

async fn connect_peer(service: &RpcService, node: &ClusterNode, local_id: NodeId) -> SyncResult<Channel> {
    let mut channel = Channel::connect(&node.address()).await?;
    let auth = service.auth();
    let remote = client_handshake(&mut channel, &auth, Some(local_id), service.next_transaction_id()).await?;
    if let Some(remote) = remote {
        if remote != node.node_id {
            return Err(SyncError::Protocol(format!(
                "{} answered as node {}",
                node.address(),
                remote
            )));
        }
    }
    Ok(channel)
}

/// Push a full snapshot, then forward queued messages until either side
/// closes. Returns `Ok(true)` when the queue itself was closed.
async fn serve_peer(
    manager: &SyncManager,
    node: &ClusterNode,
    channel: Channel,
    rx: &mut mpsc::Receiver<SyncMessage>,
) -> SyncResult<bool> {
    let peer = channel.peer().to_string();
    let (mut reader, mut writer) = channel.into_split();

    let mut replies = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(SyncMessage::Error(e)) => warn!(
                    "Error from {} (txn {}, {:?}): {}",
                    peer, e.header.transaction_id, e.code, e.message
                ),
                Ok(SyncMessage::SyncValueResponse(r)) => {
                    debug!("{} applied {} values", peer, r.count)
                }
                Ok(other) => debug!("Ignoring {} from {}", other.type_name(), peer),
                Err(e) => return e,
            }
        }
    });

    let result: SyncResult<bool> = async {
        for msg in manager.full_sync_messages()? {
            write_message(&mut writer, &msg).await?;
        }
        debug!("Full sync pushed to {}", node);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => write_message(&mut writer, &msg).await?,
                    None => return Ok(true),
                },
                ended = &mut replies => {
                    return match ended {
                        Ok(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
                        Ok(e) => Err(e),
                        Err(e) => Err(SyncError::Internal(e.to_string())),
                    };
                }
            }
        }
    }
    .await;

    replies.abort();
    result
}
