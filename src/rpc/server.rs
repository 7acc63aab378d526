use async_trait::async_trait;
use tracing::{debug, info};

use super::auth::AuthContext;
use super::handler::{Channel, RpcChannelHandler};
use super::protocol::*;
use crate::cluster::bootstrap::process_join_request;
use crate::cluster::node::NodeId;
use crate::error::{SyncError, SyncResult};
use crate::storage::StorageEngine;
use crate::sync::manager::SyncManager;

/// Handler for connections accepted by a node
pub struct NodeChannelHandler {
    manager: SyncManager,
    auth: AuthContext,
    challenge: Option<Vec<u8>>,
    authenticated: bool,
    remote_node_id: Option<NodeId>,
}

impl NodeChannelHandler {
    pub fn new(manager: SyncManager, auth: AuthContext) -> Self {
        Self {
            manager,
            auth,
            challenge: None,
            authenticated: false,
            remote_node_id: None,
        }
    }

    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.remote_node_id
    }
}

#[async_trait]
impl RpcChannelHandler for NodeChannelHandler {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn on_disconnect(&mut self) {
        if let Some(node_id) = self.remote_node_id {
            debug!("Inbound channel from node {} closed", node_id);
        }
    }

    async fn handle_hello(&mut self, msg: HelloMessage, channel: &mut Channel) -> SyncResult<()> {
        self.remote_node_id = msg.node_id;
        let local = self.manager.cluster_config().local_node_id();

        let auth = if self.auth.requires_auth() {
            let their = msg
                .auth
                .and_then(|a| a.challenge)
                .ok_or_else(|| SyncError::Auth(format!("{} offered no challenge", channel.peer())))?;
            let response = self.auth.respond(&their)?;
            let challenge = self.auth.new_challenge();
            self.challenge = Some(challenge.clone());
            Some(AuthChallengeResponse {
                challenge: Some(challenge),
                response: Some(response),
            })
        } else {
            self.authenticated = true;
            None
        };

        let reply = SyncMessage::Hello(HelloMessage {
            header: msg.header,
            node_id: Some(local),
            auth,
        });
        channel.send(&reply).await
    }

    async fn handle_auth_response(
        &mut self,
        msg: AuthResponseMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        let challenge = self
            .challenge
            .take()
            .ok_or_else(|| SyncError::Auth("Unsolicited authentication response".to_string()))?;
        if !self.auth.verify(&challenge, &msg.response) {
            return Err(SyncError::Auth(format!(
                "{} failed the challenge",
                channel.peer()
            )));
        }
        self.authenticated = true;
        debug!("Authenticated {}", channel.peer());
        Ok(())
    }

    async fn handle_cluster_join_request(
        &mut self,
        msg: ClusterJoinRequestMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        info!("Join request from {} ({}:{})", channel.peer(), msg.node.hostname, msg.node.port);
        let (node_store, new_node_id) = process_join_request(&self.manager, msg.node)?;
        let reply = SyncMessage::ClusterJoinResponse(ClusterJoinResponseMessage {
            header: msg.header,
            node_store,
            new_node_id,
        });
        channel.send(&reply).await
    }

    async fn handle_sync_value(&mut self, msg: SyncValueMessage, channel: &mut Channel) -> SyncResult<()> {
        let count = self.manager.handle_sync_values(&msg.store, msg.values)?;
        let reply = SyncMessage::SyncValueResponse(SyncValueResponseMessage {
            header: msg.header,
            count,
        });
        channel.send(&reply).await
    }

    async fn handle_leader_cand(
        &mut self,
        msg: LeaderCandMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        self.manager
            .election()
            .on_leader_cand(msg.node_id, msg.domain_id, msg.weight);
        Ok(())
    }

    async fn handle_leader(&mut self, msg: LeaderMessage, _channel: &mut Channel) -> SyncResult<()> {
        self.manager
            .election()
            .on_leader(msg.node_id, msg.domain_id, msg.weight);
        Ok(())
    }

    async fn handle_leader_ack(
        &mut self,
        msg: LeaderAckMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        self.manager
            .election()
            .on_leader_ack(msg.node_id, msg.domain_id, msg.leader_node_id);
        Ok(())
    }

    async fn handle_get_request(&mut self, msg: GetRequestMessage, channel: &mut Channel) -> SyncResult<()> {
        let values = self.manager.store_handle(&msg.store)?.engine().get(&msg.key)?;
        let reply = SyncMessage::GetResponse(GetResponseMessage {
            header: msg.header,
            values,
        });
        channel.send(&reply).await
    }

    async fn handle_put_request(&mut self, msg: PutRequestMessage, channel: &mut Channel) -> SyncResult<()> {
        let version = self
            .manager
            .remote_put(&msg.store, &msg.key, msg.value, msg.version.as_ref())?;
        let reply = SyncMessage::PutResponse(PutResponseMessage {
            header: msg.header,
            version,
        });
        channel.send(&reply).await
    }

    async fn handle_entries_request(
        &mut self,
        msg: EntriesRequestMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        let entries = self
            .manager
            .store_handle(&msg.store)?
            .engine()
            .entries()?
            .into_iter()
            .map(KeyedValues::from)
            .collect();
        let reply = SyncMessage::EntriesResponse(EntriesResponseMessage {
            header: msg.header,
            entries,
        });
        channel.send(&reply).await
    }

    async fn handle_cluster_info_request(
        &mut self,
        msg: ClusterInfoRequestMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        let config = self.manager.cluster_config();
        let reply = SyncMessage::ClusterInfoResponse(ClusterInfoResponseMessage {
            header: msg.header,
            local_node_id: config.local_node_id(),
            domain_leader: self.manager.election().get_domain_leader(),
            nodes: config.nodes().cloned().collect(),
            connected: self.manager.rpc().connected_nodes(),
        });
        channel.send(&reply).await
    }

    async fn handle_new_election_request(
        &mut self,
        msg: NewElectionRequestMessage,
        channel: &mut Channel,
    ) -> SyncResult<()> {
        self.manager.election().new_election(msg.rigged);
        let reply = SyncMessage::NewElectionResponse(NewElectionResponseMessage { header: msg.header });
        channel.send(&reply).await
    }
}
