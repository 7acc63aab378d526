//! Channel handling shared by every RPC endpoint
//!
//! A [`Channel`] is one framed TCP connection. An [`RpcChannelHandler`]
//! implements the `handle_*` methods for the messages it expects; anything
//! else is answered with an Error envelope echoing the transaction id.
//! Authentication failures are the exception: they close the channel.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::auth::AuthContext;
use super::codec::{read_magic, read_message, write_magic, write_message};
use super::protocol::*;
use crate::cluster::node::NodeId;
use crate::error::{SyncError, SyncResult};

/// Time allowed for a peer to send the protocol header
const MAGIC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Channel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer: String,
    open: bool,
}

impl Channel {
    /// Dial `addr` and send the protocol header
    pub async fn connect(addr: &str) -> SyncResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut channel = Self::from_stream(stream, addr.to_string());
        write_magic(&mut channel.writer).await?;
        Ok(channel)
    }

    /// Wrap an accepted connection after checking its protocol header
    pub async fn accept(stream: TcpStream) -> SyncResult<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream.set_nodelay(true)?;
        let mut channel = Self::from_stream(stream, peer);
        tokio::time::timeout(MAGIC_TIMEOUT, read_magic(&mut channel.reader))
            .await
            .map_err(|_| SyncError::Timeout(format!("protocol header from {}", channel.peer)))??;
        Ok(channel)
    }

    fn from_stream(stream: TcpStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            peer,
            open: true,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Stop processing; the socket closes when the channel is dropped
    pub fn disconnect(&mut self) {
        self.open = false;
    }

    pub async fn send(&mut self, msg: &SyncMessage) -> SyncResult<()> {
        write_message(&mut self.writer, msg).await
    }

    pub async fn receive(&mut self) -> SyncResult<SyncMessage> {
        read_message(&mut self.reader).await
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}

fn unexpected(msg_type: &str) -> SyncResult<()> {
    Err(SyncError::Protocol(format!("Unexpected message {}", msg_type)))
}

/// Per-message callbacks for one side of a channel.
///
/// Every method has a default that rejects the message, so handlers only
/// implement what their role receives.
#[async_trait]
pub trait RpcChannelHandler: Send {
    /// Whether data-bearing messages may be processed
    fn is_authenticated(&self) -> bool;

    fn on_disconnect(&mut self) {}

    async fn handle_hello(&mut self, _msg: HelloMessage, _channel: &mut Channel) -> SyncResult<()> {
        unexpected("HELLO")
    }

    async fn handle_auth_response(
        &mut self,
        _msg: AuthResponseMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("AUTH_RESPONSE")
    }

    async fn handle_cluster_join_request(
        &mut self,
        _msg: ClusterJoinRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("CLUSTER_JOIN_REQUEST")
    }

    async fn handle_cluster_join_response(
        &mut self,
        _msg: ClusterJoinResponseMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("CLUSTER_JOIN_RESPONSE")
    }

    async fn handle_sync_value(
        &mut self,
        _msg: SyncValueMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("SYNC_VALUE")
    }

    async fn handle_sync_value_response(
        &mut self,
        msg: SyncValueResponseMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        debug!(
            "Peer applied {} values (txn {})",
            msg.count, msg.header.transaction_id
        );
        Ok(())
    }

    async fn handle_error(&mut self, msg: ErrorMessage, channel: &mut Channel) -> SyncResult<()> {
        warn!(
            "Error from {} (txn {}, {:?}): {}",
            channel.peer(),
            msg.header.transaction_id,
            msg.code,
            msg.message
        );
        Ok(())
    }

    async fn handle_leader_cand(
        &mut self,
        _msg: LeaderCandMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("LEADER_CAND")
    }

    async fn handle_leader(&mut self, _msg: LeaderMessage, _channel: &mut Channel) -> SyncResult<()> {
        unexpected("LEADER")
    }

    async fn handle_leader_ack(
        &mut self,
        _msg: LeaderAckMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("LEADER_ACK")
    }

    async fn handle_get_request(
        &mut self,
        _msg: GetRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("GET_REQUEST")
    }

    async fn handle_put_request(
        &mut self,
        _msg: PutRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("PUT_REQUEST")
    }

    async fn handle_entries_request(
        &mut self,
        _msg: EntriesRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("ENTRIES_REQUEST")
    }

    async fn handle_cluster_info_request(
        &mut self,
        _msg: ClusterInfoRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("CLUSTER_INFO_REQUEST")
    }

    async fn handle_new_election_request(
        &mut self,
        _msg: NewElectionRequestMessage,
        _channel: &mut Channel,
    ) -> SyncResult<()> {
        unexpected("NEW_ELECTION_REQUEST")
    }

    /// Responses to requests this side never issues over a handler loop
    async fn handle_response(&mut self, msg: SyncMessage, _channel: &mut Channel) -> SyncResult<()> {
        unexpected(msg.type_name())
    }
}

/// Route one message to its handler method
pub async fn dispatch<H>(handler: &mut H, msg: SyncMessage, channel: &mut Channel) -> SyncResult<()>
where
    H: RpcChannelHandler + ?Sized,
{
    match msg {
        SyncMessage::Hello(m) => handler.handle_hello(m, channel).await,
        SyncMessage::AuthResponse(m) => handler.handle_auth_response(m, channel).await,
        SyncMessage::ClusterJoinRequest(m) => handler.handle_cluster_join_request(m, channel).await,
        SyncMessage::ClusterJoinResponse(m) => {
            handler.handle_cluster_join_response(m, channel).await
        }
        SyncMessage::SyncValue(m) => handler.handle_sync_value(m, channel).await,
        SyncMessage::SyncValueResponse(m) => handler.handle_sync_value_response(m, channel).await,
        SyncMessage::Error(m) => handler.handle_error(m, channel).await,
        SyncMessage::LeaderCand(m) => handler.handle_leader_cand(m, channel).await,
        SyncMessage::Leader(m) => handler.handle_leader(m, channel).await,
        SyncMessage::LeaderAck(m) => handler.handle_leader_ack(m, channel).await,
        SyncMessage::GetRequest(m) => handler.handle_get_request(m, channel).await,
        SyncMessage::PutRequest(m) => handler.handle_put_request(m, channel).await,
        SyncMessage::EntriesRequest(m) => handler.handle_entries_request(m, channel).await,
        SyncMessage::ClusterInfoRequest(m) => handler.handle_cluster_info_request(m, channel).await,
        SyncMessage::NewElectionRequest(m) => handler.handle_new_election_request(m, channel).await,
        msg @ (SyncMessage::GetResponse(_)
        | SyncMessage::PutResponse(_)
        | SyncMessage::EntriesResponse(_)
        | SyncMessage::ClusterInfoResponse(_)
        | SyncMessage::NewElectionResponse(_)) => handler.handle_response(msg, channel).await,
    }
}

/// Read and dispatch messages until the channel closes.
///
/// Processing errors become Error envelopes and the loop continues.
/// Authentication errors, and data sent before authentication, close the
/// channel and are returned.
pub async fn run_channel<H>(handler: &mut H, channel: &mut Channel) -> SyncResult<()>
where
    H: RpcChannelHandler + ?Sized,
{
    let result = channel_loop(handler, channel).await;
    handler.on_disconnect();
    result
}

async fn channel_loop<H>(handler: &mut H, channel: &mut Channel) -> SyncResult<()>
where
    H: RpcChannelHandler + ?Sized,
{
    while channel.is_open() {
        let msg = match channel.receive().await {
            Ok(msg) => msg,
            Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Channel to {} closed by peer", channel.peer());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let transaction_id = msg.transaction_id();
        let msg_type = msg.type_name();

        if !msg.is_handshake() && !handler.is_authenticated() {
            let err = SyncError::Auth(format!("{} received before authentication", msg_type));
            let _ = channel
                .send(&SyncMessage::error(transaction_id, ErrorCode::Auth, err.to_string()))
                .await;
            channel.disconnect();
            return Err(err);
        }

        if let Err(e) = dispatch(handler, msg, channel).await {
            if matches!(e, SyncError::Auth(_)) {
                warn!("Authentication with {} failed: {}", channel.peer(), e);
                let _ = channel
                    .send(&SyncMessage::error(transaction_id, ErrorCode::Auth, e.to_string()))
                    .await;
                channel.disconnect();
                return Err(e);
            }
            debug!(
                "Failed to process {} from {}: {}",
                msg_type,
                channel.peer(),
                e
            );
            if channel.is_open() {
                channel
                    .send(&SyncMessage::error(transaction_id, e.code(), e.to_string()))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Open the handshake as the dialling side. Returns our challenge, if any.
pub async fn send_client_hello(
    channel: &mut Channel,
    auth: &AuthContext,
    node_id: Option<NodeId>,
    transaction_id: TransactionId,
) -> SyncResult<Option<Vec<u8>>> {
    let challenge = auth.requires_auth().then(|| auth.new_challenge());
    let hello = HelloMessage {
        header: AsyncMessageHeader::new(transaction_id),
        node_id,
        auth: challenge.as_ref().map(|c| AuthChallengeResponse {
            challenge: Some(c.clone()),
            response: None,
        }),
    };
    channel.send(&SyncMessage::Hello(hello)).await?;
    Ok(challenge)
}

/// Check the responder's Hello and answer its challenge
pub async fn finish_client_handshake(
    channel: &mut Channel,
    auth: &AuthContext,
    challenge: Option<&[u8]>,
    hello: &HelloMessage,
    transaction_id: TransactionId,
) -> SyncResult<()> {
    let Some(challenge) = challenge else {
        return Ok(());
    };
    let peer_auth = hello
        .auth
        .as_ref()
        .ok_or_else(|| SyncError::Auth(format!("{} did not authenticate", channel.peer())))?;
    let response = peer_auth
        .response
        .as_deref()
        .ok_or_else(|| SyncError::Auth(format!("{} sent no challenge response", channel.peer())))?;
    if !auth.verify(challenge, response) {
        return Err(SyncError::Auth(format!(
            "{} failed the challenge",
            channel.peer()
        )));
    }
    let their_challenge = peer_auth
        .challenge
        .as_deref()
        .ok_or_else(|| SyncError::Auth(format!("{} sent no challenge", channel.peer())))?;
    let msg = SyncMessage::AuthResponse(AuthResponseMessage {
        header: AsyncMessageHeader::new(transaction_id),
        response: auth.respond(their_challenge)?,
    });
    channel.send(&msg).await
}

/// Complete handshake as the dialling side; returns the peer's node id
pub async fn client_handshake(
    channel: &mut Channel,
    auth: &AuthContext,
    node_id: Option<NodeId>,
    transaction_id: TransactionId,
) -> SyncResult<Option<NodeId>> {
    let challenge = send_client_hello(channel, auth, node_id, transaction_id).await?;
    match channel.receive().await? {
        SyncMessage::Hello(hello) => {
            finish_client_handshake(channel, auth, challenge.as_deref(), &hello, transaction_id)
                .await?;
            Ok(hello.node_id)
        }
        SyncMessage::Error(e) => Err(SyncError::from_remote(e.code, e.message)),
        other => Err(SyncError::Protocol(format!(
            "Expected HELLO, got {}",
            other.type_name()
        ))),
    }
}
