//! Wire messages exchanged between nodes
//!
//! Every message carries an [`AsyncMessageHeader`]. Requests allocate a
//! fresh transaction id and responses (including Error envelopes) echo it.
//! Messages are encoded with bincode by [`super::codec`].

use serde::{Deserialize, Serialize};

use crate::cluster::node::{ClusterNode, DomainId, NodeId};
use crate::storage::{RawVersioned, StoreEntry};
use crate::sync::byte_array::ByteArray;
use crate::sync::vector_clock::VectorClock;

pub type TransactionId = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AsyncMessageHeader {
    pub transaction_id: TransactionId,
}

impl AsyncMessageHeader {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self { transaction_id }
    }
}

/// Error kinds carried in an Error envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    ObsoleteVersion,
    Auth,
    UnknownStore,
    Protocol,
    Config,
}

/// A key with all versions held for it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyedValues {
    pub key: ByteArray,
    pub values: Vec<RawVersioned>,
}

impl KeyedValues {
    pub fn new(key: ByteArray, values: Vec<RawVersioned>) -> Self {
        Self { key, values }
    }
}

impl From<StoreEntry> for KeyedValues {
    fn from((key, values): StoreEntry) -> Self {
        KeyedValues { key, values }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthChallengeResponse {
    #[serde(with = "serde_bytes")]
    pub challenge: Option<Vec<u8>>,
    #[serde(with = "serde_bytes")]
    pub response: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub header: AsyncMessageHeader,
    pub node_id: Option<NodeId>,
    pub auth: Option<AuthChallengeResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponseMessage {
    pub header: AsyncMessageHeader,
    #[serde(with = "serde_bytes")]
    pub response: Vec<u8>,
}

/// Identity a node presents when it asks to join
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub hostname: String,
    pub port: u16,
    pub node_id: Option<NodeId>,
    pub domain_id: Option<DomainId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterJoinRequestMessage {
    pub header: AsyncMessageHeader,
    pub node: NodeDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterJoinResponseMessage {
    pub header: AsyncMessageHeader,
    pub node_store: Vec<KeyedValues>,
    pub new_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncValueMessage {
    pub header: AsyncMessageHeader,
    pub store: String,
    pub values: Vec<KeyedValues>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncValueResponseMessage {
    pub header: AsyncMessageHeader,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub header: AsyncMessageHeader,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderCandMessage {
    pub header: AsyncMessageHeader,
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub weight: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderMessage {
    pub header: AsyncMessageHeader,
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub weight: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderAckMessage {
    pub header: AsyncMessageHeader,
    pub node_id: NodeId,
    pub domain_id: DomainId,
    pub leader_node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequestMessage {
    pub header: AsyncMessageHeader,
    pub store: String,
    pub key: ByteArray,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponseMessage {
    pub header: AsyncMessageHeader,
    pub values: Vec<RawVersioned>,
}

/// Remote write; `value: None` deletes. Without a version the serving node
/// builds on its current versions and retries obsolete attempts itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequestMessage {
    pub header: AsyncMessageHeader,
    pub store: String,
    pub key: ByteArray,
    #[serde(with = "serde_bytes")]
    pub value: Option<Vec<u8>>,
    pub version: Option<VectorClock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponseMessage {
    pub header: AsyncMessageHeader,
    pub version: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesRequestMessage {
    pub header: AsyncMessageHeader,
    pub store: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesResponseMessage {
    pub header: AsyncMessageHeader,
    pub entries: Vec<KeyedValues>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfoRequestMessage {
    pub header: AsyncMessageHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfoResponseMessage {
    pub header: AsyncMessageHeader,
    pub local_node_id: NodeId,
    pub domain_leader: Option<NodeId>,
    pub nodes: Vec<ClusterNode>,
    pub connected: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewElectionRequestMessage {
    pub header: AsyncMessageHeader,
    pub rigged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewElectionResponseMessage {
    pub header: AsyncMessageHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    Hello(HelloMessage),
    AuthResponse(AuthResponseMessage),
    ClusterJoinRequest(ClusterJoinRequestMessage),
    ClusterJoinResponse(ClusterJoinResponseMessage),
    SyncValue(SyncValueMessage),
    SyncValueResponse(SyncValueResponseMessage),
    Error(ErrorMessage),
    LeaderCand(LeaderCandMessage),
    Leader(LeaderMessage),
    LeaderAck(LeaderAckMessage),
    GetRequest(GetRequestMessage),
    GetResponse(GetResponseMessage),
    PutRequest(PutRequestMessage),
    PutResponse(PutResponseMessage),
    EntriesRequest(EntriesRequestMessage),
    EntriesResponse(EntriesResponseMessage),
    ClusterInfoRequest(ClusterInfoRequestMessage),
    ClusterInfoResponse(ClusterInfoResponseMessage),
    NewElectionRequest(NewElectionRequestMessage),
    NewElectionResponse(NewElectionResponseMessage),
}

impl SyncMessage {
    pub fn header(&self) -> &AsyncMessageHeader {
        match self {
            SyncMessage::Hello(m) => &m.header,
            SyncMessage::AuthResponse(m) => &m.header,
            SyncMessage::ClusterJoinRequest(m) => &m.header,
            SyncMessage::ClusterJoinResponse(m) => &m.header,
            SyncMessage::SyncValue(m) => &m.header,
            SyncMessage::SyncValueResponse(m) => &m.header,
            SyncMessage::Error(m) => &m.header,
            SyncMessage::LeaderCand(m) => &m.header,
            SyncMessage::Leader(m) => &m.header,
            SyncMessage::LeaderAck(m) => &m.header,
            SyncMessage::GetRequest(m) => &m.header,
            SyncMessage::GetResponse(m) => &m.header,
            SyncMessage::PutRequest(m) => &m.header,
            SyncMessage::PutResponse(m) => &m.header,
            SyncMessage::EntriesRequest(m) => &m.header,
            SyncMessage::EntriesResponse(m) => &m.header,
            SyncMessage::ClusterInfoRequest(m) => &m.header,
            SyncMessage::ClusterInfoResponse(m) => &m.header,
            SyncMessage::NewElectionRequest(m) => &m.header,
            SyncMessage::NewElectionResponse(m) => &m.header,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.header().transaction_id
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "HELLO",
            SyncMessage::AuthResponse(_) => "AUTH_RESPONSE",
            SyncMessage::ClusterJoinRequest(_) => "CLUSTER_JOIN_REQUEST",
            SyncMessage::ClusterJoinResponse(_) => "CLUSTER_JOIN_RESPONSE",
            SyncMessage::SyncValue(_) => "SYNC_VALUE",
            SyncMessage::SyncValueResponse(_) => "SYNC_VALUE_RESPONSE",
            SyncMessage::Error(_) => "ERROR",
            SyncMessage::LeaderCand(_) => "LEADER_CAND",
            SyncMessage::Leader(_) => "LEADER",
            SyncMessage::LeaderAck(_) => "LEADER_ACK",
            SyncMessage::GetRequest(_) => "GET_REQUEST",
            SyncMessage::GetResponse(_) => "GET_RESPONSE",
            SyncMessage::PutRequest(_) => "PUT_REQUEST",
            SyncMessage::PutResponse(_) => "PUT_RESPONSE",
            SyncMessage::EntriesRequest(_) => "ENTRIES_REQUEST",
            SyncMessage::EntriesResponse(_) => "ENTRIES_RESPONSE",
            SyncMessage::ClusterInfoRequest(_) => "CLUSTER_INFO_REQUEST",
            SyncMessage::ClusterInfoResponse(_) => "CLUSTER_INFO_RESPONSE",
            SyncMessage::NewElectionRequest(_) => "NEW_ELECTION_REQUEST",
            SyncMessage::NewElectionResponse(_) => "NEW_ELECTION_RESPONSE",
        }
    }

    /// Messages allowed before the handshake has authenticated the peer
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            SyncMessage::Hello(_) | SyncMessage::AuthResponse(_) | SyncMessage::Error(_)
        )
    }

    pub fn error(transaction_id: TransactionId, code: ErrorCode, message: impl Into<String>) -> Self {
        SyncMessage::Error(ErrorMessage {
            header: AsyncMessageHeader::new(transaction_id),
            code,
            message: message.into(),
        })
    }
}
