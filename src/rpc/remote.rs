//! Client for administrative tools talking to a running node

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

use super::auth::AuthContext;
use super::handler::{client_handshake, Channel};
use super::protocol::*;
use crate::cluster::node::NodeId;
use crate::error::{SyncError, SyncResult};
use crate::storage::RawVersioned;
use crate::sync::byte_array::{decode_key, decode_value, encode_key, encode_value, ByteArray};
use crate::sync::vector_clock::VectorClock;
use crate::sync::versioned::{resolve_last_write_wins, Versioned};

/// How long a request may wait for its response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated connection issuing requests in turn
pub struct RemoteSyncClient {
    channel: Channel,
    next_transaction_id: TransactionId,
    remote_node_id: Option<NodeId>,
}

impl RemoteSyncClient {
    pub async fn connect(addr: &str, auth: AuthContext) -> SyncResult<Self> {
        let mut channel = Channel::connect(addr).await?;
        let remote_node_id = tokio::time::timeout(
            REQUEST_TIMEOUT,
            client_handshake(&mut channel, &auth, None, 1),
        )
        .await
        .map_err(|_| SyncError::Timeout(format!("handshake with {}", addr)))??;
        debug!("Connected to node {:?} at {}", remote_node_id, addr);
        Ok(Self {
            channel,
            next_transaction_id: 2,
            remote_node_id,
        })
    }

    /// Node id announced by the server during the handshake
    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.remote_node_id
    }

    fn header(&mut self) -> AsyncMessageHeader {
        let header = AsyncMessageHeader::new(self.next_transaction_id);
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        header
    }

    async fn request(&mut self, msg: SyncMessage) -> SyncResult<SyncMessage> {
        let transaction_id = msg.transaction_id();
        self.channel.send(&msg).await?;
        let wait = async {
            loop {
                let reply = self.channel.receive().await?;
                match reply {
                    // auth failures may carry the handshake's transaction id
                    SyncMessage::Error(e) if e.code == ErrorCode::Auth => {
                        return Err(SyncError::from_remote(e.code, e.message));
                    }
                    SyncMessage::Error(e) if e.header.transaction_id == transaction_id => {
                        return Err(SyncError::from_remote(e.code, e.message));
                    }
                    reply if reply.transaction_id() == transaction_id => return Ok(reply),
                    other => debug!("Skipping unrelated {}", other.type_name()),
                }
            }
        };
        tokio::time::timeout(REQUEST_TIMEOUT, wait)
            .await
            .map_err(|_| SyncError::Timeout(format!("{} request", msg.type_name())))?
    }

    pub async fn get(&mut self, store: &str, key: &ByteArray) -> SyncResult<Vec<RawVersioned>> {
        let msg = SyncMessage::GetRequest(GetRequestMessage {
            header: self.header(),
            store: store.to_string(),
            key: key.clone(),
        });
        match self.request(msg).await? {
            SyncMessage::GetResponse(r) => Ok(r.values),
            other => Err(unexpected(other)),
        }
    }

    /// Write `value` (`None` deletes). Without a base version the server
    /// writes on top of whatever it holds.
    pub async fn put(
        &mut self,
        store: &str,
        key: &ByteArray,
        value: Option<Vec<u8>>,
        version: Option<VectorClock>,
    ) -> SyncResult<VectorClock> {
        let msg = SyncMessage::PutRequest(PutRequestMessage {
            header: self.header(),
            store: store.to_string(),
            key: key.clone(),
            value,
            version,
        });
        match self.request(msg).await? {
            SyncMessage::PutResponse(r) => Ok(r.version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&mut self, store: &str, key: &ByteArray) -> SyncResult<VectorClock> {
        self.put(store, key, None, None).await
    }

    pub async fn entries(&mut self, store: &str) -> SyncResult<Vec<KeyedValues>> {
        let msg = SyncMessage::EntriesRequest(EntriesRequestMessage {
            header: self.header(),
            store: store.to_string(),
        });
        match self.request(msg).await? {
            SyncMessage::EntriesResponse(r) => Ok(r.entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cluster_info(&mut self) -> SyncResult<ClusterInfoResponseMessage> {
        let msg = SyncMessage::ClusterInfoRequest(ClusterInfoRequestMessage {
            header: self.header(),
        });
        match self.request(msg).await? {
            SyncMessage::ClusterInfoResponse(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn new_election(&mut self, rigged: bool) -> SyncResult<()> {
        let msg = SyncMessage::NewElectionRequest(NewElectionRequestMessage {
            header: self.header(),
            rigged,
        });
        match self.request(msg).await? {
            SyncMessage::NewElectionResponse(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Typed view of one store on the remote node
    pub fn store<K, V>(&mut self, name: &str) -> RemoteStoreClient<'_, K, V>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        RemoteStoreClient {
            client: self,
            store: name.to_string(),
            _types: PhantomData,
        }
    }

    pub fn close(mut self) {
        self.channel.disconnect();
    }
}

fn unexpected(msg: SyncMessage) -> SyncError {
    SyncError::Protocol(format!("Unexpected response {}", msg.type_name()))
}

pub struct RemoteStoreClient<'a, K, V> {
    client: &'a mut RemoteSyncClient,
    store: String,
    _types: PhantomData<fn(K, V)>,
}

impl<K, V> RemoteStoreClient<'_, K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub async fn get(&mut self, key: &K) -> SyncResult<Versioned<V>> {
        let versions = self.client.get(&self.store, &encode_key(key)?).await?;
        resolve_last_write_wins(&versions)
            .unwrap_or_else(Versioned::empty)
            .try_map(|bytes| decode_value(&bytes))
    }

    pub async fn get_value(&mut self, key: &K) -> SyncResult<Option<V>> {
        Ok(self.get(key).await?.into_value())
    }

    pub async fn put(&mut self, key: &K, value: &V) -> SyncResult<VectorClock> {
        let key = encode_key(key)?;
        let value = encode_value(value)?;
        self.client.put(&self.store, &key, Some(value), None).await
    }

    pub async fn delete(&mut self, key: &K) -> SyncResult<()> {
        self.client.delete(&self.store, &encode_key(key)?).await?;
        Ok(())
    }

    /// Live entries, tombstones skipped
    pub async fn entries(&mut self) -> SyncResult<Vec<(K, Versioned<V>)>> {
        let mut entries = Vec::new();
        for kv in self.client.entries(&self.store).await? {
            let Some(resolved) = resolve_last_write_wins(&kv.values) else {
                continue;
            };
            if resolved.is_tombstone() {
                continue;
            }
            entries.push((
                decode_key(&kv.key)?,
                resolved.try_map(|bytes| decode_value(&bytes))?,
            ));
        }
        Ok(entries)
    }
}
