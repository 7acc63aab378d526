//! Node-to-node RPC: framing, handshake and message handling

pub mod auth;
pub mod codec;
pub mod handler;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod service;

pub use auth::AuthContext;
pub use protocol::{ErrorCode, KeyedValues, SyncMessage};
pub use remote::{RemoteStoreClient, RemoteSyncClient};
pub use service::RpcService;
