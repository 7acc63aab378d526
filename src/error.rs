use thiserror::Error;

use crate::rpc::protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Obsolete version: {0}")]
    ObsoleteVersion(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Store '{0}' is not registered")]
    UnknownStore(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Sync manager is shut down")]
    Shutdown,

    #[error("Refusing to delete the local node {0}")]
    DeleteLocalNode(i16),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Wire code carried in an Error envelope.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::ObsoleteVersion(_) => ErrorCode::ObsoleteVersion,
            SyncError::Auth(_) => ErrorCode::Auth,
            SyncError::UnknownStore(_) => ErrorCode::UnknownStore,
            SyncError::Protocol(_) | SyncError::Serialization(_) => ErrorCode::Protocol,
            SyncError::Config(_) | SyncError::DeleteLocalNode(_) => ErrorCode::Config,
            SyncError::Remote { code, .. } => *code,
            _ => ErrorCode::Generic,
        }
    }

    /// Rebuild the local error kind from a received Error envelope.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::ObsoleteVersion => SyncError::ObsoleteVersion(message),
            ErrorCode::Auth => SyncError::Auth(message),
            ErrorCode::UnknownStore => SyncError::UnknownStore(message),
            _ => SyncError::Remote { code, message },
        }
    }

    /// Process exit status used by the command line tools.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::ObsoleteVersion(_) => 2,
            SyncError::Auth(_) => 3,
            SyncError::UnknownStore(_) => 4,
            SyncError::DeleteLocalNode(_) => 5,
            SyncError::Config(_) => 6,
            SyncError::Remote { code, .. } => match code {
                ErrorCode::Config => 6,
                _ => 1,
            },
            _ => 1,
        }
    }

    pub fn is_obsolete(&self) -> bool {
        matches!(self, SyncError::ObsoleteVersion(_))
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
