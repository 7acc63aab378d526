//! Versioned, replicated key-value stores
//!
//! - `vector_clock` / `versioned`: causality tracking and conflict rules
//! - `listener` / `propagation`: pipeline stages run after each commit
//! - `manager`: store registry and the node's background tasks
//! - `client`: typed access for application code

pub mod byte_array;
pub mod client;
pub mod counters;
pub mod listener;
pub mod manager;
pub mod propagation;
pub mod scope;
pub mod store;
pub mod vector_clock;
pub mod versioned;

pub use byte_array::ByteArray;
pub use client::StoreClient;
pub use listener::{ListenerHandle, StoreListener, UpdateOrigin};
pub use manager::{SyncManager, SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE};
pub use scope::Scope;
pub use vector_clock::{Occurred, VectorClock};
pub use versioned::Versioned;
