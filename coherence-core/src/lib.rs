//! Coherence Core - Directory Data Types
//!
//! Identifiers, keys, access states, errors and configuration shared by the
//! wire codec, the server-side directory and the node-side update queue.
//! This crate contains data types and pure state transitions only.

pub mod access;
pub mod config;
pub mod error;
pub mod identity;
pub mod key;

pub use access::{AccessLevel, AccessLevelParseError, AccessState, DirectoryEntry};
pub use config::CoherenceConfig;
pub use error::{
    ChannelError, CoherenceError, CoherenceResult, ConfigError, ConsistencyFault, DirectoryError,
    StorageError, ValidationError,
};
pub use identity::{new_session_id, NodeId, ObjectId, SessionId, Timestamp};
pub use key::{BindingKey, Key};
