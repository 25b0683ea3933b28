//! Error types for coherence operations

use crate::{AccessLevel, AccessState, Key, NodeId};
use thiserror::Error;

/// A node asked for something its recorded access does not allow.
///
/// The failed operation has no effect on the directory and the node's
/// channel stays usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyFault {
    #[error("Node {node_id} evicted {key} but the directory records it as {recorded}")]
    NotHeld {
        node_id: NodeId,
        key: Key,
        recorded: AccessState,
    },

    #[error("Node {node_id} downgraded {key} without write access; directory records {recorded}")]
    NotWriter {
        node_id: NodeId,
        key: Key,
        recorded: AccessState,
    },

    #[error("Node {node_id} committed {key} without write access; directory records {recorded}")]
    CommitWithoutWrite {
        node_id: NodeId,
        key: Key,
        recorded: AccessState,
    },

    /// A fault reported by the server over the wire, seen from the node.
    #[error("Server reported consistency fault: {message}")]
    Reported { message: String },
}

/// Input-validation errors: protocol or programmer misuse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Node not registered: {node_id}")]
    UnregisteredNode { node_id: NodeId },

    #[error("Node already registered: {node_id}")]
    AlreadyRegistered { node_id: NodeId },

    #[error("Negative value for {field}: {value}")]
    NegativeId { field: String, value: i64 },

    #[error("Length mismatch: {left_field} has {left} entries, {right_field} has {right}")]
    LengthMismatch {
        left_field: String,
        left: usize,
        right_field: String,
        right: usize,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Length of {field} is {len}, limit is {max}")]
    LimitExceeded { field: String, len: usize, max: usize },

    /// A rejection reported by the server over the wire, seen from the node.
    #[error("Server rejected request: {message}")]
    Rejected { message: String },
}

/// Channel and transport faults. Always fatal to the channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("End of stream while reading {context}")]
    EndOfStream { context: String },

    #[error("Unknown request type: {tag}")]
    UnknownTag { tag: u8 },

    #[error("Unknown response status: {status}")]
    UnknownStatus { status: u8 },

    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Response received with no request outstanding")]
    UnexpectedResponse,

    #[error("Completion handler for request {sequence} panicked")]
    CompletionPanicked { sequence: u64 },

    #[error("Channel shut down: {reason}")]
    ShutDown { reason: String },
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChannelError::EndOfStream {
                context: "frame".to_string(),
            }
        } else {
            ChannelError::Io {
                reason: e.to_string(),
            }
        }
    }
}

/// Directory bookkeeping errors that are not consistency faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory lock poisoned")]
    LockPoisoned,

    #[error("Cannot grant {requested} access on {key} to node {node_id}: held by node {holder}")]
    AccessConflict {
        key: Key,
        requested: AccessLevel,
        node_id: NodeId,
        holder: NodeId,
    },
}

/// Value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Apply failed: {reason}")]
    ApplyFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all coherence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoherenceError {
    #[error("Consistency fault: {0}")]
    Consistency(#[from] ConsistencyFault),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CoherenceError {
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, CoherenceError::Consistency(_))
    }

    /// Whether the error ends the channel it occurred on.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(self, CoherenceError::Channel(_))
    }
}

/// Result type alias for coherence operations.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

// =============================================================================
// TESTS
// =============================================================================
