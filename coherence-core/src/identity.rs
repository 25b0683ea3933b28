//! Identity types for nodes, objects and registration sessions

use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of one registration of a node.
/// UUIDv7 so successive registrations of the same node sort by time.
pub type SessionId = Uuid;

/// Generate a new UUIDv7 SessionId (timestamp-sortable).
pub fn new_session_id() -> SessionId {
    Uuid::now_v7()
}

/// Identifier of a caching node.
///
/// Node ids travel as signed 64-bit integers but are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct NodeId(i64);

impl NodeId {
    /// Create a node id, rejecting negative values.
    pub fn new(raw: i64) -> Result<Self, ValidationError> {
        if raw < 0 {
            return Err(ValidationError::NegativeId {
                field: "node_id".to_string(),
                value: raw,
            });
        }
        Ok(Self(raw))
    }

    /// The raw value as sent on the wire.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for NodeId {
    type Error = ValidationError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<NodeId> for i64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stored object.
///
/// Same representation as [`NodeId`]: a non-negative 64-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ObjectId(i64);

impl ObjectId {
    /// Create an object id, rejecting negative values.
    pub fn new(raw: i64) -> Result<Self, ValidationError> {
        if raw < 0 {
            return Err(ValidationError::NegativeId {
                field: "oid".to_string(),
                value: raw,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for ObjectId {
    type Error = ValidationError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ObjectId> for i64 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
