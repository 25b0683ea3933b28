//! Access levels and per-key access states.
//!
//! The directory records, per key, which nodes hold it and how. The state
//! type makes the coherence invariant structural: a writer is a single
//! `NodeId`, so "a writer plus another holder" cannot be represented.
//!
//! # State Transition Diagram
//!
//! ```text
//!            grant_read            grant_read
//! Unheld ───────────────→ ReadShared ↺
//!   │ ↑                     │    ↑
//!   │ └── evict (last) ─────┘    │ downgrade
//!   │                            │
//!   └──── grant_write ──→ WriteExclusive ── evict ──→ Unheld
//!                              ↑
//!      ReadShared({n}) ────────┘ grant_write (upgrade)
//! ```

use crate::{Key, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ACCESS LEVEL
// ============================================================================

/// Access level a node can hold on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Any number of nodes may read concurrently
    Read,
    /// Only one node may write, and nobody else may hold the key
    Write,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = AccessLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            _ => Err(AccessLevelParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid access level string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLevelParseError(pub String);

impl fmt::Display for AccessLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid access level: {}", self.0)
    }
}

impl std::error::Error for AccessLevelParseError {}

// ============================================================================
// ACCESS STATE
// ============================================================================

/// Authoritative access state of one key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessState {
    #[default]
    Unheld,
    /// Never empty; an empty reader set is pruned back to `Unheld`.
    ReadShared(BTreeSet<NodeId>),
    WriteExclusive(NodeId),
}

impl AccessState {
    pub fn is_unheld(&self) -> bool {
        matches!(self, AccessState::Unheld)
    }

    /// The access level `node` holds, if any.
    pub fn level_of(&self, node: NodeId) -> Option<AccessLevel> {
        match self {
            AccessState::Unheld => None,
            AccessState::ReadShared(readers) if readers.contains(&node) => {
                Some(AccessLevel::Read)
            }
            AccessState::ReadShared(_) => None,
            AccessState::WriteExclusive(writer) if *writer == node => Some(AccessLevel::Write),
            AccessState::WriteExclusive(_) => None,
        }
    }

    pub fn holds(&self, node: NodeId) -> bool {
        self.level_of(node).is_some()
    }

    pub fn writer(&self) -> Option<NodeId> {
        match self {
            AccessState::WriteExclusive(writer) => Some(*writer),
            _ => None,
        }
    }

    pub fn holders(&self) -> BTreeSet<NodeId> {
        match self {
            AccessState::Unheld => BTreeSet::new(),
            AccessState::ReadShared(readers) => readers.clone(),
            AccessState::WriteExclusive(writer) => BTreeSet::from([*writer]),
        }
    }

    /// State after `node` gives up all access, or `None` if it holds nothing.
    pub fn evicted(&self, node: NodeId) -> Option<AccessState> {
        match self {
            AccessState::Unheld => None,
            AccessState::WriteExclusive(writer) if *writer == node => Some(AccessState::Unheld),
            AccessState::WriteExclusive(_) => None,
            AccessState::ReadShared(readers) => {
                if !readers.contains(&node) {
                    return None;
                }
                let mut remaining = readers.clone();
                remaining.remove(&node);
                if remaining.is_empty() {
                    Some(AccessState::Unheld)
                } else {
                    Some(AccessState::ReadShared(remaining))
                }
            }
        }
    }

    /// State after the writer `node` weakens to read, or `None` if `node` is
    /// not the writer.
    pub fn downgraded(&self, node: NodeId) -> Option<AccessState> {
        match self {
            AccessState::WriteExclusive(writer) if *writer == node => {
                Some(AccessState::ReadShared(BTreeSet::from([node])))
            }
            _ => None,
        }
    }

    /// State after granting read to `node`.
    ///
    /// Returns the conflicting writer when another node holds write access.
    /// A writer asking for read keeps its write access.
    pub fn granted_read(&self, node: NodeId) -> Result<AccessState, NodeId> {
        match self {
            AccessState::Unheld => Ok(AccessState::ReadShared(BTreeSet::from([node]))),
            AccessState::ReadShared(readers) => {
                let mut readers = readers.clone();
                readers.insert(node);
                Ok(AccessState::ReadShared(readers))
            }
            AccessState::WriteExclusive(writer) if *writer == node => Ok(self.clone()),
            AccessState::WriteExclusive(writer) => Err(*writer),
        }
    }

    /// State after granting write to `node`.
    ///
    /// Returns some other holder when the key is held by anyone but `node`.
    pub fn granted_write(&self, node: NodeId) -> Result<AccessState, NodeId> {
        match self {
            AccessState::Unheld => Ok(AccessState::WriteExclusive(node)),
            AccessState::ReadShared(readers) => match readers.iter().find(|r| **r != node) {
                Some(other) => Err(*other),
                None => Ok(AccessState::WriteExclusive(node)),
            },
            AccessState::WriteExclusive(writer) if *writer == node => Ok(self.clone()),
            AccessState::WriteExclusive(writer) => Err(*writer),
        }
    }

    /// Structural sanity check: reader sets are never empty.
    pub fn is_coherent(&self) -> bool {
        match self {
            AccessState::ReadShared(readers) => !readers.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for AccessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessState::Unheld => write!(f, "unheld"),
            AccessState::ReadShared(readers) => {
                let ids: Vec<String> = readers.iter().map(|r| r.to_string()).collect();
                write!(f, "read-shared by [{}]", ids.join(", "))
            }
            AccessState::WriteExclusive(writer) => write!(f, "write-exclusive by {}", writer),
        }
    }
}

/// A key paired with its current access state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub key: Key,
    pub state: AccessState,
}
