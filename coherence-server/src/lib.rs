//! Coherence Server - Access Directory and Update Queue Service
//!
//! The server side of the coherence protocol:
//! - [`directory`]: authoritative per-key access states, sharded
//! - [`store`]: committed values, behind the [`ValueStore`] trait
//! - [`registry`]: registered nodes and their sessions
//! - [`processor`]: applies requests; [`UpdateQueueServer`] operations
//! - [`channel`]: serves one node's request stream
//! - [`listener`]: TCP accept loop and handshake
//! - [`events`]: broadcast feed of applied requests
//! - [`telemetry`]: tracing subscriber setup

pub mod channel;
pub mod directory;
pub mod events;
pub mod listener;
pub mod processor;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use channel::{serve_channel, ChannelEnd, ChannelSummary};
pub use directory::AccessDirectory;
pub use events::{AppliedFeed, AppliedOutcome, AppliedRequest};
pub use listener::{handle_connection, serve_tcp};
pub use processor::{CoherenceServer, ProcessedRequest, UpdateQueueServer};
pub use registry::{NodeRegistry, NodeSession, SessionSnapshot};
pub use store::{InMemoryValueStore, ValueStore};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
