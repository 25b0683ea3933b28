//! Coherence Wire - Update Queue Protocol
//!
//! Binary codec for the node-to-server request channel:
//! - primitive field encodings ([`codec`])
//! - the five request variants and their tags ([`request`])
//! - per-request acknowledgements ([`response`])
//! - the TCP connection handshake ([`handshake`])

pub mod codec;
pub mod handshake;
pub mod request;
pub mod response;

pub use codec::{FrameReader, WireLimits};
pub use request::{
    BindingValue, BindingWrite, CommitBatch, ObjectValue, ObjectWrite, Request, RequestKind,
};
pub use response::Response;
