//! Coherence Node - Update Queue
//!
//! The node side of the coherence protocol: an ordered, pipelined channel of
//! requests to the server with per-request completions, and a mirror of the
//! access the node believes it holds.

pub mod completion;
pub mod mirror;
pub mod queue;

pub use completion::{Completion, Outcome, PendingRequest};
pub use mirror::CacheMirror;
pub use queue::UpdateQueue;
