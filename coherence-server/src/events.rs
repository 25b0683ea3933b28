//! Applied-request feed
//!
//! Every request the server processes is published as an [`AppliedRequest`]
//! on a broadcast channel, in per-node application order. Subscribers see
//! only events published after they subscribe; a slow subscriber lags and
//! misses events rather than blocking the server.

use coherence_core::{CoherenceError, Key, NodeId, SessionId, Timestamp};
use coherence_wire::RequestKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Outcome of an applied request, as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppliedOutcome {
    Applied,
    ConsistencyFault { message: String },
    Rejected { message: String },
}

impl AppliedOutcome {
    pub fn from_result(result: &Result<(), CoherenceError>) -> Self {
        match result {
            Ok(()) => AppliedOutcome::Applied,
            Err(CoherenceError::Consistency(fault)) => AppliedOutcome::ConsistencyFault {
                message: fault.to_string(),
            },
            Err(other) => AppliedOutcome::Rejected {
                message: other.to_string(),
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, AppliedOutcome::Applied)
    }
}

/// One request as processed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRequest {
    pub node_id: NodeId,
    pub session_id: SessionId,
    /// Per-session application order, starting at 1.
    pub sequence: u64,
    pub kind: RequestKind,
    pub keys: Vec<Key>,
    pub outcome: AppliedOutcome,
    pub applied_at: Timestamp,
}

/// Broadcast channel of applied requests.
#[derive(Debug, Clone)]
pub struct AppliedFeed {
    tx: broadcast::Sender<AppliedRequest>,
}

impl AppliedFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: AppliedRequest) {
        let sequence = event.sequence;
        let node_id = event.node_id.as_i64();
        if let Ok(receivers) = self.tx.send(event) {
            trace!(node_id, sequence, receivers, "Published applied request");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppliedRequest> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::{new_session_id, ConsistencyFault, ObjectId};

    fn event(sequence: u64, outcome: AppliedOutcome) -> AppliedRequest {
        AppliedRequest {
            node_id: NodeId::new(1).unwrap(),
            session_id: new_session_id(),
            sequence,
            kind: RequestKind::EvictObject,
            keys: vec![Key::object(ObjectId::new(3).unwrap())],
            outcome,
            applied_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let feed = AppliedFeed::new(4);
        feed.publish(event(1, AppliedOutcome::Applied));
        assert_eq!(feed.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_in_order() {
        let feed = AppliedFeed::new(8);
        let mut rx = feed.subscribe();
        for sequence in 1..=3 {
            feed.publish(event(sequence, AppliedOutcome::Applied));
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().sequence, expected);
        }
    }

    #[test]
    fn test_outcome_classification() {
        let fault: Result<(), CoherenceError> = Err(ConsistencyFault::Reported {
            message: "stale".to_string(),
        }
        .into());
        assert!(matches!(
            AppliedOutcome::from_result(&fault),
            AppliedOutcome::ConsistencyFault { .. }
        ));
        assert!(AppliedOutcome::from_result(&Ok(())).is_applied());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(AppliedOutcome::Rejected {
            message: "bad".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["message"], "bad");
    }
}
