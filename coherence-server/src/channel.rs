//! Per-node channel service
//!
//! One task reads a node's channel: decode a request, apply it, write the
//! response, repeat. Requests of one node are therefore applied strictly in
//! arrival order, while channels of different nodes run concurrently.
//!
//! Any channel fault (end of stream mid-frame, unknown tag, malformed frame,
//! I/O error) ends the channel and the node's session; the node has to
//! register again.

use crate::processor::CoherenceServer;
use crate::registry::NodeSession;
use crate::store::ValueStore;
use coherence_core::{ChannelError, CoherenceResult, NodeId};
use coherence_wire::{FrameReader, Request, Response, WireLimits};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The node closed the stream between frames.
    Closed,
    /// The session was shut down on the server side.
    ShutDown,
    Failed(ChannelError),
}

/// What a channel did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub node_id: NodeId,
    pub processed: u64,
    pub end: ChannelEnd,
}

/// Serve `session`'s requests from `stream` until it ends.
///
/// Fails without reading anything if the session already has a channel.
/// On return the session is closed and its directory access released.
pub async fn serve_channel<S, T>(
    server: Arc<CoherenceServer<S>>,
    session: Arc<NodeSession>,
    stream: T,
) -> CoherenceResult<ChannelSummary>
where
    S: ValueStore,
    T: AsyncRead + AsyncWrite + Unpin,
{
    session.attach_channel()?;
    let node_id = session.node_id();

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(
        BufReader::new(read_half),
        WireLimits::from(server.config()),
    );
    let mut shutdown = session.shutdown_signal();
    let mut processed = 0u64;

    debug!(node_id = node_id.as_i64(), "Channel attached");

    let end = loop {
        if *shutdown.borrow_and_update() {
            break ChannelEnd::ShutDown;
        }
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break ChannelEnd::ShutDown,
            },
            next = Request::read(&mut reader) => next,
        };

        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => break ChannelEnd::Closed,
            Err(e) => break ChannelEnd::Failed(e),
        };

        let result = server.process(&session, request);
        processed += 1;

        let response = Response::from_outcome(&result.outcome);
        if let Err(e) = write_response(&mut write_half, &response).await {
            break ChannelEnd::Failed(e);
        }
    };

    match &end {
        ChannelEnd::Closed => info!(node_id = node_id.as_i64(), processed, "Channel closed by node"),
        ChannelEnd::ShutDown => info!(node_id = node_id.as_i64(), processed, "Channel shut down"),
        ChannelEnd::Failed(e) => error!(
            node_id = node_id.as_i64(),
            processed,
            error = %e,
            "Channel failed"
        ),
    }

    if let Err(e) = write_half.shutdown().await {
        debug!(node_id = node_id.as_i64(), error = %e, "Stream shutdown failed");
    }
    server.close_session(&session)?;

    Ok(ChannelSummary {
        node_id,
        processed,
        end,
    })
}

pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), ChannelError> {
    writer.write_all(&response.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryValueStore;
    use coherence_core::{CoherenceConfig, Key, ObjectId};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn node(raw: i64) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn oid(raw: i64) -> ObjectId {
        ObjectId::new(raw).unwrap()
    }

    fn server() -> Arc<CoherenceServer<InMemoryValueStore>> {
        Arc::new(
            CoherenceServer::new(
                CoherenceConfig::default(),
                Arc::new(InMemoryValueStore::new()),
            )
            .unwrap(),
        )
    }

    async fn read_response(client: &mut DuplexStream) -> Option<Response> {
        let mut reader = FrameReader::new(client, WireLimits::default());
        Response::read(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let server = server();
        let session = server.register_node(node(1)).unwrap();
        server
            .directory()
            .grant_read(Key::object(oid(1)), node(1))
            .unwrap();

        let (mut client, server_end) = duplex(4096);
        let task = tokio::spawn(serve_channel(Arc::clone(&server), session, server_end));

        client
            .write_all(&Request::EvictObject { oid: oid(1) }.to_bytes())
            .await
            .unwrap();
        client
            .write_all(&Request::EvictObject { oid: oid(1) }.to_bytes())
            .await
            .unwrap();

        assert_eq!(read_response(&mut client).await, Some(Response::Ok));
        assert!(matches!(
            read_response(&mut client).await,
            Some(Response::ConsistencyFault { .. })
        ));

        drop(client);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.end, ChannelEnd::Closed);
        assert!(!server.registry().contains(node(1)));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        let server = server();
        let session = server.register_node(node(1)).unwrap();
        server
            .directory()
            .grant_write(Key::object(oid(3)), node(1))
            .unwrap();

        let (mut client, server_end) = duplex(1024);
        let task = tokio::spawn(serve_channel(Arc::clone(&server), session, server_end));
        client.write_all(&[42]).await.unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(
            summary.end,
            ChannelEnd::Failed(ChannelError::UnknownTag { tag: 42 })
        );
        // The failed node's access is released.
        assert_eq!(server.directory().entry_count().unwrap(), 0);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_server_shutdown_ends_channel() {
        let server = server();
        let session = server.register_node(node(1)).unwrap();
        let (_client, server_end) = duplex(1024);
        let task = tokio::spawn(serve_channel(Arc::clone(&server), session, server_end));

        server.shutdown();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.end, ChannelEnd::ShutDown);
    }

    #[tokio::test]
    async fn test_second_channel_rejected() {
        let server = server();
        let session = server.register_node(node(1)).unwrap();
        session.attach_channel().unwrap();

        let (_client, server_end) = duplex(64);
        let result = serve_channel(Arc::clone(&server), session, server_end).await;
        assert!(result.is_err());
        // The live session is untouched.
        assert!(server.registry().contains(node(1)));
    }
}
