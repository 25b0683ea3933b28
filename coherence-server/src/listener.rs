//! TCP front end
//!
//! Accepts connections, reads the node-id handshake, registers the node and
//! hands the stream to [`serve_channel`]. The handshake is answered with a
//! response frame: `Ok` once registered, `Rejected` otherwise.

use crate::channel::{serve_channel, write_response, ChannelSummary};
use crate::processor::CoherenceServer;
use crate::store::ValueStore;
use coherence_core::{ChannelError, CoherenceResult};
use coherence_wire::handshake::read_hello;
use coherence_wire::{FrameReader, Response, WireLimits};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Accept connections until `shutdown` turns true.
pub async fn serve_tcp<S>(
    server: Arc<CoherenceServer<S>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> CoherenceResult<()>
where
    S: ValueStore + 'static,
{
    let local_addr = listener.local_addr().map_err(ChannelError::from)?;
    info!(%local_addr, "Coherence server listening");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let accepted = tokio::select! {
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    match handle_connection(server, stream).await {
                        Ok(summary) => info!(
                            %peer,
                            node_id = summary.node_id.as_i64(),
                            processed = summary.processed,
                            "Connection finished"
                        ),
                        Err(e) => warn!(%peer, error = %e, "Connection refused"),
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!(%local_addr, "Coherence listener stopped");
    Ok(())
}

/// Run the handshake on `stream`, then serve it as the node's channel.
pub async fn handle_connection<S, T>(
    server: Arc<CoherenceServer<S>>,
    mut stream: T,
) -> CoherenceResult<ChannelSummary>
where
    S: ValueStore,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let node_id = {
        let mut reader = FrameReader::new(&mut stream, WireLimits::from(server.config()));
        read_hello(&mut reader).await?
    };

    let session = match server.register_node(node_id) {
        Ok(session) => session,
        Err(e) => {
            let refusal = Response::from_outcome(&Err(e.clone()));
            write_response(&mut stream, &refusal).await?;
            return Err(e);
        }
    };

    if let Err(e) = write_response(&mut stream, &Response::Ok).await {
        server.close_session(&session)?;
        return Err(e.into());
    }

    serve_channel(server, session, stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEnd;
    use crate::store::InMemoryValueStore;
    use coherence_core::{CoherenceConfig, CoherenceError, NodeId, ValidationError};
    use coherence_wire::handshake::encode_hello;
    use tokio::io::{duplex, AsyncWriteExt};

    fn server() -> Arc<CoherenceServer<InMemoryValueStore>> {
        Arc::new(
            CoherenceServer::new(
                CoherenceConfig::default(),
                Arc::new(InMemoryValueStore::new()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_handshake_registers_node() {
        let server = server();
        let node = NodeId::new(8).unwrap();
        let (mut client, server_end) = duplex(1024);
        let task = tokio::spawn(handle_connection(Arc::clone(&server), server_end));

        client.write_all(&encode_hello(node)).await.unwrap();
        let mut reader = FrameReader::new(&mut client, WireLimits::default());
        assert_eq!(Response::read(&mut reader).await.unwrap(), Some(Response::Ok));
        assert!(server.registry().contains(node));

        drop(client);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.end, ChannelEnd::Closed);
    }

    #[tokio::test]
    async fn test_duplicate_node_refused() {
        let server = server();
        let node = NodeId::new(8).unwrap();
        server.register_node(node).unwrap();

        let (mut client, server_end) = duplex(1024);
        let task = tokio::spawn(handle_connection(Arc::clone(&server), server_end));
        client.write_all(&encode_hello(node)).await.unwrap();

        let mut reader = FrameReader::new(&mut client, WireLimits::default());
        assert!(matches!(
            Response::read(&mut reader).await.unwrap(),
            Some(Response::Rejected { .. })
        ));
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            CoherenceError::Validation(ValidationError::AlreadyRegistered { node_id: node })
        );
    }

    #[tokio::test]
    async fn test_tcp_listener_stops_on_shutdown() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve_tcp(server, listener, rx));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
