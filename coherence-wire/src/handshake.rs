//! Connection handshake: the node announces its id before any request.
//!
//! `[node_id:i64]` from node to server, answered by one [`Response`]
//! frame. Only used by the TCP listener; in-process channels are bound to a
//! node when they are handed to the server.
//!
//! [`Response`]: crate::Response

use crate::codec::{self, FrameReader};
use bytes::{Bytes, BytesMut};
use coherence_core::{ChannelError, NodeId};
use tokio::io::AsyncRead;

pub fn encode_hello(node_id: NodeId) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    codec::put_long(&mut buf, node_id.as_i64());
    buf.freeze()
}

pub async fn read_hello<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<NodeId, ChannelError> {
    let raw = reader.read_long("node_id").await?;
    NodeId::new(raw).map_err(|e| ChannelError::Malformed {
        reason: e.to_string(),
    })
}
