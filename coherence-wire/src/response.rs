//! Per-request acknowledgements.
//!
//! The server answers every request with one response frame, in request
//! order: `[status:1]`, followed by a message string for failures.
//!
//! Messages are capped at [`MAX_MESSAGE_LEN`] bytes independently of the
//! request limits. A fault message quotes the key, and a key may already be
//! as long as the name limit allows.

use crate::codec::{self, FrameReader};
use bytes::{BufMut, Bytes, BytesMut};
use coherence_core::{ChannelError, CoherenceError, ConsistencyFault, ValidationError};
use tokio::io::AsyncRead;

const STATUS_OK: u8 = 0;
const STATUS_CONSISTENCY_FAULT: u8 = 1;
const STATUS_REJECTED: u8 = 2;

/// Longest failure message carried on the wire, in bytes.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Outcome of one request as carried back to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    ConsistencyFault { message: String },
    Rejected { message: String },
}

impl Response {
    /// Translate a server-side outcome into its wire form.
    pub fn from_outcome(outcome: &Result<(), CoherenceError>) -> Self {
        match outcome {
            Ok(()) => Response::Ok,
            Err(CoherenceError::Consistency(fault)) => Response::ConsistencyFault {
                message: fault.to_string(),
            },
            Err(other) => Response::Rejected {
                message: other.to_string(),
            },
        }
    }

    /// The outcome a node reports to the request's completion.
    pub fn into_outcome(self) -> Result<(), CoherenceError> {
        match self {
            Response::Ok => Ok(()),
            Response::ConsistencyFault { message } => {
                Err(ConsistencyFault::Reported { message }.into())
            }
            Response::Rejected { message } => Err(ValidationError::Rejected { message }.into()),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Response::Ok => buf.put_u8(STATUS_OK),
            Response::ConsistencyFault { message } => {
                buf.put_u8(STATUS_CONSISTENCY_FAULT);
                codec::put_string(buf, Some(clip_message(message)));
            }
            Response::Rejected { message } => {
                buf.put_u8(STATUS_REJECTED);
                codec::put_string(buf, Some(clip_message(message)));
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Read one response frame. `Ok(None)` on a clean end of stream.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut FrameReader<R>,
    ) -> Result<Option<Response>, ChannelError> {
        let status = match reader.read_frame_start().await? {
            Some(status) => status,
            None => return Ok(None),
        };
        let response = match status {
            STATUS_OK => Response::Ok,
            STATUS_CONSISTENCY_FAULT => Response::ConsistencyFault {
                message: read_message(reader).await?,
            },
            STATUS_REJECTED => Response::Rejected {
                message: read_message(reader).await?,
            },
            other => return Err(ChannelError::UnknownStatus { status: other }),
        };
        Ok(Some(response))
    }
}

/// Cut `message` to at most [`MAX_MESSAGE_LEN`] bytes on a char boundary.
fn clip_message(message: &str) -> &str {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<String, ChannelError> {
    Ok(reader
        .read_text("message", MAX_MESSAGE_LEN)
        .await?
        .unwrap_or_default())
}
