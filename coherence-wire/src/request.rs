//! Update queue requests and their wire representation.
//!
//! Every request is one frame: a one-byte tag followed by the variant's
//! fields. The variant set is fixed by the protocol.

use crate::codec::{self, FrameReader};
use bytes::{BufMut, Bytes, BytesMut};
use coherence_core::{BindingKey, ChannelError, Key, ObjectId, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

/// Name value marking a binding removal in a commit.
pub const REMOVE_BINDING: i64 = -1;

// ============================================================================
// REQUEST KIND
// ============================================================================

/// Discriminant of a request, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Commit,
    EvictObject,
    DowngradeObject,
    EvictBinding,
    DowngradeBinding,
}

impl RequestKind {
    pub const ALL: [RequestKind; 5] = [
        RequestKind::Commit,
        RequestKind::EvictObject,
        RequestKind::DowngradeObject,
        RequestKind::EvictBinding,
        RequestKind::DowngradeBinding,
    ];

    pub fn tag(&self) -> u8 {
        match self {
            RequestKind::Commit => 1,
            RequestKind::EvictObject => 2,
            RequestKind::DowngradeObject => 3,
            RequestKind::EvictBinding => 4,
            RequestKind::DowngradeBinding => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Commit => "commit",
            RequestKind::EvictObject => "evict_object",
            RequestKind::DowngradeObject => "downgrade_object",
            RequestKind::EvictBinding => "evict_binding",
            RequestKind::DowngradeBinding => "downgrade_binding",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// COMMIT BATCH
// ============================================================================

/// New value for an object in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectValue {
    Store(Bytes),
    Remove,
}

/// New value for a name binding in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingValue {
    Bound(ObjectId),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectWrite {
    pub oid: ObjectId,
    pub value: ObjectValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingWrite {
    pub name: String,
    pub value: BindingValue,
}

/// A batch of simultaneous object and binding updates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitBatch {
    pub objects: Vec<ObjectWrite>,
    pub bindings: Vec<BindingWrite>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, oid: ObjectId, value: impl Into<Bytes>) -> Self {
        self.objects.push(ObjectWrite {
            oid,
            value: ObjectValue::Store(value.into()),
        });
        self
    }

    pub fn remove_object(mut self, oid: ObjectId) -> Self {
        self.objects.push(ObjectWrite {
            oid,
            value: ObjectValue::Remove,
        });
        self
    }

    pub fn bind(mut self, name: impl Into<String>, oid: ObjectId) -> Self {
        self.bindings.push(BindingWrite {
            name: name.into(),
            value: BindingValue::Bound(oid),
        });
        self
    }

    pub fn unbind(mut self, name: impl Into<String>) -> Self {
        self.bindings.push(BindingWrite {
            name: name.into(),
            value: BindingValue::Remove,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.bindings.is_empty()
    }

    /// Every key the batch touches, objects first.
    pub fn keys(&self) -> Vec<Key> {
        self.objects
            .iter()
            .map(|w| Key::Object(w.oid))
            .chain(
                self.bindings
                    .iter()
                    .map(|w| Key::Binding(BindingKey::name(w.name.clone()))),
            )
            .collect()
    }

    /// Build a batch from the four parallel arrays carried on the wire.
    ///
    /// An absent object value removes the object; a name value of `-1`
    /// removes the binding. Binding names must be real names.
    pub fn from_arrays(
        oids: Vec<i64>,
        oid_values: Vec<Option<Bytes>>,
        names: Vec<Option<String>>,
        name_values: Vec<i64>,
    ) -> Result<Self, ValidationError> {
        check_lengths("oids", oids.len(), "oid_values", oid_values.len())?;
        check_lengths("names", names.len(), "name_values", name_values.len())?;

        let mut objects = Vec::with_capacity(oids.len());
        for (raw, value) in oids.into_iter().zip(oid_values) {
            let oid = ObjectId::new(raw)?;
            let value = match value {
                Some(bytes) => ObjectValue::Store(bytes),
                None => ObjectValue::Remove,
            };
            objects.push(ObjectWrite { oid, value });
        }

        let mut bindings = Vec::with_capacity(names.len());
        for (name, raw) in names.into_iter().zip(name_values) {
            let name = name.ok_or_else(|| ValidationError::InvalidValue {
                field: "names".to_string(),
                reason: "the upper sentinel cannot be bound".to_string(),
            })?;
            let value = match raw {
                REMOVE_BINDING => BindingValue::Remove,
                raw if raw < 0 => {
                    return Err(ValidationError::NegativeId {
                        field: "name_values".to_string(),
                        value: raw,
                    })
                }
                raw => BindingValue::Bound(ObjectId::new(raw)?),
            };
            bindings.push(BindingWrite { name, value });
        }

        Ok(Self { objects, bindings })
    }

    /// Split the batch into the four parallel wire arrays.
    pub fn to_arrays(&self) -> (Vec<i64>, Vec<Option<Bytes>>, Vec<Option<String>>, Vec<i64>) {
        let oids = self.objects.iter().map(|w| w.oid.as_i64()).collect();
        let oid_values = self
            .objects
            .iter()
            .map(|w| match &w.value {
                ObjectValue::Store(bytes) => Some(bytes.clone()),
                ObjectValue::Remove => None,
            })
            .collect();
        let names = self.bindings.iter().map(|w| Some(w.name.clone())).collect();
        let name_values = self
            .bindings
            .iter()
            .map(|w| match w.value {
                BindingValue::Bound(oid) => oid.as_i64(),
                BindingValue::Remove => REMOVE_BINDING,
            })
            .collect();
        (oids, oid_values, names, name_values)
    }
}

fn check_lengths(
    left_field: &str,
    left: usize,
    right_field: &str,
    right: usize,
) -> Result<(), ValidationError> {
    if left != right {
        return Err(ValidationError::LengthMismatch {
            left_field: left_field.to_string(),
            left,
            right_field: right_field.to_string(),
            right,
        });
    }
    Ok(())
}

// ============================================================================
// REQUEST
// ============================================================================

/// One operation a node sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Commit(CommitBatch),
    EvictObject { oid: ObjectId },
    DowngradeObject { oid: ObjectId },
    EvictBinding { key: BindingKey },
    DowngradeBinding { key: BindingKey },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Commit(_) => RequestKind::Commit,
            Request::EvictObject { .. } => RequestKind::EvictObject,
            Request::DowngradeObject { .. } => RequestKind::DowngradeObject,
            Request::EvictBinding { .. } => RequestKind::EvictBinding,
            Request::DowngradeBinding { .. } => RequestKind::DowngradeBinding,
        }
    }

    /// Keys the request touches.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Request::Commit(batch) => batch.keys(),
            Request::EvictObject { oid } | Request::DowngradeObject { oid } => {
                vec![Key::Object(*oid)]
            }
            Request::EvictBinding { key } | Request::DowngradeBinding { key } => {
                vec![Key::Binding(key.clone())]
            }
        }
    }

    /// Append the request's frame to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind().tag());
        match self {
            Request::Commit(batch) => {
                let (oids, oid_values, names, name_values) = batch.to_arrays();
                codec::put_longs(buf, &oids);
                codec::put_blobs(buf, &oid_values);
                codec::put_strings(buf, &names);
                codec::put_longs(buf, &name_values);
            }
            Request::EvictObject { oid } | Request::DowngradeObject { oid } => {
                codec::put_long(buf, oid.as_i64());
            }
            Request::EvictBinding { key } | Request::DowngradeBinding { key } => {
                codec::put_string(buf, key.as_name());
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Read exactly one request frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before a frame starts.
    /// A truncated frame, an unknown tag, or invalid field values are all
    /// channel errors.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut FrameReader<R>,
    ) -> Result<Option<Request>, ChannelError> {
        let tag = match reader.read_frame_start().await? {
            Some(tag) => tag,
            None => return Ok(None),
        };
        let kind = RequestKind::from_tag(tag).ok_or(ChannelError::UnknownTag { tag })?;

        let request = match kind {
            RequestKind::Commit => {
                let oids = reader.read_longs("oids").await?;
                let oid_values = reader.read_blobs("oid_values").await?;
                let names = reader.read_strings("names").await?;
                let name_values = reader.read_longs("name_values").await?;
                let batch = CommitBatch::from_arrays(oids, oid_values, names, name_values)
                    .map_err(malformed)?;
                Request::Commit(batch)
            }
            RequestKind::EvictObject => Request::EvictObject {
                oid: read_oid(reader).await?,
            },
            RequestKind::DowngradeObject => Request::DowngradeObject {
                oid: read_oid(reader).await?,
            },
            RequestKind::EvictBinding => Request::EvictBinding {
                key: read_binding(reader).await?,
            },
            RequestKind::DowngradeBinding => Request::DowngradeBinding {
                key: read_binding(reader).await?,
            },
        };
        Ok(Some(request))
    }
}

async fn read_oid<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<ObjectId, ChannelError> {
    let raw = reader.read_long("oid").await?;
    ObjectId::new(raw).map_err(malformed)
}

async fn read_binding<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<BindingKey, ChannelError> {
    Ok(match reader.read_string("name").await? {
        Some(name) => BindingKey::Name(name),
        None => BindingKey::Upper,
    })
}

fn malformed(e: ValidationError) -> ChannelError {
    ChannelError::Malformed {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireLimits;

    fn oid(raw: i64) -> ObjectId {
        ObjectId::new(raw).unwrap()
    }

    async fn decode(bytes: &[u8]) -> Result<Option<Request>, ChannelError> {
        let mut reader = FrameReader::new(bytes, WireLimits::default());
        Request::read(&mut reader).await
    }

    #[test]
    fn test_tags_are_fixed() {
        let tags: Vec<u8> = RequestKind::ALL.iter().map(|k| k.tag()).collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);
        assert_eq!(RequestKind::from_tag(0), None);
        assert_eq!(RequestKind::from_tag(6), None);
    }

    #[test]
    fn test_evict_object_frame() {
        let bytes = Request::EvictObject { oid: oid(42) }.to_bytes();
        assert_eq!(&bytes[..], &[2, 0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn test_upper_sentinel_frame() {
        let bytes = Request::EvictBinding {
            key: BindingKey::Upper,
        }
        .to_bytes();
        assert_eq!(&bytes[..], &[4, 255, 255, 255, 255]);
    }

    #[tokio::test]
    async fn test_commit_decodes_removals() {
        let batch = CommitBatch::new()
            .store(oid(5), vec![1u8, 2])
            .remove_object(oid(6))
            .bind("room1", oid(5))
            .unbind("room2");
        let request = Request::Commit(batch.clone());
        let decoded = decode(&request.to_bytes()).await.unwrap();
        assert_eq!(decoded, Some(Request::Commit(batch)));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        assert_eq!(
            decode(&[9]).await.unwrap_err(),
            ChannelError::UnknownTag { tag: 9 }
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_vs_truncation() {
        assert_eq!(decode(&[]).await.unwrap(), None);
        assert!(matches!(
            decode(&[3, 0, 0]).await,
            Err(ChannelError::EndOfStream { .. })
        ));
    }

    #[tokio::test]
    async fn test_negative_oid_is_malformed() {
        let mut frame = vec![2u8];
        frame.extend_from_slice(&(-5i64).to_be_bytes());
        assert!(matches!(
            decode(&frame).await,
            Err(ChannelError::Malformed { .. })
        ));
    }

    #[test]
    fn test_from_arrays_length_mismatch() {
        let err = CommitBatch::from_arrays(vec![1, 2], vec![None], vec![], vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::LengthMismatch { left: 2, right: 1, .. }));

        let err =
            CommitBatch::from_arrays(vec![], vec![], vec![Some("a".to_string())], vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::LengthMismatch { .. }));
    }

    #[test]
    fn test_from_arrays_rejects_bad_values() {
        let err = CommitBatch::from_arrays(vec![-1], vec![None], vec![], vec![]).unwrap_err();
        assert!(matches!(err, ValidationError::NegativeId { .. }));

        let err = CommitBatch::from_arrays(vec![], vec![], vec![Some("a".to_string())], vec![-2])
            .unwrap_err();
        assert!(matches!(err, ValidationError::NegativeId { value: -2, .. }));

        let err = CommitBatch::from_arrays(vec![], vec![], vec![None], vec![1]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn test_keys() {
        let batch = CommitBatch::new().store(oid(1), vec![0u8]).bind("n", oid(1));
        assert_eq!(
            Request::Commit(batch).keys(),
            vec![Key::Object(oid(1)), Key::binding("n")]
        );
    }
}
