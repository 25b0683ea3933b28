//! Primitive field codec.
//!
//! Writers append big-endian fields to a [`BufMut`]; [`FrameReader`] reads
//! the same fields back from any [`AsyncRead`]. Field encodings:
//!
//! | field          | layout                                               |
//! |----------------|------------------------------------------------------|
//! | long           | `i64`                                                |
//! | long array     | `i32` count, then `count` longs                      |
//! | blob           | `i32` length (`-1` = absent), then `length` bytes    |
//! | blob array     | `i32` count, then `count` blobs                      |
//! | string         | `i32` length (`-1` = absent), then UTF-8 bytes       |
//! | string array   | `i32` count, then `count` strings                    |
//!
//! Running out of bytes is reported as [`ChannelError::EndOfStream`] with the
//! field being read, so a clean close between frames and a truncated frame
//! are told apart by context, never retried.

use bytes::{BufMut, Bytes};
use coherence_core::{ChannelError, CoherenceConfig};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length prefix marking an absent blob or string.
pub const ABSENT_LEN: i32 = -1;

/// Size limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLimits {
    pub max_batch_len: usize,
    pub max_value_len: usize,
    pub max_name_len: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self::from(&CoherenceConfig::default())
    }
}

impl From<&CoherenceConfig> for WireLimits {
    fn from(config: &CoherenceConfig) -> Self {
        Self {
            max_batch_len: config.max_batch_len,
            max_value_len: config.max_value_len,
            max_name_len: config.max_name_len,
        }
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn put_len<B: BufMut>(buf: &mut B, len: usize) {
    // Callers never build arrays beyond i32::MAX entries.
    buf.put_i32(len as i32);
}

pub fn put_long<B: BufMut>(buf: &mut B, value: i64) {
    buf.put_i64(value);
}

pub fn put_longs<B: BufMut>(buf: &mut B, values: &[i64]) {
    put_len(buf, values.len());
    for value in values {
        buf.put_i64(*value);
    }
}

pub fn put_blob<B: BufMut>(buf: &mut B, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            put_len(buf, bytes.len());
            buf.put_slice(bytes);
        }
        None => buf.put_i32(ABSENT_LEN),
    }
}

pub fn put_blobs<B: BufMut>(buf: &mut B, values: &[Option<Bytes>]) {
    put_len(buf, values.len());
    for value in values {
        put_blob(buf, value.as_deref());
    }
}

pub fn put_string<B: BufMut>(buf: &mut B, value: Option<&str>) {
    put_blob(buf, value.map(str::as_bytes));
}

pub fn put_strings<B: BufMut>(buf: &mut B, values: &[Option<String>]) {
    put_len(buf, values.len());
    for value in values {
        put_string(buf, value.as_deref());
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Reads codec fields from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    limits: WireLimits,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, limits: WireLimits) -> Self {
        Self { inner, limits }
    }

    pub fn limits(&self) -> WireLimits {
        self.limits
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the first byte of a frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn read_frame_start(&mut self) -> Result<Option<u8>, ChannelError> {
        let mut byte = [0u8; 1];
        let n = self.inner.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(byte[0]))
    }

    pub async fn read_u8(&mut self, context: &str) -> Result<u8, ChannelError> {
        self.inner.read_u8().await.map_err(|e| eof_context(e, context))
    }

    pub async fn read_long(&mut self, context: &str) -> Result<i64, ChannelError> {
        self.inner.read_i64().await.map_err(|e| eof_context(e, context))
    }

    async fn read_prefix(&mut self, context: &str) -> Result<i32, ChannelError> {
        self.inner.read_i32().await.map_err(|e| eof_context(e, context))
    }

    async fn read_count(&mut self, context: &str) -> Result<usize, ChannelError> {
        let count = self.read_prefix(context).await?;
        if count < 0 {
            return Err(ChannelError::Malformed {
                reason: format!("negative count {} for {}", count, context),
            });
        }
        let count = count as usize;
        if count > self.limits.max_batch_len {
            return Err(ChannelError::Malformed {
                reason: format!(
                    "{} has {} entries, limit is {}",
                    context, count, self.limits.max_batch_len
                ),
            });
        }
        Ok(count)
    }

    async fn read_body(
        &mut self,
        context: &str,
        max: usize,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let len = self.read_prefix(context).await?;
        if len == ABSENT_LEN {
            return Ok(None);
        }
        if len < 0 {
            return Err(ChannelError::Malformed {
                reason: format!("negative length {} for {}", len, context),
            });
        }
        let len = len as usize;
        if len > max {
            return Err(ChannelError::Malformed {
                reason: format!("{} is {} bytes, limit is {}", context, len, max),
            });
        }
        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| eof_context(e, context))?;
        Ok(Some(body))
    }

    pub async fn read_longs(&mut self, context: &str) -> Result<Vec<i64>, ChannelError> {
        let count = self.read_count(context).await?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_long(context).await?);
        }
        Ok(values)
    }

    pub async fn read_blob(&mut self, context: &str) -> Result<Option<Bytes>, ChannelError> {
        let max = self.limits.max_value_len;
        Ok(self.read_body(context, max).await?.map(Bytes::from))
    }

    pub async fn read_blobs(&mut self, context: &str) -> Result<Vec<Option<Bytes>>, ChannelError> {
        let count = self.read_count(context).await?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_blob(context).await?);
        }
        Ok(values)
    }

    pub async fn read_string(&mut self, context: &str) -> Result<Option<String>, ChannelError> {
        let max = self.limits.max_name_len;
        self.read_text(context, max).await
    }

    /// Read a string field bounded by `max` bytes instead of the name limit.
    pub async fn read_text(
        &mut self,
        context: &str,
        max: usize,
    ) -> Result<Option<String>, ChannelError> {
        match self.read_body(context, max).await? {
            Some(body) => String::from_utf8(body)
                .map(Some)
                .map_err(|e| ChannelError::Malformed {
                    reason: format!("{} is not valid UTF-8: {}", context, e),
                }),
            None => Ok(None),
        }
    }

    pub async fn read_strings(
        &mut self,
        context: &str,
    ) -> Result<Vec<Option<String>>, ChannelError> {
        let count = self.read_count(context).await?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_string(context).await?);
        }
        Ok(values)
    }
}

fn eof_context(e: std::io::Error, context: &str) -> ChannelError {
    match ChannelError::from(e) {
        ChannelError::EndOfStream { .. } => ChannelError::EndOfStream {
            context: context.to_string(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn reader(bytes: &[u8]) -> FrameReader<&[u8]> {
        FrameReader::new(bytes, WireLimits::default())
    }

    #[tokio::test]
    async fn test_longs_layout() {
        let mut buf = BytesMut::new();
        put_longs(&mut buf, &[1, -1]);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1, 255, 255, 255, 255, 255, 255, 255, 255]
        );
        let mut r = reader(&buf);
        assert_eq!(r.read_longs("oids").await.unwrap(), vec![1, -1]);
    }

    #[tokio::test]
    async fn test_absent_string_uses_minus_one() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, None);
        assert_eq!(&buf[..], &[255, 255, 255, 255]);
        let mut r = reader(&buf);
        assert_eq!(r.read_string("name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_string_is_not_absent() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, Some(""));
        let mut r = reader(&buf);
        assert_eq!(r.read_string("name").await.unwrap(), Some(String::new()));
    }

    #[tokio::test]
    async fn test_truncated_blob_reports_field() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, Some(&[1, 2, 3, 4]));
        let truncated = &buf[..buf.len() - 1];
        let mut r = reader(truncated);
        assert_eq!(
            r.read_blob("oid_values").await.unwrap_err(),
            ChannelError::EndOfStream {
                context: "oid_values".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_count_limit_enforced() {
        let mut buf = BytesMut::new();
        put_longs(&mut buf, &[1, 2, 3]);
        let limits = WireLimits {
            max_batch_len: 2,
            ..WireLimits::default()
        };
        let mut r = FrameReader::new(&buf[..], limits);
        assert!(matches!(
            r.read_longs("oids").await,
            Err(ChannelError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, Some(&[0xff, 0xfe]));
        let mut r = reader(&buf);
        assert!(matches!(
            r.read_string("name").await,
            Err(ChannelError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_negative_length_other_than_absent() {
        let mut buf = BytesMut::new();
        buf.put_i32(-2);
        let mut r = reader(&buf);
        assert!(matches!(
            r.read_blob("value").await,
            Err(ChannelError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_end_between_frames() {
        let mut r = reader(&[]);
        assert_eq!(r.read_frame_start().await.unwrap(), None);
    }
}
