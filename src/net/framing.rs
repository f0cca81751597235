//! Length-delimited message framing.
//!
//! Each frame is a 5-byte header followed by a protobuf payload:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | flag:1 | length:4 (BE)  | payload:length  |
//! +--------+----------------+-----------------+
//! ```
//!
//! The flag byte is reserved for compression and is always 0.

use super::tcp::BoxedStream;
use crate::core::error::{CoordinatorError, CoordinatorResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const HEADER_LEN: usize = 5;

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Result of decoding from a partial buffer.
#[derive(Debug, PartialEq)]
pub enum DecodeResult<T> {
    Complete(T),
    Incomplete,
    Invalid(String),
}

/// Encode `msg` with its frame header.
pub fn encode_frame<M: Message>(msg: &M) -> Bytes {
    let len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // Encoding into a buffer sized by encoded_len cannot run out of space.
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

/// Take one frame payload off the front of `buffer`.
pub fn decode_frame(buffer: &mut BytesMut) -> DecodeResult<Bytes> {
    if buffer.len() < HEADER_LEN {
        return DecodeResult::Incomplete;
    }
    let flag = buffer[0];
    if flag != 0 {
        return DecodeResult::Invalid(format!("unsupported frame flag {}", flag));
    }
    let len = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return DecodeResult::Invalid(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        ));
    }
    if buffer.len() < HEADER_LEN + len {
        return DecodeResult::Incomplete;
    }
    buffer.advance(HEADER_LEN);
    DecodeResult::Complete(buffer.split_to(len).freeze())
}

/// A stream carrying framed protobuf messages.
pub struct FramedStream {
    stream: BoxedStream,
    read_buf: BytesMut,
}

impl FramedStream {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> CoordinatorResult<()> {
        let frame = encode_frame(msg);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next message, or `None` on a clean end of stream.
    pub async fn recv<M: Message + Default>(&mut self) -> CoordinatorResult<Option<M>> {
        loop {
            match decode_frame(&mut self.read_buf) {
                DecodeResult::Complete(payload) => return Ok(Some(M::decode(payload)?)),
                DecodeResult::Invalid(reason) => return Err(CoordinatorError::internal(reason)),
                DecodeResult::Incomplete => {}
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(CoordinatorError::unavailable(format!(
                    "connection closed with {} bytes of a partial frame",
                    self.read_buf.len()
                )));
            }
        }
    }

    pub async fn shutdown(&mut self) -> CoordinatorResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
