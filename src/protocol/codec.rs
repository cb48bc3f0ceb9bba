use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Message;

/// Frames with a payload larger than this are rejected as malformed.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Width of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Encode one message as a length-prefixed CBOR frame.
pub fn encode(message: &Message) -> Result<Bytes> {
    let payload = serde_cbor::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        bail!(
            "frame payload is {} bytes, cap is {}",
            payload.len(),
            MAX_FRAME_BYTES
        );
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder.
///
/// The transport may deliver arbitrary byte ranges; callers feed whatever
/// arrived and poll [`try_next`](FrameDecoder::try_next) until it reports
/// that more data is needed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` means the byte stream
    /// is malformed (oversized length prefix, or a payload that does not
    /// parse as a tagged [`Message`]); the connection carrying it must be
    /// closed.
    pub fn try_next(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > MAX_FRAME_BYTES {
            bail!("frame length prefix {} exceeds cap {}", length, MAX_FRAME_BYTES);
        }

        if self.buf.len() < LENGTH_PREFIX_BYTES + length {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_BYTES);
        let payload = self.buf.split_to(length);

        let message = serde_cbor::from_slice(&payload)
            .map_err(|err| anyhow!("failed to decode frame payload: {err}"))?;
        Ok(Some(message))
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
