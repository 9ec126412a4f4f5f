//! Framing: MessagePack values in and out of a continuous byte stream.
//!
//! MessagePack is self-delimiting, so there is no length prefix. The decoder
//! keeps a carry-over buffer and a size scanner that walks markers and
//! length fields as bytes arrive. A value is only materialized once the
//! scanner has seen its last byte, so every byte is scanned once no matter
//! how the value is split across chunks.

use bytes::{Bytes, BytesMut};
use rmp::Marker;

use crate::{DecodeError, EncodeError, RpcMessage};

/// Encode a message into the bytes written on the wire.
pub fn encode_message(message: RpcMessage) -> Result<Bytes, EncodeError> {
    let value = message.into_value();
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &value)
        .map_err(|e| EncodeError::EncodeFailed(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Streaming decoder for [`RpcMessage`]s.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
    scanner: ValueScanner,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes held back waiting for the rest of a message.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, or `None` if only a partial message
    /// (or nothing) is buffered.
    ///
    /// An error leaves the decoder in an unusable state; the stream cannot
    /// be resynchronized after malformed input.
    pub fn next_message(&mut self) -> Result<Option<RpcMessage>, DecodeError> {
        let Some(len) = self.scanner.scan(&self.buf)? else {
            return Ok(None);
        };

        let frame = self.buf.split_to(len);
        let value = rmpv::decode::read_value(&mut &frame[..])
            .map_err(|e| DecodeError::InvalidData(e.to_string()))?;
        RpcMessage::from_value(value).map(Some)
    }

    /// Feed one chunk and drain every message it completes, in order.
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Result<Vec<RpcMessage>, DecodeError> {
        self.extend(chunk);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }
}

/// Finds where the next top-level value ends without building it.
///
/// State survives between calls: `scanned` bytes at the front of the buffer
/// are known to be whole items, and `pending` more items are needed to close
/// every open array and map.
#[derive(Debug, Default)]
struct ValueScanner {
    scanned: usize,
    pending: u64,
}

impl ValueScanner {
    /// Length of the first complete value in `buf`, or `None` until the
    /// rest of it arrives.
    fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if self.pending == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            self.scanned = 0;
            self.pending = 1;
        }

        while self.pending > 0 {
            let Some((len, children)) = item_extent(&buf[self.scanned..])? else {
                return Ok(None);
            };
            self.scanned += len;
            self.pending = self.pending - 1 + children;
        }

        let end = self.scanned;
        self.scanned = 0;
        Ok(Some(end))
    }
}

enum Layout {
    /// Marker followed by a fixed number of bytes.
    Fixed(u64),
    /// Marker, big-endian length of `width` bytes, `extra` header bytes,
    /// then `length` payload bytes.
    Sized { width: usize, extra: u64 },
    /// Marker and a big-endian count of `width` bytes; `per` items follow for
    /// each counted entry.
    Collection { width: usize, per: u64 },
    FixCollection { count: u64, per: u64 },
}

/// Size of the item at the front of `buf` (header plus scalar payload) and
/// the number of nested items that follow it. `None` if the header or the
/// payload is not fully buffered yet.
fn item_extent(buf: &[u8]) -> Result<Option<(usize, u64)>, DecodeError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let layout = match Marker::from_u8(first) {
        Marker::Reserved => {
            return Err(DecodeError::InvalidData(format!(
                "reserved marker {first:#04x}"
            )));
        }
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Layout::Fixed(0)
        }
        Marker::U8 | Marker::I8 => Layout::Fixed(1),
        Marker::U16 | Marker::I16 | Marker::FixExt1 => Layout::Fixed(2),
        Marker::FixExt2 => Layout::Fixed(3),
        Marker::U32 | Marker::I32 | Marker::F32 => Layout::Fixed(4),
        Marker::FixExt4 => Layout::Fixed(5),
        Marker::U64 | Marker::I64 | Marker::F64 => Layout::Fixed(8),
        Marker::FixExt8 => Layout::Fixed(9),
        Marker::FixExt16 => Layout::Fixed(17),
        Marker::FixStr(len) => Layout::Fixed(len.into()),
        Marker::Str8 | Marker::Bin8 => Layout::Sized { width: 1, extra: 0 },
        Marker::Str16 | Marker::Bin16 => Layout::Sized { width: 2, extra: 0 },
        Marker::Str32 | Marker::Bin32 => Layout::Sized { width: 4, extra: 0 },
        Marker::Ext8 => Layout::Sized { width: 1, extra: 1 },
        Marker::Ext16 => Layout::Sized { width: 2, extra: 1 },
        Marker::Ext32 => Layout::Sized { width: 4, extra: 1 },
        Marker::FixArray(count) => Layout::FixCollection {
            count: count.into(),
            per: 1,
        },
        Marker::FixMap(count) => Layout::FixCollection {
            count: count.into(),
            per: 2,
        },
        Marker::Array16 => Layout::Collection { width: 2, per: 1 },
        Marker::Array32 => Layout::Collection { width: 4, per: 1 },
        Marker::Map16 => Layout::Collection { width: 2, per: 2 },
        Marker::Map32 => Layout::Collection { width: 4, per: 2 },
    };

    let (len, children) = match layout {
        Layout::Fixed(payload) => (1 + payload, 0),
        Layout::FixCollection { count, per } => (1, count * per),
        Layout::Sized { width, extra } => {
            let Some(payload) = read_length(buf, width) else {
                return Ok(None);
            };
            (1 + width as u64 + extra + payload, 0)
        }
        Layout::Collection { width, per } => {
            let Some(count) = read_length(buf, width) else {
                return Ok(None);
            };
            (1 + width as u64, count * per)
        }
    };

    if (buf.len() as u64) < len {
        return Ok(None);
    }
    Ok(Some((len as usize, children)))
}

/// Big-endian length field right after the marker.
fn read_length(buf: &[u8], width: usize) -> Option<u64> {
    buf.get(1..1 + width)
        .map(|bytes| bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)))
}
