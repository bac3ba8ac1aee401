//! Frame codec and payload primitives for the Tessella wire protocol.
//!
//! Every frame is a fixed header followed by a message-specific payload:
//!
//! ```text
//! [size u32 BE][type u8][fromver u16][tover u16][from][to][nonce u64][payload]
//! ```
//!
//! `size` counts everything after itself, so a complete frame occupies
//! `size + 4` bytes on the wire. Integer widths and byte order are fixed by
//! the cluster; there is no negotiation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::types::{EntityId, NetMsgType};

/// Bytes in the fixed header after the size field.
pub const HEADER_LEN: usize = 1 + 2 + 2 + EntityId::WIRE_LEN * 2 + 8;

/// The fixed frame header, minus the size field it travels behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type.
    pub msg_type: NetMsgType,
    /// Sender's protocol version.
    pub fromver: u16,
    /// Recipient's protocol version.
    pub tover: u16,
    /// Sending entity.
    pub from: EntityId,
    /// Receiving entity.
    pub to: EntityId,
    /// Per-channel request identifier.
    pub nonce: u64,
}

/// Encode a complete frame, size field included.
pub fn encode_frame(header: &Header, payload: &[u8]) -> BytesMut {
    let size = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(size as u32);
    buf.put_u8(header.msg_type as u8);
    buf.put_u16(header.fromver);
    buf.put_u16(header.tover);
    header.from.encode(&mut buf);
    header.to.encode(&mut buf);
    buf.put_u64(header.nonce);
    buf.put_slice(payload);
    buf
}

/// Decode a complete frame (size field included) into header and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(Header, Bytes), WireError> {
    if frame.len() < 4 + HEADER_LEN {
        return Err(WireError::Truncated {
            need: 4 + HEADER_LEN,
            have: frame.len(),
        });
    }

    let mut buf = Bytes::copy_from_slice(frame);
    let size = buf.get_u32() as usize;
    if size != frame.len() - 4 {
        return Err(WireError::SizeMismatch {
            claimed: size,
            actual: frame.len() - 4,
        });
    }

    let msg_type = NetMsgType::try_from(buf.get_u8())?;
    let fromver = buf.get_u16();
    let tover = buf.get_u16();
    let from = EntityId::decode(&mut buf)?;
    let to = EntityId::decode(&mut buf)?;
    let nonce = buf.get_u64();

    let header = Header {
        msg_type,
        fromver,
        tover,
        from,
        to,
        nonce,
    };
    Ok((header, buf))
}

/// Append a length-prefixed byte string.
pub fn put_buffer(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Read a length-prefixed byte string.
pub fn get_buffer(buf: &mut Bytes) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: buf.remaining(),
        });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            need: len,
            have: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

/// Append a counted sequence of length-prefixed byte strings.
pub fn put_buffer_vec(buf: &mut BytesMut, items: &[Bytes]) {
    buf.put_u16(items.len() as u16);
    for item in items {
        put_buffer(buf, item);
    }
}

/// Read a counted sequence of length-prefixed byte strings.
pub fn get_buffer_vec(buf: &mut Bytes) -> Result<Vec<Bytes>, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated {
            need: 2,
            have: buf.remaining(),
        });
    }
    let count = buf.get_u16() as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(get_buffer(buf)?);
    }
    Ok(items)
}

/// A fixed-length bitfield, one bit per value dimension.
///
/// Bit `i` covers dimension `i + 1` of the owning space; bits are packed
/// LSB-first within each byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: usize,
    bytes: Vec<u8>,
}

impl Bitfield {
    /// An all-clear bitfield of `bits` bits.
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            bytes: vec![0; (bits + 7) / 8],
        }
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Whether the field has zero bits.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Set bit `idx`.
    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.bits);
        self.bytes[idx / 8] |= 1 << (idx % 8);
    }

    /// Clear bit `idx`.
    pub fn unset(&mut self, idx: usize) {
        assert!(idx < self.bits);
        self.bytes[idx / 8] &= !(1 << (idx % 8));
    }

    /// Read bit `idx`.
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.bits);
        self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Append the bitfield: bit count, then the packed bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.bits as u32);
        buf.put_slice(&self.bytes);
    }

    /// Read a bitfield encoded by [`Bitfield::encode`].
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < 4 {
            return Err(WireError::Truncated {
                need: 4,
                have: buf.remaining(),
            });
        }
        let bits = buf.get_u32() as usize;
        let nbytes = (bits + 7) / 8;
        if buf.remaining() < nbytes {
            return Err(WireError::Truncated {
                need: nbytes,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            bits,
            bytes: buf.split_to(nbytes).to_vec(),
        })
    }
}
