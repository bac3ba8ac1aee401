//! Core identifiers and wire-level constants for the Tessella cluster.

use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Cluster-assigned identifier of a space.
pub type SpaceId = u32;

/// Reserved space id meaning "no such space".
pub const NULLSPACE: SpaceId = SpaceId::MAX;

/// Reserved space id housing client-side entities.
///
/// A channel starts out addressed as the anonymous client entity
/// ([`EntityId::client`]) and adopts the `to` field of the first response it
/// receives as its real identity.
pub const CLIENTSPACE: SpaceId = SpaceId::MAX - 1;

/// Identifier of a logical role (a replica slot) within the cluster.
///
/// Entities are what messages are addressed to; the current
/// [`Configuration`](crate::Configuration) maps each entity to the physical
/// [`Instance`] serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    /// Space this entity serves.
    pub space: SpaceId,
    /// Subspace within the space.
    pub subspace: u16,
    /// Slot number within the subspace.
    pub number: u32,
}

impl EntityId {
    /// Serialized width of an entity id on the wire.
    pub const WIRE_LEN: usize = 4 + 2 + 4;

    /// Create an entity id.
    pub const fn new(space: SpaceId, subspace: u16, number: u32) -> Self {
        Self {
            space,
            subspace,
            number,
        }
    }

    /// The anonymous client entity: "this client's id is not yet known".
    pub const fn client() -> Self {
        Self::new(CLIENTSPACE, 0, 0)
    }

    /// Whether this is the anonymous client entity.
    pub fn is_client(&self) -> bool {
        *self == Self::client()
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.space);
        buf.put_u16(self.subspace);
        buf.put_u32(self.number);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < Self::WIRE_LEN {
            return Err(WireError::Truncated {
                need: Self::WIRE_LEN,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            space: buf.get_u32(),
            subspace: buf.get_u16(),
            number: buf.get_u32(),
        })
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.space, self.subspace, self.number)
    }
}

/// A physical endpoint: where an entity's server listens, plus the protocol
/// compatibility tag requests to it must carry in `tover`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    /// Inbound network endpoint.
    pub inbound: SocketAddr,
    /// Protocol compatibility tag.
    pub inbound_version: u16,
}

impl Instance {
    /// Create an instance record.
    pub fn new(inbound: SocketAddr, inbound_version: u16) -> Self {
        Self {
            inbound,
            inbound_version,
        }
    }
}

/// Network message types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetMsgType {
    ReqGet = 0x10,
    RespGet = 0x11,
    ReqPut = 0x12,
    RespPut = 0x13,
    ReqDel = 0x14,
    RespDel = 0x15,
    ReqUpdate = 0x16,
    RespUpdate = 0x17,
    ReqSearchStart = 0x20,
    ReqSearchNext = 0x21,
    RespSearchItem = 0x22,
    RespSearchDone = 0x23,
}

impl TryFrom<u8> for NetMsgType {
    type Error = WireError;

    fn try_from(raw: u8) -> Result<Self, WireError> {
        match raw {
            0x10 => Ok(Self::ReqGet),
            0x11 => Ok(Self::RespGet),
            0x12 => Ok(Self::ReqPut),
            0x13 => Ok(Self::RespPut),
            0x14 => Ok(Self::ReqDel),
            0x15 => Ok(Self::RespDel),
            0x16 => Ok(Self::ReqUpdate),
            0x17 => Ok(Self::RespUpdate),
            0x20 => Ok(Self::ReqSearchStart),
            0x21 => Ok(Self::ReqSearchNext),
            0x22 => Ok(Self::RespSearchItem),
            0x23 => Ok(Self::RespSearchDone),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }
}

/// Status codes servers embed in response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NetReturnCode {
    Success = 0,
    NotFound = 1,
    WrongArity = 2,
    NotUs = 3,
    ServerError = 4,
}

impl NetReturnCode {
    /// Decode a status code. Unknown values collapse to `ServerError`.
    pub fn from_wire(raw: u16) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::WrongArity,
            3 => Self::NotUs,
            _ => Self::ServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn entity_id_round_trip() {
        let ent = EntityId::new(7, 3, 42);
        let mut buf = BytesMut::new();
        ent.encode(&mut buf);
        assert_eq!(buf.len(), EntityId::WIRE_LEN);

        let mut buf = buf.freeze();
        assert_eq!(EntityId::decode(&mut buf).unwrap(), ent);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn entity_id_truncated() {
        let mut buf = Bytes::from_static(&[0u8; 4]);
        assert!(matches!(
            EntityId::decode(&mut buf),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn client_sentinel() {
        assert!(EntityId::client().is_client());
        assert!(!EntityId::new(CLIENTSPACE, 0, 7).is_client());
        assert!(!EntityId::new(1, 0, 0).is_client());
    }

    #[test]
    fn msg_type_round_trip() {
        for raw in [0x10u8, 0x17, 0x20, 0x23] {
            let ty = NetMsgType::try_from(raw).unwrap();
            assert_eq!(ty as u8, raw);
        }
        assert!(NetMsgType::try_from(0xff).is_err());
    }

    #[test]
    fn net_returncode_unknown_is_server_error() {
        assert_eq!(NetReturnCode::from_wire(0), NetReturnCode::Success);
        assert_eq!(NetReturnCode::from_wire(999), NetReturnCode::ServerError);
    }
}
