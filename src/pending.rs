//! In-flight operations.
//!
//! A pending op records everything needed to recognize and handle the
//! response to one dispatched request: the channel it went out on, the
//! entity and instance it targeted, the nonce identifying it on that
//! channel, and the variant-specific completion state. Exactly three
//! variants exist; the event pump drives them through the queue.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::channel::ChannelRef;
use crate::error::{ReturnCode, WireError};
use crate::types::{EntityId, Instance, NetMsgType, NetReturnCode};
use crate::wire;

pub(crate) type GetCallback = Box<dyn FnOnce(ReturnCode, Vec<Bytes>)>;
pub(crate) type MutateCallback = Box<dyn FnOnce(ReturnCode)>;

/// Search callbacks fire once per item, so the closure is `FnMut`, and one
/// search fans out to an op per matched entity, so all of them share it.
pub(crate) type SearchCallback = Rc<RefCell<dyn FnMut(ReturnCode, Bytes, Vec<Bytes>)>>;

/// Variant-specific state of a pending operation.
pub(crate) enum OpKind {
    Get {
        callback: GetCallback,
    },
    /// Put, delete, and update each await one status-only response whose
    /// type must match exactly.
    Mutate {
        expected: NetMsgType,
        callback: MutateCallback,
    },
    Search {
        search_id: u64,
        callback: SearchCallback,
    },
}

/// One in-flight request.
pub(crate) struct PendingOp {
    pub(crate) chan: ChannelRef,
    pub(crate) ent: EntityId,
    pub(crate) inst: Instance,
    pub(crate) nonce: u64,
    pub(crate) reconfigured: bool,
    pub(crate) kind: OpKind,
}

impl PendingOp {
    pub(crate) fn new(
        chan: ChannelRef,
        ent: EntityId,
        inst: Instance,
        nonce: u64,
        kind: OpKind,
    ) -> Self {
        Self {
            chan,
            ent,
            inst,
            nonce,
            reconfigured: false,
            kind,
        }
    }

    /// Deliver a terminal failure.
    pub(crate) fn fail(self, code: ReturnCode) {
        trace!(%code, entity = %self.ent, nonce = self.nonce, "pending op failed");
        fail_kind(self.kind, code);
    }

    /// Deliver the matched response for a get or mutate op. Search responses
    /// never reach here; the event pump handles their continuation protocol.
    pub(crate) fn deliver(self, msg_type: NetMsgType, payload: Bytes) {
        match self.kind {
            OpKind::Get { callback } => {
                let (code, value) = decode_get_response(msg_type, payload);
                callback(code, value);
            }
            OpKind::Mutate { expected, callback } => {
                callback(decode_mutate_response(expected, msg_type, payload));
            }
            OpKind::Search { callback, .. } => {
                (&mut *callback.borrow_mut())(ReturnCode::LogicError, Bytes::new(), Vec::new());
            }
        }
    }
}

/// Fail an op that was never enqueued (or was just dequeued).
pub(crate) fn fail_kind(kind: OpKind, code: ReturnCode) {
    match kind {
        OpKind::Get { callback } => callback(code, Vec::new()),
        OpKind::Mutate { callback, .. } => callback(code),
        OpKind::Search { callback, .. } => {
            (&mut *callback.borrow_mut())(code, Bytes::new(), Vec::new());
        }
    }
}

/// Read the leading status word of a response payload.
pub(crate) fn decode_status(payload: &mut Bytes) -> Result<NetReturnCode, WireError> {
    if payload.remaining() < 2 {
        return Err(WireError::Truncated {
            need: 2,
            have: payload.remaining(),
        });
    }
    Ok(NetReturnCode::from_wire(payload.get_u16()))
}

pub(crate) fn map_status(status: NetReturnCode) -> ReturnCode {
    match status {
        NetReturnCode::Success => ReturnCode::Success,
        NetReturnCode::NotFound => ReturnCode::NotFound,
        NetReturnCode::WrongArity => ReturnCode::WrongArity,
        NetReturnCode::NotUs => ReturnCode::LogicError,
        NetReturnCode::ServerError => ReturnCode::ServerError,
    }
}

pub(crate) fn decode_get_response(msg_type: NetMsgType, mut payload: Bytes) -> (ReturnCode, Vec<Bytes>) {
    if msg_type != NetMsgType::RespGet {
        return (ReturnCode::ServerError, Vec::new());
    }
    let status = match decode_status(&mut payload) {
        Ok(status) => status,
        Err(_) => return (ReturnCode::ServerError, Vec::new()),
    };
    match status {
        NetReturnCode::Success => match wire::get_buffer_vec(&mut payload) {
            Ok(value) => (ReturnCode::Success, value),
            Err(_) => (ReturnCode::ServerError, Vec::new()),
        },
        other => (map_status(other), Vec::new()),
    }
}

pub(crate) fn decode_mutate_response(
    expected: NetMsgType,
    msg_type: NetMsgType,
    mut payload: Bytes,
) -> ReturnCode {
    if msg_type != expected {
        return ReturnCode::ServerError;
    }
    match decode_status(&mut payload) {
        Ok(status) => map_status(status),
        Err(_) => ReturnCode::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn get_payload(status: u16, values: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(status);
        let values: Vec<Bytes> = values.iter().map(|v| Bytes::copy_from_slice(v)).collect();
        wire::put_buffer_vec(&mut buf, &values);
        buf.freeze()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status(NetReturnCode::Success), ReturnCode::Success);
        assert_eq!(map_status(NetReturnCode::NotFound), ReturnCode::NotFound);
        assert_eq!(map_status(NetReturnCode::WrongArity), ReturnCode::WrongArity);
        assert_eq!(map_status(NetReturnCode::NotUs), ReturnCode::LogicError);
        assert_eq!(map_status(NetReturnCode::ServerError), ReturnCode::ServerError);
    }

    #[test]
    fn get_success_decodes_value() {
        let (code, value) = decode_get_response(
            NetMsgType::RespGet,
            get_payload(0, &[b"alice", b"a@x"]),
        );
        assert_eq!(code, ReturnCode::Success);
        assert_eq!(value, vec![Bytes::from_static(b"alice"), Bytes::from_static(b"a@x")]);
    }

    #[test]
    fn get_not_found_has_no_value() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        let (code, value) = decode_get_response(NetMsgType::RespGet, buf.freeze());
        assert_eq!(code, ReturnCode::NotFound);
        assert!(value.is_empty());
    }

    #[test]
    fn get_wrong_type_is_server_error() {
        let (code, _) = decode_get_response(NetMsgType::RespPut, get_payload(0, &[]));
        assert_eq!(code, ReturnCode::ServerError);
    }

    #[test]
    fn get_truncated_payload_is_server_error() {
        let (code, _) = decode_get_response(NetMsgType::RespGet, Bytes::from_static(&[0]));
        assert_eq!(code, ReturnCode::ServerError);

        // Status claims success but the value vector is missing.
        let (code, _) = decode_get_response(NetMsgType::RespGet, Bytes::from_static(&[0, 0]));
        assert_eq!(code, ReturnCode::ServerError);
    }

    #[test]
    fn mutate_checks_exact_response_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        let payload = buf.freeze();

        assert_eq!(
            decode_mutate_response(NetMsgType::RespPut, NetMsgType::RespPut, payload.clone()),
            ReturnCode::Success
        );
        assert_eq!(
            decode_mutate_response(NetMsgType::RespPut, NetMsgType::RespDel, payload),
            ReturnCode::ServerError
        );
    }
}
