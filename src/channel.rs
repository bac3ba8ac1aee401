//! Channels: one TCP connection per server instance.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::types::{EntityId, Instance};

/// Upper bound on a single frame; anything larger is a corrupt size field.
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// A connection to one server instance.
///
/// The channel exclusively owns its socket, the per-connection nonce counter,
/// and the entity id learned from the first response. It is shared by
/// reference among every pending operation dispatched over it; the last
/// reference releases the socket.
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) sock: TcpStream,
    pub(crate) id: EntityId,
    nonce: u64,
}

pub(crate) type ChannelRef = Rc<RefCell<Channel>>;

/// Result of attempting to read one frame off a channel.
pub(crate) enum FrameRead {
    /// Fewer than four size bytes buffered; try again after the next poll.
    NotReady,
    /// The peer closed the connection.
    Closed,
    /// One complete frame, size field included.
    Frame(Vec<u8>),
}

impl Channel {
    pub(crate) fn connect(inst: &Instance) -> io::Result<Self> {
        let sock = TcpStream::connect(inst.inbound)?;
        sock.set_nodelay(true)?;
        Ok(Self {
            sock,
            id: EntityId::client(),
            nonce: 1,
        })
    }

    /// Allocate the next request nonce on this channel.
    pub(crate) fn next_nonce(&mut self) -> u64 {
        let nonce = self.nonce;
        self.nonce += 1;
        nonce
    }

    pub(crate) fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sock.write_all(frame)
    }

    /// Read one frame. Callers must have observed readability first: the
    /// size peek consumes nothing and returns whatever is buffered, and the
    /// body read blocks until the frame completes.
    pub(crate) fn read_frame(&mut self) -> io::Result<FrameRead> {
        let mut size_buf = [0u8; 4];
        let peeked = match self.sock.peek(&mut size_buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FrameRead::NotReady),
            Err(e) => return Err(e),
        };
        if peeked == 0 {
            return Ok(FrameRead::Closed);
        }
        if peeked < 4 {
            return Ok(FrameRead::NotReady);
        }

        // The size field excludes its own four bytes.
        let size = u32::from_be_bytes(size_buf) as usize + 4;
        if size > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {size} bytes exceeds limit"),
            ));
        }

        let mut frame = vec![0u8; size];
        self.sock.read_exact(&mut frame)?;
        trace!(bytes = size, "frame read");
        Ok(FrameRead::Frame(frame))
    }
}

/// Instance-keyed channel table with lazy creation.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    channels: HashMap<Instance, ChannelRef>,
}

impl ChannelTable {
    /// The channel to an instance, opening one if none exists. A failed
    /// open inserts nothing.
    pub(crate) fn get_or_create(&mut self, inst: &Instance) -> io::Result<ChannelRef> {
        if let Some(chan) = self.channels.get(inst) {
            return Ok(chan.clone());
        }

        let chan = Rc::new(RefCell::new(Channel::connect(inst)?));
        debug!(
            instance = %inst.inbound,
            version = inst.inbound_version,
            "channel opened"
        );
        self.channels.insert(inst.clone(), chan.clone());
        Ok(chan)
    }

    /// Drop the table's reference to an instance's channel. Pending ops
    /// still holding the channel keep the socket alive only long enough to
    /// observe the failure.
    pub(crate) fn evict(&mut self, inst: &Instance) {
        if self.channels.remove(inst).is_some() {
            debug!(instance = %inst.inbound, "channel evicted");
        }
    }

    pub(crate) fn contains(&self, inst: &Instance) -> bool {
        self.channels.contains_key(inst)
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, Header};
    use crate::types::NetMsgType;
    use std::io::Write as _;
    use std::net::TcpListener;

    fn listener() -> (TcpListener, Instance) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let inst = Instance::new(listener.local_addr().unwrap(), 1);
        (listener, inst)
    }

    #[test]
    fn connect_initializes_channel() {
        let (listener, inst) = listener();
        let mut chan = Channel::connect(&inst).unwrap();
        let _accepted = listener.accept().unwrap();

        assert!(chan.id.is_client());
        assert_eq!(chan.next_nonce(), 1);
        assert_eq!(chan.next_nonce(), 2);
        assert_eq!(chan.next_nonce(), 3);
    }

    #[test]
    fn connect_failure_is_an_error() {
        let (listener, inst) = listener();
        drop(listener);
        assert!(Channel::connect(&inst).is_err());
    }

    #[test]
    fn read_frame_reads_exactly_one_frame() {
        let (listener, inst) = listener();
        let mut chan = Channel::connect(&inst).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let header = Header {
            msg_type: NetMsgType::RespPut,
            fromver: 1,
            tover: 0,
            from: EntityId::new(1, 0, 1),
            to: EntityId::client(),
            nonce: 1,
        };
        let frame = wire::encode_frame(&header, &[0, 0]);
        server.write_all(&frame).unwrap();
        server.write_all(&frame).unwrap();

        match chan.read_frame().unwrap() {
            FrameRead::Frame(read) => assert_eq!(read, frame.to_vec()),
            _ => panic!("expected a frame"),
        }
        match chan.read_frame().unwrap() {
            FrameRead::Frame(read) => assert_eq!(read, frame.to_vec()),
            _ => panic!("expected a second frame"),
        }
    }

    #[test]
    fn read_frame_reports_closed_peer() {
        let (listener, inst) = listener();
        let mut chan = Channel::connect(&inst).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        assert!(matches!(chan.read_frame().unwrap(), FrameRead::Closed));
    }

    #[test]
    fn table_reuses_and_evicts() {
        let (listener, inst) = listener();
        let mut table = ChannelTable::default();

        let a = table.get_or_create(&inst).unwrap();
        let _accepted = listener.accept().unwrap();
        let b = table.get_or_create(&inst).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);

        table.evict(&inst);
        assert!(!table.contains(&inst));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn table_does_not_cache_failed_opens() {
        let (listener, inst) = listener();
        drop(listener);

        let mut table = ChannelTable::default();
        assert!(table.get_or_create(&inst).is_err());
        assert!(!table.contains(&inst));
    }
}
