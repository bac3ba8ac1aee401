//! Test utilities: a scriptable server instance and payload builders.
//!
//! [`MockInstance`] plays the role of one Tessella server: it accepts
//! channel connections, decodes request frames, records them, and answers
//! with whatever a test's responder script says. Addressing is handled the
//! way real servers do it: responses go back under the request's nonce,
//! `from` is the entity the request targeted, and clients that have not yet
//! been assigned an id get [`assigned_client_id`].

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{EntityId, Instance, NetMsgType, NetReturnCode, CLIENTSPACE};
use crate::wire::{self, Header};


/// What a responder tells the mock to do with one request.
pub enum MockReply {
    /// Frame a response of this type and payload, addressed back under the
    /// request's nonce.
    Frame(NetMsgType, Vec<u8>),
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Close the connection.
    Hangup,
}

type Responder = Box<dyn FnMut(&Header, &[u8]) -> Vec<MockReply> + Send>;

/// The entity id the mock assigns to an anonymous client.
pub fn assigned_client_id() -> EntityId {
    EntityId::new(CLIENTSPACE, 0, 1)
}

/// A fake server instance driven by a responder script.
pub struct MockInstance {
    instance: Instance,
    shutdown: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<(Header, Vec<u8>)>>>,
    handle: Option<JoinHandle<()>>,
}

impl MockInstance {
    /// Bind an ephemeral port and serve connections on a background thread.
    pub fn spawn<F>(inbound_version: u16, responder: F) -> Self
    where
        F: FnMut(&Header, &[u8]) -> Vec<MockReply> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
        listener
            .set_nonblocking(true)
            .expect("nonblocking mock listener");
        let instance = Instance::new(listener.local_addr().unwrap(), inbound_version);

        let shutdown = Arc::new(AtomicBool::new(false));
        let requests: Arc<Mutex<Vec<(Header, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = thread::spawn({
            let shutdown = shutdown.clone();
            let requests = requests.clone();
            let mut responder: Responder = Box::new(responder);
            move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            serve(stream, inbound_version, &shutdown, &requests, &mut responder)
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Self {
            instance,
            shutdown,
            requests,
            handle: Some(handle),
        }
    }

    /// The address record clients should dial.
    pub fn instance(&self) -> Instance {
        self.instance.clone()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<(Header, Vec<u8>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Block until `count` requests have arrived, or panic after `timeout`.
    pub fn await_requests(&self, count: usize, timeout: Duration) {
        let start = Instant::now();
        while self.request_count() < count {
            if start.elapsed() > timeout {
                panic!(
                    "mock saw {} of {count} expected requests within {timeout:?}",
                    self.request_count()
                );
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Drop for MockInstance {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum ReadStatus {
    Ok,
    Closed,
}

fn read_full(stream: &mut TcpStream, buf: &mut [u8], shutdown: &AtomicBool) -> ReadStatus {
    let mut filled = 0;
    while filled < buf.len() {
        if shutdown.load(Ordering::Relaxed) {
            return ReadStatus::Closed;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return ReadStatus::Closed,
            Ok(n) => filled += n,
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return ReadStatus::Closed,
        }
    }
    ReadStatus::Ok
}

fn serve(
    mut stream: TcpStream,
    inbound_version: u16,
    shutdown: &AtomicBool,
    requests: &Mutex<Vec<(Header, Vec<u8>)>>,
    responder: &mut Responder,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(20)))
        .expect("mock read timeout");

    loop {
        let mut size_buf = [0u8; 4];
        if matches!(read_full(&mut stream, &mut size_buf, shutdown), ReadStatus::Closed) {
            return;
        }
        let size = u32::from_be_bytes(size_buf) as usize;
        let mut rest = vec![0u8; size];
        if matches!(read_full(&mut stream, &mut rest, shutdown), ReadStatus::Closed) {
            return;
        }

        let mut frame = size_buf.to_vec();
        frame.extend_from_slice(&rest);
        let (header, payload) = match wire::decode_frame(&frame) {
            Ok(parts) => parts,
            Err(_) => return,
        };
        requests.lock().unwrap().push((header, payload.to_vec()));

        for reply in responder(&header, &payload) {
            match reply {
                MockReply::Frame(msg_type, body) => {
                    let to = if header.from.is_client() {
                        assigned_client_id()
                    } else {
                        header.from
                    };
                    let resp = Header {
                        msg_type,
                        fromver: inbound_version,
                        tover: 0,
                        from: header.to,
                        to,
                        nonce: header.nonce,
                    };
                    if stream.write_all(&wire::encode_frame(&resp, &body)).is_err() {
                        return;
                    }
                }
                MockReply::Raw(bytes) => {
                    if stream.write_all(&bytes).is_err() {
                        return;
                    }
                }
                MockReply::Hangup => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }
    }
}

/// Payload of a status-only response (put / del / update).
pub fn status_payload(code: NetReturnCode) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(code as u16);
    buf.to_vec()
}

/// Payload of a get response.
pub fn get_payload(code: NetReturnCode, value: &[&[u8]]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(code as u16);
    let value: Vec<Bytes> = value.iter().map(|v| Bytes::copy_from_slice(v)).collect();
    wire::put_buffer_vec(&mut buf, &value);
    buf.to_vec()
}

/// Payload of a search item response.
pub fn item_payload(key: &[u8], value: &[&[u8]]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_buffer(&mut buf, key);
    let value: Vec<Bytes> = value.iter().map(|v| Bytes::copy_from_slice(v)).collect();
    wire::put_buffer_vec(&mut buf, &value);
    buf.to_vec()
}
