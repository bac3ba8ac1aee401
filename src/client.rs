//! The Tessella client: dispatcher, event pump, and public operations.
//!
//! One `Client` owns the coordinator link, the cached configuration
//! snapshot, the channel table, and the pending-op queue, and mutates them
//! only from the caller's thread. Dispatch entry points resolve a target and
//! write the request without ever suspending; responses are read, matched,
//! and delivered by [`flush`](Client::flush) / [`flush_one`](Client::flush_one).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelRef, ChannelTable, FrameRead};
use crate::config::Configuration;
use crate::coordinator::{CoordinatorLink, LinkStatus};
use crate::error::{ReturnCode, WireError};
use crate::pending::{fail_kind, OpKind, PendingOp, SearchCallback};
use crate::search::SearchPredicate;
use crate::types::{EntityId, Instance, NetMsgType, NULLSPACE};
use crate::wire::{self, Bitfield, Header};

/// Reconnect attempts against a dead coordinator before giving up.
const COORD_RECONNECTS: usize = 7;

/// A named row, as returned by the blocking search driver.
pub type Row = HashMap<String, Bytes>;

/// What became of a response frame during queue matching.
enum Delivery {
    /// A callback fired; the pump reports progress to its caller.
    CalledBack,
    /// The frame was consumed without a callback (stream end, or no match).
    Quiet,
}

/// A client of one Tessella cluster.
///
/// All state lives on the caller's thread; there are no background threads
/// and no locks. Operations dispatch synchronously and complete through
/// their callbacks when the event pump observes the response.
pub struct Client {
    coord: Box<dyn CoordinatorLink>,
    config: Arc<Configuration>,
    channels: ChannelTable,
    requests: VecDeque<Option<PendingOp>>,
    search_id: u64,
}

impl Client {
    /// Create a client over the given coordinator link.
    pub fn new(coord: Box<dyn CoordinatorLink>) -> Self {
        Self {
            coord,
            config: Arc::new(Configuration::default()),
            channels: ChannelTable::default(),
            requests: VecDeque::new(),
            search_id: 1,
        }
    }

    /// Connect the coordinator link and install the initial configuration.
    pub fn connect(&mut self) -> ReturnCode {
        match self.coord.connect() {
            LinkStatus::Success => {}
            LinkStatus::ConnectFail => return ReturnCode::CoordFail,
            LinkStatus::Disconnect | LinkStatus::Shutdown | LinkStatus::LogicError => {
                return ReturnCode::LogicError
            }
        }

        loop {
            match self.coord.step(None) {
                LinkStatus::Success => {}
                LinkStatus::ConnectFail | LinkStatus::Disconnect => return ReturnCode::CoordFail,
                LinkStatus::Shutdown | LinkStatus::LogicError => return ReturnCode::LogicError,
            }

            if self.coord.unacknowledged() {
                self.config = self.coord.config();
                self.coord.acknowledge();
                debug!(
                    version = self.config.version(),
                    "initial configuration installed"
                );
                return ReturnCode::Success;
            }
        }
    }

    /// The configuration snapshot the client currently routes by.
    pub fn configuration(&self) -> Arc<Configuration> {
        self.config.clone()
    }

    /// Fetch the value of `key`. The callback receives the value dimensions
    /// in space order.
    pub fn get<F>(&mut self, space: &str, key: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(ReturnCode, Vec<Bytes>) + 'static,
    {
        let key = key.into();
        self.add_reqrep(
            space,
            &key,
            NetMsgType::ReqGet,
            &key,
            OpKind::Get {
                callback: Box::new(callback),
            },
        );
    }

    /// Store `value` (all `n - 1` value dimensions, in space order) at `key`.
    pub fn put<F>(&mut self, space: &str, key: impl Into<Bytes>, value: Vec<Bytes>, callback: F)
    where
        F: FnOnce(ReturnCode) + 'static,
    {
        let key = key.into();
        let mut payload = BytesMut::new();
        wire::put_buffer(&mut payload, &key);
        wire::put_buffer_vec(&mut payload, &value);
        self.add_reqrep(
            space,
            &key,
            NetMsgType::ReqPut,
            &payload,
            OpKind::Mutate {
                expected: NetMsgType::RespPut,
                callback: Box::new(callback),
            },
        );
    }

    /// Delete `key`.
    pub fn del<F>(&mut self, space: &str, key: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(ReturnCode) + 'static,
    {
        let key = key.into();
        self.add_reqrep(
            space,
            &key,
            NetMsgType::ReqDel,
            &key,
            OpKind::Mutate {
                expected: NetMsgType::RespDel,
                callback: Box::new(callback),
            },
        );
    }

    /// Partially mutate `key`: set exactly the dimensions named in `value`.
    ///
    /// Fails immediately with `BadDimension` if any name is not a value
    /// dimension of the space.
    pub fn update<F>(
        &mut self,
        space: &str,
        key: impl Into<Bytes>,
        value: HashMap<String, Bytes>,
        callback: F,
    ) where
        F: FnOnce(ReturnCode) + 'static,
    {
        let key = key.into();

        let space_id = self.config.lookup_space(space);
        if space_id == NULLSPACE {
            callback(ReturnCode::NotASpace);
            return;
        }
        let dimensions = match self.config.dimensions(space_id) {
            Some(dims) => dims.to_vec(),
            None => {
                callback(ReturnCode::NotASpace);
                return;
            }
        };

        let mut bits = Bitfield::new(dimensions.len() - 1);
        let mut realvalue: Vec<Bytes> = vec![Bytes::new(); dimensions.len() - 1];
        let mut matched = 0;
        for (idx, dim) in dimensions.iter().enumerate().skip(1) {
            if let Some(supplied) = value.get(dim) {
                bits.set(idx - 1);
                realvalue[idx - 1] = supplied.clone();
                matched += 1;
            }
        }
        if matched != value.len() {
            callback(ReturnCode::BadDimension);
            return;
        }

        let mut payload = BytesMut::new();
        wire::put_buffer(&mut payload, &key);
        bits.encode(&mut payload);
        wire::put_buffer_vec(&mut payload, &realvalue);
        self.add_reqrep(
            space,
            &key,
            NetMsgType::ReqUpdate,
            &payload,
            OpKind::Mutate {
                expected: NetMsgType::RespUpdate,
                callback: Box::new(callback),
            },
        );
    }

    /// Stream every object matching the constraints. The callback fires once
    /// per item with `Success`; the stream's end is the absence of further
    /// calls, observable as [`outstanding`](Client::outstanding) reaching 0.
    pub fn search<F>(
        &mut self,
        space: &str,
        equality: HashMap<String, Bytes>,
        range: HashMap<String, (u64, u64)>,
        callback: F,
    ) where
        F: FnMut(ReturnCode, Bytes, Vec<Bytes>) + 'static,
    {
        let callback: SearchCallback = Rc::new(RefCell::new(callback));
        self.search_inner(space, equality, range, None, callback);
    }

    /// [`search`](Client::search), restricted to one hash subspace.
    pub fn search_in_subspace<F>(
        &mut self,
        space: &str,
        equality: HashMap<String, Bytes>,
        range: HashMap<String, (u64, u64)>,
        subspace: u16,
        callback: F,
    ) where
        F: FnMut(ReturnCode, Bytes, Vec<Bytes>) + 'static,
    {
        let callback: SearchCallback = Rc::new(RefCell::new(callback));
        self.search_inner(space, equality, range, Some(subspace), callback);
    }

    /// Count of live pending operations, compacting tombstones as it goes.
    pub fn outstanding(&mut self) -> usize {
        self.requests.retain(Option::is_some);
        self.requests.len()
    }

    /// Pump events until the pending queue drains or the deadline elapses.
    /// On timeout every surviving op receives `Timeout` exactly once, the
    /// queue is cleared, and channels are left in place.
    pub fn flush(&mut self, timeout: Option<Duration>) -> ReturnCode {
        let start = Instant::now();
        let mut remaining = timeout;

        while !self.requests.is_empty() {
            let mut ret = self.flush_one(remaining);
            if ret != ReturnCode::Success && ret != ReturnCode::Timeout {
                return ret;
            }

            if let Some(total) = timeout {
                match total.checked_sub(start.elapsed()) {
                    Some(left) => remaining = Some(left),
                    None => ret = ReturnCode::Timeout,
                }
            }

            if ret == ReturnCode::Timeout {
                debug!(
                    survivors = self.requests.iter().filter(|s| s.is_some()).count(),
                    "flush deadline elapsed"
                );
                for slot in self.requests.drain(..) {
                    if let Some(op) = slot {
                        op.fail(ReturnCode::Timeout);
                    }
                }
                return ReturnCode::Timeout;
            }
        }

        ReturnCode::Success
    }

    /// Pump until one event is handled: a callback fires, a reconfigured or
    /// disconnected op is failed, or the timeout elapses (failing the oldest
    /// live op with `Timeout`).
    pub fn flush_one(&mut self, timeout: Option<Duration>) -> ReturnCode {
        loop {
            while let Some(None) = self.requests.front() {
                self.requests.pop_front();
            }
            if self.requests.is_empty() {
                return ReturnCode::Success;
            }

            // Re-establish the coordinator link, bounded.
            for attempt in 0..COORD_RECONNECTS {
                if self.coord.connected() {
                    break;
                }
                match self.coord.connect() {
                    LinkStatus::Success => {}
                    LinkStatus::ConnectFail | LinkStatus::Disconnect => {
                        if attempt == COORD_RECONNECTS - 1 {
                            return ReturnCode::CoordFail;
                        }
                    }
                    LinkStatus::Shutdown | LinkStatus::LogicError => {
                        if attempt == COORD_RECONNECTS - 1 {
                            return ReturnCode::LogicError;
                        }
                    }
                }
            }

            // A snapshot may already be waiting, and reconfigured ops must
            // be failed without consulting any socket.
            if self.coord.unacknowledged() {
                self.install_config();
            }
            let reconfigured = self
                .requests
                .iter()
                .position(|slot| matches!(slot, Some(op) if op.reconfigured));
            if let Some(idx) = reconfigured {
                if let Some(op) = self.requests[idx].take() {
                    op.fail(ReturnCode::Reconfigure);
                }
                return ReturnCode::Success;
            }

            // One descriptor per queue slot (tombstones poll nothing), plus
            // the coordinator's.
            let nfds = self.requests.len();
            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(nfds + 1);
            for slot in self.requests.iter() {
                let fd = match slot {
                    Some(op) => op.chan.borrow().sock.as_raw_fd(),
                    None => -1,
                };
                pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            pfds.push(libc::pollfd {
                fd: self.coord.pollfd(),
                events: libc::POLLIN,
                revents: 0,
            });

            // SAFETY: pfds is a live, correctly sized array for this call.
            let polled = unsafe {
                libc::poll(
                    pfds.as_mut_ptr(),
                    pfds.len() as libc::nfds_t,
                    poll_timeout(timeout),
                )
            };
            if polled < 0 {
                return ReturnCode::LogicError;
            }
            if polled == 0 {
                while let Some(slot) = self.requests.pop_front() {
                    if let Some(op) = slot {
                        op.fail(ReturnCode::Timeout);
                        break;
                    }
                }
                return ReturnCode::Timeout;
            }

            if pfds[nfds].revents != 0 {
                match self.coord.step(Some(Duration::ZERO)) {
                    LinkStatus::Success => {}
                    LinkStatus::ConnectFail | LinkStatus::Disconnect => {
                        return ReturnCode::CoordFail
                    }
                    LinkStatus::Shutdown | LinkStatus::LogicError => {
                        return ReturnCode::LogicError
                    }
                }
                if self.coord.unacknowledged() {
                    self.install_config();
                    continue;
                }
            }

            for idx in 0..nfds {
                let revents = pfds[idx].revents;
                if self.requests[idx].is_none() {
                    continue;
                }

                if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                    if let Some(op) = self.requests[idx].take() {
                        self.disconnect_op(op);
                    }
                    return ReturnCode::Success;
                }

                if self.requests[idx].as_ref().map_or(false, |op| op.reconfigured) {
                    if let Some(op) = self.requests[idx].take() {
                        op.fail(ReturnCode::Reconfigure);
                    }
                    return ReturnCode::Success;
                }

                if revents & libc::POLLIN == 0 {
                    continue;
                }

                let chan = match self.requests[idx].as_ref() {
                    Some(op) => op.chan.clone(),
                    None => continue,
                };
                let read = chan.borrow_mut().read_frame();
                let frame = match read {
                    Ok(FrameRead::NotReady) => continue,
                    Ok(FrameRead::Closed) | Err(_) => {
                        if let Some(op) = self.requests[idx].take() {
                            self.disconnect_op(op);
                        }
                        return ReturnCode::Success;
                    }
                    Ok(FrameRead::Frame(frame)) => frame,
                };

                let (header, payload) = match wire::decode_frame(&frame) {
                    Ok(parts) => parts,
                    Err(err) => {
                        warn!(error = %err, "undecodable frame, dropping channel");
                        if let Some(op) = self.requests[idx].take() {
                            self.disconnect_op(op);
                        }
                        return ReturnCode::Success;
                    }
                };

                // The first response on a channel tells us our own id.
                {
                    let mut chan_mut = chan.borrow_mut();
                    if chan_mut.id.is_client() {
                        debug!(id = %header.to, "learned channel id");
                        chan_mut.id = header.to;
                    }
                }

                match self.match_response(&chan, &header, payload) {
                    Delivery::CalledBack => return ReturnCode::Success,
                    Delivery::Quiet => {}
                }
            }
        }
    }

    /// Blocking get: the named value dimensions of `key`.
    pub fn fetch(&mut self, space: &str, key: impl Into<Bytes>) -> Result<Row, ReturnCode> {
        let dimensions = self.dimensions_of(space)?;

        let outcome: Rc<RefCell<Option<(ReturnCode, Vec<Bytes>)>>> = Rc::new(RefCell::new(None));
        let slot = outcome.clone();
        self.get(space, key, move |code, value| {
            *slot.borrow_mut() = Some((code, value));
        });
        let flushed = self.flush(None);

        let taken = outcome.borrow_mut().take();
        let (code, value) = match taken {
            Some(result) => result,
            None => {
                return Err(if flushed == ReturnCode::Success {
                    ReturnCode::LogicError
                } else {
                    flushed
                })
            }
        };
        if code != ReturnCode::Success {
            return Err(code);
        }
        if value.len() + 1 != dimensions.len() {
            return Err(ReturnCode::ServerError);
        }
        Ok(dimensions.into_iter().skip(1).zip(value).collect())
    }

    /// Blocking partial write of the named value dimensions.
    pub fn store(
        &mut self,
        space: &str,
        key: impl Into<Bytes>,
        value: HashMap<String, Bytes>,
    ) -> ReturnCode {
        let outcome: Rc<RefCell<Option<ReturnCode>>> = Rc::new(RefCell::new(None));
        let slot = outcome.clone();
        self.update(space, key, value, move |code| {
            *slot.borrow_mut() = Some(code);
        });
        let flushed = self.flush(None);

        let fallback = if flushed == ReturnCode::Success {
            ReturnCode::LogicError
        } else {
            flushed
        };
        let taken = outcome.borrow_mut().take();
        taken.unwrap_or(fallback)
    }

    /// Blocking delete.
    pub fn remove(&mut self, space: &str, key: impl Into<Bytes>) -> ReturnCode {
        let outcome: Rc<RefCell<Option<ReturnCode>>> = Rc::new(RefCell::new(None));
        let slot = outcome.clone();
        self.del(space, key, move |code| {
            *slot.borrow_mut() = Some(code);
        });
        let flushed = self.flush(None);

        let fallback = if flushed == ReturnCode::Success {
            ReturnCode::LogicError
        } else {
            flushed
        };
        let taken = outcome.borrow_mut().take();
        taken.unwrap_or(fallback)
    }

    /// Blocking search: drive the stream to completion, collecting named
    /// rows. The first hard failure aborts the collection.
    pub fn search_all(
        &mut self,
        space: &str,
        equality: HashMap<String, Bytes>,
        range: HashMap<String, (u64, u64)>,
    ) -> Result<Vec<Row>, ReturnCode> {
        let dimensions = self.dimensions_of(space)?;

        type Event = (ReturnCode, Bytes, Vec<Bytes>);
        let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        self.search(space, equality, range, move |code, key, value| {
            sink.borrow_mut().push((code, key, value));
        });

        let mut rows = Vec::new();
        loop {
            let drained: Vec<Event> = events.borrow_mut().drain(..).collect();
            for (code, key, value) in drained {
                if code != ReturnCode::Success {
                    return Err(code);
                }
                if value.len() + 1 != dimensions.len() {
                    return Err(ReturnCode::ServerError);
                }
                let mut row = Row::with_capacity(dimensions.len());
                row.insert(dimensions[0].clone(), key);
                for (dim, v) in dimensions.iter().skip(1).zip(value) {
                    row.insert(dim.clone(), v);
                }
                rows.push(row);
            }

            if self.outstanding() == 0 {
                return Ok(rows);
            }
            let ret = self.flush_one(None);
            if ret != ReturnCode::Success {
                return Err(ret);
            }
        }
    }

    pub(crate) fn has_channel(&self, inst: &Instance) -> bool {
        self.channels.contains(inst)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Resolve a target, allocate a nonce, enqueue, frame, and send.
    fn add_reqrep(
        &mut self,
        space: &str,
        key: &[u8],
        msg_type: NetMsgType,
        payload: &[u8],
        kind: OpKind,
    ) {
        let space_id = self.config.lookup_space(space);
        if space_id == NULLSPACE {
            warn!(space, "dispatch to unknown space");
            fail_kind(kind, ReturnCode::NotASpace);
            return;
        }

        let (ent, inst) = match self.config.point_leader(space_id, key) {
            Some(target) => target,
            None => {
                fail_kind(kind, ReturnCode::ConnectFail);
                return;
            }
        };

        let chan = match self.channels.get_or_create(&inst) {
            Ok(chan) => chan,
            Err(err) => {
                warn!(error = %err, instance = %inst.inbound, "channel open failed");
                fail_kind(kind, ReturnCode::ConnectFail);
                return;
            }
        };

        let nonce = chan.borrow_mut().next_nonce();
        let op = PendingOp::new(chan.clone(), ent, inst.clone(), nonce, kind);

        // Enqueue first so a response racing the send still finds its op.
        self.requests.push_back(Some(op));
        if !send_request(
            &mut self.channels,
            &chan,
            ent,
            &inst,
            nonce,
            msg_type,
            payload,
        ) {
            if let Some(Some(op)) = self.requests.pop_back() {
                op.fail(ReturnCode::Disconnect);
            }
        }
    }

    fn search_inner(
        &mut self,
        space: &str,
        equality: HashMap<String, Bytes>,
        range: HashMap<String, (u64, u64)>,
        subspace: Option<u16>,
        callback: SearchCallback,
    ) {
        let space_id = self.config.lookup_space(space);
        if space_id == NULLSPACE {
            (&mut *callback.borrow_mut())(ReturnCode::NotASpace, Bytes::new(), Vec::new());
            return;
        }
        let dimensions = match self.config.dimensions(space_id) {
            Some(dims) => dims.to_vec(),
            None => {
                (&mut *callback.borrow_mut())(ReturnCode::NotASpace, Bytes::new(), Vec::new());
                return;
            }
        };

        let predicate = match SearchPredicate::build(&dimensions, &equality, &range) {
            Ok(predicate) => predicate,
            Err(code) => {
                (&mut *callback.borrow_mut())(code, Bytes::new(), Vec::new());
                return;
            }
        };

        let targets = self.config.search_entities(space_id, &predicate, subspace);
        let search_id = self.search_id;
        self.search_id += 1;

        let mut req = BytesMut::new();
        req.put_u64(search_id);
        predicate.encode(&mut req);

        debug!(space, search_id, targets = targets.len(), "search dispatched");

        for (ent, inst) in targets {
            let chan = match self.channels.get_or_create(&inst) {
                Ok(chan) => chan,
                Err(err) => {
                    warn!(error = %err, instance = %inst.inbound, "channel open failed");
                    (&mut *callback.borrow_mut())(
                        ReturnCode::ConnectFail,
                        Bytes::new(),
                        Vec::new(),
                    );
                    continue;
                }
            };

            let nonce = chan.borrow_mut().next_nonce();
            let op = PendingOp::new(
                chan.clone(),
                ent,
                inst.clone(),
                nonce,
                OpKind::Search {
                    search_id,
                    callback: callback.clone(),
                },
            );
            self.requests.push_back(Some(op));
            if !send_request(
                &mut self.channels,
                &chan,
                ent,
                &inst,
                nonce,
                NetMsgType::ReqSearchStart,
                &req,
            ) {
                if let Some(Some(op)) = self.requests.pop_back() {
                    op.fail(ReturnCode::Disconnect);
                }
            }
        }
    }

    /// Install the coordinator's latest snapshot and mark every op whose
    /// entity no longer maps to the instance it was dispatched to.
    fn install_config(&mut self) {
        self.config = self.coord.config();
        self.coord.acknowledge();
        debug!(
            version = self.config.version(),
            "installed configuration snapshot"
        );

        for slot in self.requests.iter_mut() {
            if let Some(op) = slot {
                if self.config.instance_for(op.ent).as_ref() != Some(&op.inst) {
                    trace!(entity = %op.ent, "op target moved by reconfiguration");
                    op.reconfigured = true;
                }
            }
        }
    }

    /// Scan the whole queue for the op this response belongs to. Several
    /// ops may share the channel; the nonce disambiguates. A frame matching
    /// nothing is dropped silently.
    fn match_response(&mut self, chan: &ChannelRef, header: &Header, payload: Bytes) -> Delivery {
        let chan_id = chan.borrow().id;

        for idx in 0..self.requests.len() {
            let matched = match &self.requests[idx] {
                Some(op) => {
                    Rc::ptr_eq(&op.chan, chan)
                        && header.fromver == op.inst.inbound_version
                        && header.tover == 0
                        && header.from == op.ent
                        && header.to == chan_id
                        && header.nonce == op.nonce
                }
                None => false,
            };
            if !matched {
                continue;
            }

            let is_search = matches!(
                self.requests[idx].as_ref().map(|op| &op.kind),
                Some(OpKind::Search { .. })
            );
            if !is_search {
                if let Some(op) = self.requests[idx].take() {
                    op.deliver(header.msg_type, payload);
                }
                return Delivery::CalledBack;
            }
            return self.handle_search_response(idx, chan, header.msg_type, payload);
        }

        trace!(nonce = header.nonce, "response matched no pending op");
        Delivery::Quiet
    }

    /// Drive one search op through its continuation protocol.
    fn handle_search_response(
        &mut self,
        idx: usize,
        chan: &ChannelRef,
        msg_type: NetMsgType,
        mut payload: Bytes,
    ) -> Delivery {
        match msg_type {
            NetMsgType::RespSearchItem => {
                let decoded: Result<(Bytes, Vec<Bytes>), WireError> = (|| {
                    let key = wire::get_buffer(&mut payload)?;
                    let value = wire::get_buffer_vec(&mut payload)?;
                    Ok((key, value))
                })();
                let (key, value) = match decoded {
                    Ok(item) => item,
                    Err(err) => {
                        warn!(error = %err, "undecodable search item");
                        if let Some(op) = self.requests[idx].take() {
                            op.fail(ReturnCode::ServerError);
                        }
                        return Delivery::CalledBack;
                    }
                };

                let (search_id, ent, inst) = match self.requests[idx].as_ref() {
                    Some(op) => match op.kind {
                        OpKind::Search { search_id, .. } => (search_id, op.ent, op.inst.clone()),
                        _ => return Delivery::Quiet,
                    },
                    None => return Delivery::Quiet,
                };

                // Ask for the next item before surfacing this one; the op
                // stays queued under the continuation's nonce.
                let nonce = chan.borrow_mut().next_nonce();
                let mut req = BytesMut::with_capacity(8);
                req.put_u64(search_id);

                if send_request(
                    &mut self.channels,
                    chan,
                    ent,
                    &inst,
                    nonce,
                    NetMsgType::ReqSearchNext,
                    &req,
                ) {
                    if let Some(op) = self.requests[idx].as_mut() {
                        op.nonce = nonce;
                        if let OpKind::Search { ref callback, .. } = op.kind {
                            (&mut *callback.borrow_mut())(ReturnCode::Success, key, value);
                        }
                    }
                    Delivery::CalledBack
                } else {
                    if let Some(op) = self.requests[idx].take() {
                        op.fail(ReturnCode::Disconnect);
                    }
                    Delivery::CalledBack
                }
            }

            NetMsgType::RespSearchDone => {
                // End of this entity's stream; the absence of further items
                // is the terminal signal, so no callback fires.
                trace!("search stream drained");
                self.requests[idx] = None;
                Delivery::Quiet
            }

            _ => {
                if let Some(op) = self.requests[idx].take() {
                    op.fail(ReturnCode::ServerError);
                }
                Delivery::CalledBack
            }
        }
    }

    /// Tear down an op's channel and fail it with `Disconnect`.
    fn disconnect_op(&mut self, op: PendingOp) {
        let _ = op.chan.borrow().sock.shutdown(Shutdown::Both);
        self.channels.evict(&op.inst);
        op.fail(ReturnCode::Disconnect);
    }

    fn dimensions_of(&self, space: &str) -> Result<Vec<String>, ReturnCode> {
        let space_id = self.config.lookup_space(space);
        if space_id == NULLSPACE {
            return Err(ReturnCode::NotASpace);
        }
        self.config
            .dimensions(space_id)
            .map(|dims| dims.to_vec())
            .ok_or(ReturnCode::NotASpace)
    }
}

/// Frame and write one request. On failure the channel is shut down and
/// evicted; the caller owns failing the op.
fn send_request(
    channels: &mut ChannelTable,
    chan: &ChannelRef,
    ent: EntityId,
    inst: &Instance,
    nonce: u64,
    msg_type: NetMsgType,
    payload: &[u8],
) -> bool {
    let header = Header {
        msg_type,
        fromver: 0,
        tover: inst.inbound_version,
        from: chan.borrow().id,
        to: ent,
        nonce,
    };
    let frame = wire::encode_frame(&header, payload);

    let result = chan.borrow_mut().send(&frame);
    match result {
        Ok(()) => {
            trace!(
                msg_type = ?msg_type,
                entity = %ent,
                nonce,
                bytes = frame.len(),
                "request sent"
            );
            true
        }
        Err(err) => {
            warn!(error = %err, instance = %inst.inbound, "send failed");
            let _ = chan.borrow().sock.shutdown(Shutdown::Both);
            channels.evict(inst);
            false
        }
    }
}

fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    }
}
