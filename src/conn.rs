//! A single multiplexed connection to an AMS router.
//!
//! Any number of threads can have requests in flight on one connection.
//! Replies are matched to their requests by invoke ID on a dedicated reader
//! thread, which also delivers notifications to the `Dispatcher`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::client::{check_reply, Source, Timeouts};
use crate::codec::{
    self, AddNotificationResponse, AmsHeader, Command, Decode, DecodeError, DeleteNotificationRequest,
    Encode, Frame, WriteRequest, TCP_HEADER_SIZE,
};
use crate::errors::ErrContext;
use crate::notif::{self, Dispatcher, Notification, Registration, Subscription};
use crate::{index, lock, ports, AmsAddr, AmsNetId, Error, Result};

/// Number of timed-out invoke IDs remembered so that their late replies
/// are recognized and dropped.
pub const MAX_RETIRED_IDS: usize = 4096;

/// Timeout for cleanup requests during close if no read timeout is set.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 4096;

/// The lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    /// Only cleanup requests are sent.
    Closing,
    Closed,
}

struct Waiter {
    action: &'static str,
    reply: Sender<Result<AmsHeader>>,
    /// Installed in the dispatcher by the reader once the AddNotification
    /// reply is in, before any later frame is processed.
    install: Option<Registration>,
}

/// Invoke-ID bookkeeping and the connection state, under one lock.
struct PendingTable {
    state: ConnState,
    next_id: u32,
    waiters: HashMap<u32, Waiter>,
    retired: HashSet<u32>,
    retired_order: VecDeque<u32>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            state: ConnState::Connecting,
            next_id: 1,
            waiters: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
        }
    }

    /// Return the next free invoke ID.
    ///
    /// The counter wraps around; 0, IDs still pending and retired IDs are
    /// skipped.  Since at most `u32::MAX - 1` IDs can be taken, this ends.
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.waiters.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }

    /// Remember a timed-out ID until its reply arrives.
    fn retire(&mut self, id: u32) {
        if self.retired.insert(id) {
            self.retired_order.push_back(id);
        }
        while self.retired_order.len() > MAX_RETIRED_IDS {
            if let Some(old) = self.retired_order.pop_front() {
                self.retired.remove(&old);
            }
        }
    }

    /// Forget a retired ID; returns whether it was retired.
    fn take_retired(&mut self, id: u32) -> bool {
        if self.retired.remove(&id) {
            self.retired_order.retain(|&other| other != id);
            true
        } else {
            false
        }
    }
}

/// State shared between the users of a connection and its reader thread.
struct Shared {
    peer: SocketAddr,
    source: AmsAddr,
    timeouts: Timeouts,
    writer: Mutex<TcpStream>,
    pending: Mutex<PendingTable>,
    dispatcher: Dispatcher,
    /// If we opened our source port with the router.
    port_opened: bool,
}

/// A TCP connection to an AMS router, shared by any number of requesters.
///
/// Closed explicitly with `close` or on drop.
pub struct Connection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to the AMS router at `addr`.
    ///
    /// `source` determines our own AMS address: with `Source::Auto` it is
    /// the local IPv4 address with `.1.1` appended and port 58913, with
    /// `Source::Request` a port is requested from the router (and given back
    /// on close).
    pub fn connect(addr: SocketAddr, source: Source, timeouts: Timeouts) -> Result<Self> {
        let mut socket = if let Some(timeout) = timeouts.connect {
            TcpStream::connect_timeout(&addr, timeout).ctx("connecting TCP socket with timeout")?
        } else {
            TcpStream::connect(addr).ctx("connecting TCP socket")?
        };

        // Disable Nagle to ensure small requests are sent promptly.
        socket.set_nodelay(true).ctx("setting NODELAY")?;

        let mut port_opened = false;
        let source = match source {
            Source::Addr(addr) => addr,
            Source::Auto => {
                let my_addr = socket.local_addr().ctx("getting local socket address")?.ip();
                let netid = match my_addr {
                    IpAddr::V4(ip) => AmsNetId::from_ip(ip, 1, 1),
                    IpAddr::V6(_) => AmsNetId::local(),
                };
                AmsAddr::new(netid, ports::DEFAULT_SOURCE)
            }
            Source::Request => {
                let addr = request_port(&mut socket, timeouts)?;
                port_opened = true;
                addr
            }
        };
        Self::start(socket, source, timeouts, port_opened)
    }

    /// Run a connection over an already connected stream, using `source` as
    /// our address.
    pub fn from_stream(socket: TcpStream, source: AmsAddr, timeouts: Timeouts) -> Result<Self> {
        Self::start(socket, source, timeouts, false)
    }

    fn start(socket: TcpStream, source: AmsAddr, timeouts: Timeouts, port_opened: bool) -> Result<Self> {
        socket.set_write_timeout(timeouts.write).ctx("setting write timeout")?;
        socket.set_read_timeout(None).ctx("setting read timeout")?;
        let peer = socket.peer_addr().ctx("getting peer address")?;
        let reader_socket = socket.try_clone().ctx("cloning TCP socket")?;

        let mut table = PendingTable::new();
        table.state = ConnState::Open;
        let shared = Arc::new(Shared {
            peer,
            source,
            timeouts,
            writer: Mutex::new(socket),
            pending: Mutex::new(table),
            dispatcher: Dispatcher::new(),
            port_opened,
        });

        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name(format!("ads-reader-{}", peer))
            .spawn(move || reader_shared.run_reader(reader_socket))
            .ctx("spawning reader thread")?;

        info!("connected to {} as {}", peer, source);
        Ok(Self { shared, reader: Mutex::new(Some(reader)) })
    }

    /// The address of the router this connection goes to.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Our own AMS address on this connection.
    pub fn source(&self) -> AmsAddr {
        self.shared.source
    }

    pub fn state(&self) -> ConnState {
        lock(&self.shared.pending).state
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        lock(&self.shared.pending).waiters.len()
    }

    /// The dispatcher receiving this connection's notifications.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// All notifications registered on this connection.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.dispatcher.subscriptions()
    }

    /// Send a request to `target` and wait for its reply.
    ///
    /// The reply header is returned as received; checking it is up to the
    /// caller.  On timeout the request is abandoned and a late reply is
    /// dropped, the connection stays usable.
    pub fn send(
        &self,
        command: Command,
        target: AmsAddr,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<AmsHeader> {
        self.shared.transact(command, target, payload, timeout, None, false)
    }

    /// Send an AddNotification request whose registration is installed as
    /// soon as the device confirms it.
    pub(crate) fn send_add_notification(
        &self,
        target: AmsAddr,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        registration: Registration,
    ) -> Result<AmsHeader> {
        self.shared
            .transact(Command::AddNotification, target, payload, timeout, Some(registration), false)
    }

    /// Delete a notification: the local registration is removed first, then
    /// the device is asked to delete it, and the symbol handle (if any) is
    /// released.
    ///
    /// Unknown handles are ignored.
    pub fn delete_notification(&self, target: AmsAddr, handle: notif::Handle) -> Result<()> {
        self.discard_notification(target, handle).unwrap_or(Ok(()))
    }

    /// Like `delete_notification`, but returns `None` if no registration
    /// for the handle existed.
    pub(crate) fn discard_notification(
        &self,
        target: AmsAddr,
        handle: notif::Handle,
    ) -> Option<Result<()>> {
        let registration = self.shared.dispatcher.remove(target, handle)?;
        let result = self
            .shared
            .delete_on_device(target, handle, self.shared.timeouts.read, false);
        if let Some(symbol) = registration.symbol_handle {
            if let Err(e) = self.shared.release_symbol(target, symbol, self.shared.timeouts.read, false) {
                warn!("releasing symbol handle {} on {}: {}", symbol, target, e);
            }
        }
        Some(result)
    }

    /// Close the connection.
    ///
    /// All notifications are deleted on their devices first (errors are only
    /// logged), then pending requests fail with `ConnectionClosed`.  Calling
    /// it again does nothing.
    pub fn close(&self) {
        let proceed = {
            let mut pending = lock(&self.shared.pending);
            if pending.state == ConnState::Open {
                pending.state = ConnState::Closing;
                true
            } else {
                false
            }
        };
        if proceed {
            self.shared.clean_up();
            self.shared.teardown("closing connection");
            info!("connection to {} closed", self.shared.peer);
        }
        self.join_reader();
    }

    fn join_reader(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            // A callback could drop the last reference on the reader thread.
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("source", &self.shared.source)
            .field("state", &self.state())
            .finish()
    }
}

/// Ask the router for a free port and return our address from its reply.
fn request_port(socket: &mut TcpStream, timeouts: Timeouts) -> Result<AmsAddr> {
    let request = codec::encode_router_frame(codec::ROUTER_PORT_CONNECT, &[0, 0])?;
    socket.write_all(&request).ctx("requesting port from router")?;
    socket.set_read_timeout(timeouts.read).ctx("setting read timeout")?;
    let mut reply = [0; TCP_HEADER_SIZE + 8];
    socket.read_exact(&mut reply).ctx("requesting port from router")?;
    match codec::decode_frame(&reply) {
        Ok((Frame::Router { command: codec::ROUTER_PORT_CONNECT, payload }, _)) => {
            Ok(codec::decode_port_reply(&payload)?)
        }
        _ => Err(Error::Reply("requesting port", "unexpected reply header", 0)),
    }
}

impl Shared {
    /// Register a waiter, send the request and wait for the reply.
    ///
    /// `cleanup` requests may also be sent while the connection is closing.
    fn transact(
        &self,
        command: Command,
        target: AmsAddr,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        install: Option<Registration>,
        cleanup: bool,
    ) -> Result<AmsHeader> {
        let action = command.action();
        let (tx, rx) = bounded(1);
        let invoke_id = {
            let mut pending = lock(&self.pending);
            match pending.state {
                ConnState::Open => {}
                ConnState::Closing if cleanup => {}
                _ => return Err(Error::ConnectionClosed(action)),
            }
            let id = pending.allocate();
            pending.waiters.insert(id, Waiter { action, reply: tx, install });
            id
        };

        let request = AmsHeader::request(target, self.source, command, invoke_id, payload);
        if let Err(e) = self.write_frame(&request) {
            lock(&self.pending).waiters.remove(&invoke_id);
            return Err(e);
        }

        match timeout {
            None => rx.recv().unwrap_or(Err(Error::ConnectionClosed(action))),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed(action)),
                Err(RecvTimeoutError::Timeout) => {
                    // Whoever removes the waiter owns the reply: if the reader
                    // was faster, the reply is on its way.
                    let mut pending = lock(&self.pending);
                    if pending.waiters.remove(&invoke_id).is_some() {
                        pending.retire(invoke_id);
                        return Err(Error::Timeout(action));
                    }
                    drop(pending);
                    rx.recv().unwrap_or(Err(Error::ConnectionClosed(action)))
                }
            },
        }
    }

    /// Send a request whose reply nobody waits for.
    fn send_detached(&self, command: Command, target: AmsAddr, payload: Vec<u8>) -> Result<()> {
        let invoke_id = {
            let mut pending = lock(&self.pending);
            if pending.state != ConnState::Open {
                return Err(Error::ConnectionClosed(command.action()));
            }
            let id = pending.allocate();
            pending.retire(id);
            id
        };
        self.write_frame(&AmsHeader::request(target, self.source, command, invoke_id, payload))
    }

    /// Write a frame in one piece.  On failure the socket is shut down, so
    /// the reader tears the connection down.
    fn write_frame(&self, header: &AmsHeader) -> Result<()> {
        let frame = codec::encode_frame(header)?;
        let writer = lock(&self.writer);
        // &T impls Write for T: Write, so no &mut required.
        if let Err(e) = (&*writer).write_all(&frame) {
            let _ = writer.shutdown(Shutdown::Both);
            return Err(Error::Io("sending request", e));
        }
        Ok(())
    }

    fn delete_on_device(
        &self,
        target: AmsAddr,
        handle: notif::Handle,
        timeout: Option<Duration>,
        cleanup: bool,
    ) -> Result<()> {
        let command = Command::DeleteNotification;
        let payload = DeleteNotificationRequest { handle }.encode()?;
        let reply = self.transact(command, target, payload, timeout, None, cleanup)?;
        check_reply(&reply, command, target, true)
    }

    fn release_symbol(
        &self,
        target: AmsAddr,
        symbol: u32,
        timeout: Option<Duration>,
        cleanup: bool,
    ) -> Result<()> {
        let command = Command::Write;
        let bytes = symbol.to_le_bytes();
        let payload = WriteRequest {
            index_group: index::RELEASE_SYMHANDLE,
            index_offset: 0,
            data: &bytes,
        }
        .encode()?;
        let reply = self.transact(command, target, payload, timeout, None, cleanup)?;
        check_reply(&reply, command, target, true)
    }

    /// Best-effort deletion of everything this connection holds on devices.
    fn clean_up(&self) {
        let timeout = Some(self.timeouts.read.unwrap_or(CLEANUP_TIMEOUT));
        for ((target, handle), registration) in self.dispatcher.drain() {
            if let Err(e) = self.delete_on_device(target, handle, timeout, true) {
                warn!("deleting notification {} on {}: {}", handle, target, e);
            }
            if let Some(symbol) = registration.symbol_handle {
                if let Err(e) = self.release_symbol(target, symbol, timeout, true) {
                    warn!("releasing symbol handle {} on {}: {}", symbol, target, e);
                }
            }
        }

        // Remove our port from the router, if necessary.
        if self.port_opened {
            let result = codec::encode_router_frame(codec::ROUTER_PORT_CLOSE, &self.source.port().to_le_bytes())
                .and_then(|frame| (&*lock(&self.writer)).write_all(&frame).ctx("closing port"));
            if let Err(e) = result {
                warn!("giving back port {}: {}", self.source.port(), e);
            }
        }
    }

    /// Mark the connection closed, fail all waiters and orphan all
    /// registrations.
    fn teardown(&self, reason: &str) {
        let waiters = {
            let mut pending = lock(&self.pending);
            pending.state = ConnState::Closed;
            mem::take(&mut pending.waiters)
        };
        if !waiters.is_empty() {
            debug!("{}: failing {} pending requests", reason, waiters.len());
        }
        for (_, waiter) in waiters {
            let _ = waiter.reply.send(Err(Error::ConnectionClosed(waiter.action)));
        }
        for ((target, handle), registration) in self.dispatcher.drain() {
            warn!(
                "{}: notification {} on {} (user handle {}) orphaned",
                reason, handle, target, registration.user_handle
            );
        }
        // Also wakes up the reader if it's still running.
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }

    fn run_reader(&self, mut socket: TcpStream) {
        let err = match self.read_loop(&mut socket) {
            Ok(()) => return,
            Err(e) => e,
        };
        let state = lock(&self.pending).state;
        match state {
            ConnState::Closed => debug!("reader for {} stopped: {}", self.peer, err),
            ConnState::Closing => {
                debug!("connection to {} lost while closing: {}", self.peer, err);
                self.teardown("connection lost");
            }
            _ => {
                warn!("connection to {} failed: {}", self.peer, err);
                self.teardown("connection failed");
            }
        }
    }

    fn read_loop(&self, socket: &mut TcpStream) -> Result<()> {
        let mut buf = Vec::with_capacity(READ_CHUNK_SIZE);
        let mut chunk = vec![0; READ_CHUNK_SIZE];
        loop {
            // Handle all complete frames in the buffer.
            let mut start = 0;
            loop {
                match codec::decode_frame(&buf[start..]) {
                    Ok((frame, used)) => {
                        start += used;
                        self.handle_frame(frame);
                    }
                    Err(DecodeError::TruncatedFrame { .. }) => break,
                    Err(DecodeError::UnknownCommand { command, frame }) => {
                        warn!("dropping frame with unknown ADS command {}", command);
                        start += TCP_HEADER_SIZE + frame.len();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            buf.drain(..start);

            if lock(&self.pending).state == ConnState::Closed {
                return Ok(());
            }
            let n = match socket.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Io("reading frame", io::ErrorKind::UnexpectedEof.into()))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io("reading frame", e)),
            };
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let header = match frame {
            Frame::Ads(header) => header,
            Frame::Router { command, .. } => {
                debug!("ignoring router message {:#x}", command);
                return;
            }
        };
        if header.target != self.source {
            debug!("dropping frame for {}, we are {}", header.target, self.source);
            return;
        }
        if header.is_response() {
            self.handle_response(header);
        } else if header.command == Command::Notification {
            match Notification::parse(header.source, header.payload) {
                Ok(notification) => {
                    self.dispatcher.dispatch(&notification);
                }
                Err(e) => warn!("dropping malformed notification from {}: {}", header.source, e),
            }
        } else {
            warn!("dropping unexpected {:?} request from {}", header.command, header.source);
        }
    }

    fn handle_response(&self, header: AmsHeader) {
        let waiter = {
            let mut pending = lock(&self.pending);
            match pending.waiters.remove(&header.invoke_id) {
                Some(waiter) => waiter,
                None => {
                    let late = pending.take_retired(header.invoke_id);
                    drop(pending);
                    if late {
                        debug!("dropping late reply for invoke ID {}", header.invoke_id);
                        self.release_late_notification(&header);
                    } else {
                        warn!("dropping reply with unknown invoke ID {}", header.invoke_id);
                    }
                    return;
                }
            }
        };

        if let Some(registration) = waiter.install {
            if header.command == Command::AddNotification
                && header.source == registration.target
                && header.error_code == 0
            {
                if let Ok(AddNotificationResponse { result: 0, handle }) =
                    AddNotificationResponse::decode(&header.payload)
                {
                    self.dispatcher.insert(handle, registration);
                }
            }
        }
        let _ = waiter.reply.send(Ok(header));
    }

    /// A notification added by a request that timed out still exists on the
    /// device; delete it.
    fn release_late_notification(&self, header: &AmsHeader) {
        if header.command != Command::AddNotification || header.error_code != 0 {
            return;
        }
        if let Ok(AddNotificationResponse { result: 0, handle }) =
            AddNotificationResponse::decode(&header.payload)
        {
            let result = DeleteNotificationRequest { handle }
                .encode()
                .and_then(|payload| self.send_detached(Command::DeleteNotification, header.source, payload));
            if let Err(e) = result {
                warn!("deleting abandoned notification {} on {}: {}", handle, header.source, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter() -> Waiter {
        let (reply, _) = bounded(1);
        Waiter { action: "test", reply, install: None }
    }

    #[test]
    fn test_ids_start_at_one_and_skip_zero() {
        let mut table = PendingTable::new();
        assert_eq!(table.allocate(), 1);
        assert_eq!(table.allocate(), 2);
        table.next_id = u32::MAX;
        assert_eq!(table.allocate(), u32::MAX);
        assert_eq!(table.allocate(), 1);
    }

    #[test]
    fn test_ids_skip_pending_and_retired() {
        let mut table = PendingTable::new();
        table.waiters.insert(1, waiter());
        table.waiters.insert(2, waiter());
        table.retire(3);
        let id = table.allocate();
        assert_eq!(id, 4);
        table.waiters.insert(id, waiter());

        // After wraparound, the still pending ones are skipped again.
        table.next_id = u32::MAX;
        assert_eq!(table.allocate(), u32::MAX);
        assert_eq!(table.allocate(), 5);

        // A late reply frees a retired ID.
        assert!(table.take_retired(3));
        assert!(!table.take_retired(3));
        table.next_id = 3;
        assert_eq!(table.allocate(), 3);
    }

    #[test]
    fn test_unresolved_ids_are_distinct() {
        let mut table = PendingTable::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = table.allocate();
            table.waiters.insert(id, waiter());
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_retired_set_is_bounded() {
        let mut table = PendingTable::new();
        for id in 1..=(MAX_RETIRED_IDS as u32 + 10) {
            table.retire(id);
        }
        assert_eq!(table.retired.len(), MAX_RETIRED_IDS);
        assert_eq!(table.retired_order.len(), MAX_RETIRED_IDS);
        // the oldest ones were evicted
        assert!(!table.retired.contains(&1));
        assert!(table.retired.contains(&(MAX_RETIRED_IDS as u32 + 10)));
    }
}
