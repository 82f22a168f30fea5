//! Contains the client that executes ADS requests on any number of devices.

use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::mem::size_of;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use log::debug;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::codec::{
    AddNotificationRequest, AddNotificationResponse, AmsHeader, Command, Decode, DeviceInfo, Encode,
    IndexLength, ReadRequest, ReadResponse, ReadWriteRequest, StateFlags,
    StateResponse, WriteControlRequest, WriteRequest,
};
use crate::conn::{ConnState, Connection};
use crate::errors::ads_error;
use crate::notif::{self, Attributes, Location, Registration, Sample, Subscription};
use crate::route::RouteTable;
use crate::symbol;
use crate::{index, lock, ports, AmsAddr, AmsNetId, Error, Result};

/// Holds the different timeouts that will be used by the Client.
/// None means no timeout in every case.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Connect timeout
    pub connect: Option<Duration>,
    /// Reply read timeout
    pub read: Option<Duration>,
    /// Socket write timeout
    pub write: Option<Duration>,
}

impl Timeouts {
    /// Create a new `Timeouts` where all values are identical.
    pub fn new(duration: Duration) -> Self {
        Self {
            connect: Some(duration),
            read: Some(duration),
            write: Some(duration),
        }
    }

    /// Create a new `Timeouts` without any timeouts specified.
    pub fn none() -> Self {
        Self {
            connect: None,
            read: None,
            write: None,
        }
    }
}

/// Specifies the source AMS address to use.
#[derive(Clone, Copy, Debug)]
pub enum Source {
    /// Auto-generate a source address from the local address and a fixed port.
    Auto,
    /// Use a specified source address.
    Addr(AmsAddr),
    /// Request to open a port in the connected router and get the address from
    /// it.  This is necessary when connecting to a local PLC on `127.0.0.1`.
    Request,
}

/// Executes ADS requests, keeping one connection per target NetID.
///
/// Connections are opened on first use, via the routes in the route table,
/// and shared by all threads using the client.  Wrappers such as `Device`
/// or `symbol::Handle` use a `&Client`.
///
/// If connecting to a server that has an AMS router, it needs to have a
/// route set for our source IP and NetID, otherwise the connection will be
/// closed immediately.  The route can be added from TwinCAT, or with
/// `udp::add_route_to_plc`.
pub struct Client {
    routes: RouteTable,
    timeouts: Timeouts,
    source: Source,
    connections: Mutex<HashMap<AmsNetId, Arc<Connection>>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut *lock(&self.connections));
        for (_, conn) in connections {
            conn.close();
        }
    }
}

impl Client {
    /// Create a client that finds targets in `routes`.
    ///
    /// `source` is the AMS address to use as the source; the NetID needs to
    /// match the route entry in the server.  A route's `local_netid`
    /// overrides the NetID for connections over that route.
    pub fn new(routes: RouteTable, timeouts: Timeouts, source: Source) -> Self {
        Self {
            routes,
            timeouts,
            source,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The route table used by this client.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Return the connection to `netid`, connecting if there is none yet or
    /// the previous one was closed.
    ///
    /// The connection cache is not locked while connecting, so a slow or
    /// unresponsive target does not hold up requests to other targets.  If
    /// two threads connect to the same target at once, the first connection
    /// stored wins and the other one is closed again.
    pub fn open(&self, netid: AmsNetId) -> Result<Arc<Connection>> {
        let route = self.routes.lookup(netid).ok_or(Error::RouteNotFound(netid))?;
        if let Some(conn) = self.open_connection(netid) {
            return Ok(conn);
        }
        let source = match (route.local_netid, self.source) {
            (Some(local), Source::Addr(addr)) => Source::Addr(addr.with_netid(local)),
            (Some(local), Source::Auto) => Source::Addr(AmsAddr::new(local, ports::DEFAULT_SOURCE)),
            (_, source) => source,
        };
        let conn = Arc::new(Connection::connect(route.addr, source, self.timeouts)?);

        let existing = {
            let mut connections = lock(&self.connections);
            match connections.get(&netid) {
                Some(other) if other.state() == ConnState::Open => Some(other.clone()),
                _ => {
                    if connections.insert(netid, conn.clone()).is_some() {
                        debug!("replacing closed connection to {}", netid);
                    }
                    None
                }
            }
        };
        match existing {
            Some(other) => {
                debug!("dropping duplicate connection to {}", netid);
                conn.close();
                Ok(other)
            }
            None => Ok(conn),
        }
    }

    fn open_connection(&self, netid: AmsNetId) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .get(&netid)
            .filter(|conn| conn.state() == ConnState::Open)
            .cloned()
    }

    /// Close the connection to `netid`, if there is one.
    pub fn close(&self, netid: AmsNetId) {
        let conn = lock(&self.connections).remove(&netid);
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Return the open connection to `netid`, without connecting.
    pub fn connection(&self, netid: AmsNetId) -> Option<Arc<Connection>> {
        lock(&self.connections).get(&netid).cloned()
    }

    /// Open the connection for `target`, and map the local NetID
    /// `127.0.0.1.1.1` to the connection's own NetID.
    fn resolve(&self, target: AmsAddr) -> Result<(Arc<Connection>, AmsAddr)> {
        if target.port() == 0 {
            return Err(Error::InvalidAddress("invalid AMS port", target.to_string()));
        }
        let conn = self.open(target.netid())?;
        let target = if target.netid() == AmsNetId::local() {
            target.with_netid(conn.source().netid())
        } else {
            target
        };
        Ok((conn, target))
    }

    /// Execute an ADS command and return the reply.
    ///
    /// An error code in the AMS header or a nonzero result field of the
    /// reply is returned as `Error::Ads`.
    pub fn request(
        &self,
        target: AmsAddr,
        command: Command,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let (conn, target) = self.resolve(target)?;
        let header = conn.send(command, target, payload, timeout)?;
        check_reply(&header, command, target, true)?;
        Ok(Reply { header })
    }

    /// Like `request`, but a nonzero result field is not turned into an
    /// error, so that data sent along with an error stays accessible.
    pub fn exchange(
        &self,
        target: AmsAddr,
        command: Command,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let (conn, target) = self.resolve(target)?;
        let header = conn.send(command, target, payload, timeout)?;
        check_reply(&header, command, target, false)?;
        Ok(Reply { header })
    }

    /// Return a wrapper that executes operations for a target device (known by
    /// NetID and port).
    ///
    /// The local NetID `127.0.0.1.1.1` is mapped to the connection's source
    /// NetID, so that you can talk to a local PLC using:
    ///
    /// ```rust,ignore
    /// routes.add_route("127.0.0.1.1.1", "127.0.0.1", None)?;
    /// let client = Client::new(routes, ..., Source::Request);
    /// let device = client.device(AmsAddr::new(AmsNetId::local(), 851));
    /// ```
    ///
    /// without knowing its NetID.
    pub fn device(&self, addr: AmsAddr) -> Device<'_> {
        Device { client: self, addr }
    }
}

/// Validate a reply against the request it answers.
pub(crate) fn check_reply(
    reply: &AmsHeader,
    command: Command,
    target: AmsAddr,
    check_result: bool,
) -> Result<()> {
    let action = command.action();
    // The source netid/port must match what we sent.
    if reply.source != target {
        return Err(Error::Reply(action, "unexpected source address", 0));
    }
    if reply.command != command {
        return Err(Error::Reply(action, "unexpected command", reply.command as u32));
    }
    // State flags must be "4 | 1".
    if reply.state_flags != StateFlags::response() {
        return Err(Error::Reply(
            action,
            "unexpected state flags",
            reply.state_flags.bits().into(),
        ));
    }
    if reply.error_code != 0 {
        return ads_error(action, reply.error_code);
    }
    // Check result field in payload, only relevant if error_code == 0.
    let result = reply_result(&reply.payload);
    if check_result && result != 0 {
        return ads_error(action, result);
    }
    Ok(())
}

fn reply_result(payload: &[u8]) -> u32 {
    U32::read_from_prefix(payload).map_or(0, |(result, _)| result.get())
}

/// A validated reply to an ADS request.
#[derive(Clone, Debug)]
pub struct Reply {
    header: AmsHeader,
}

impl Reply {
    pub fn header(&self) -> &AmsHeader {
        &self.header
    }

    pub fn into_header(self) -> AmsHeader {
        self.header
    }

    /// The result field of the reply (0 if there is none).
    pub fn result(&self) -> u32 {
        reply_result(&self.header.payload)
    }

    /// The complete reply payload, including the result field.
    pub fn payload(&self) -> &[u8] {
        &self.header.payload
    }

    /// The reply payload after the result field.
    pub fn data(&self) -> &[u8] {
        self.header.payload.get(4..).unwrap_or(&[])
    }
}

/// Largest number of sub-requests sent in one sum-up request by the
/// by-name list operations.  Larger requests can disturb the PLC cycle.
pub const MAX_SUM_REQUESTS: usize = 500;

/// A `Client` wrapper that talks to a specific ADS device.
#[derive(Clone, Copy)]
pub struct Device<'c> {
    /// The underlying `Client`.
    pub client: &'c Client,
    addr: AmsAddr,
}

impl Device<'_> {
    /// The address of the device.
    pub fn addr(&self) -> AmsAddr {
        self.addr
    }

    fn request(&self, command: Command, payload: Vec<u8>) -> Result<Reply> {
        self.client
            .request(self.addr, command, payload, self.client.timeouts.read)
    }

    /// Read the device's name + version.
    pub fn get_info(&self) -> Result<DeviceInfo> {
        let reply = self.request(Command::DevInfo, Vec::new())?;
        Ok(DeviceInfo::decode(reply.data())?)
    }

    /// Read some data at a given index group/offset.  Returned data can be shorter than
    /// the buffer, the length is the return value.
    pub fn read(&self, index_group: u32, index_offset: u32, data: &mut [u8]) -> Result<usize> {
        let request = ReadRequest {
            index_group,
            index_offset,
            length: data.len().try_into()?,
        };
        let reply = self.request(Command::Read, request.encode()?)?;
        copy_response(Command::Read.action(), reply.payload(), data)
    }

    /// Read some data at a given index group/offset, ensuring that the returned data has
    /// exactly the size of the passed buffer.
    pub fn read_exact(&self, index_group: u32, index_offset: u32, data: &mut [u8]) -> Result<()> {
        let len = self.read(index_group, index_offset, data)?;
        if len != data.len() {
            return Err(Error::Reply("read data", "got less data than expected", len as u32));
        }
        Ok(())
    }

    /// Read data of given type.
    ///
    /// Any type that supports `zerocopy::FromBytes` can be read.  You can also
    /// derive that trait on your own structures and read structured data
    /// directly from the symbol.
    ///
    /// Note: to be independent of the host's byte order, use the integer types
    /// defined in `zerocopy::byteorder`.
    pub fn read_value<T: Default + IntoBytes + FromBytes>(
        &self,
        index_group: u32,
        index_offset: u32,
    ) -> Result<T> {
        let mut buf = T::default();
        self.read_exact(index_group, index_offset, buf.as_mut_bytes())?;
        Ok(buf)
    }

    /// Write some data to a given index group/offset.
    pub fn write(&self, index_group: u32, index_offset: u32, data: &[u8]) -> Result<()> {
        let request = WriteRequest { index_group, index_offset, data };
        self.request(Command::Write, request.encode()?)?;
        Ok(())
    }

    /// Write data of given type.
    ///
    /// See `read_value` for details.
    pub fn write_value<T: IntoBytes + Immutable>(
        &self,
        index_group: u32,
        index_offset: u32,
        value: &T,
    ) -> Result<()> {
        self.write(index_group, index_offset, value.as_bytes())
    }

    /// Write some data to a given index group/offset and then read back some
    /// reply from there.  This is not the same as a write() followed by read();
    /// it is used as a kind of RPC call.
    pub fn write_read(
        &self,
        index_group: u32,
        index_offset: u32,
        write_data: &[u8],
        read_data: &mut [u8],
    ) -> Result<usize> {
        let request = ReadWriteRequest {
            index_group,
            index_offset,
            read_length: read_data.len().try_into()?,
            data: write_data,
        };
        let reply = self.request(Command::ReadWrite, request.encode()?)?;
        copy_response(Command::ReadWrite.action(), reply.payload(), read_data)
    }

    /// Like `write_read`, but ensure the returned data length matches the output buffer.
    pub fn write_read_exact(
        &self,
        index_group: u32,
        index_offset: u32,
        write_data: &[u8],
        read_data: &mut [u8],
    ) -> Result<()> {
        let len = self.write_read(index_group, index_offset, write_data, read_data)?;
        if len != read_data.len() {
            return Err(Error::Reply(
                "write/read data",
                "got less data than expected",
                len as u32,
            ));
        }
        Ok(())
    }

    /// Read multiple index groups/offsets with one ADS request (a "sum-up" request).
    ///
    /// This function only returns Err on errors that cause the whole sum-up
    /// request to fail (e.g. if the device doesn't support such requests).  If
    /// the request as a whole succeeds, each single read can have returned its
    /// own error.  The [`SumReadRequest::data`] method will return either the
    /// data or the error for each read.
    ///
    /// Example:
    /// ```ignore
    /// let mut buf_1 = [0; 128];  // request reading 128 bytes
    /// let mut buf_2 = [0; 128];  // from two indices
    /// let mut reqs = [SumReadRequest::new(ix1, off1, &mut buf_1),
    ///                 SumReadRequest::new(ix2, off2, &mut buf_2)];
    /// device.read_multi(&mut reqs)?;
    /// let res_1 = reqs[0].data()?;
    /// let res_2 = reqs[1].data()?;
    /// ```
    pub fn read_multi(&self, requests: &mut [SumReadRequest]) -> Result<()> {
        let nreq = requests.len();
        // The reply has all results, then the data of all requests, each
        // with its requested length.
        let rlen = requests
            .iter()
            .map(|r| size_of::<u32>() + r.rbuf.len())
            .sum::<usize>();
        let mut wdata = Vec::with_capacity(size_of::<IndexLength>() * nreq);
        for req in requests.iter() {
            wdata.extend_from_slice(req.req.as_bytes());
        }
        let request = ReadWriteRequest {
            index_group: index::SUMUP_READ,
            index_offset: nreq.try_into()?,
            read_length: rlen.try_into()?,
            data: &wdata,
        };
        let reply = self.request(Command::ReadWrite, request.encode()?)?;
        let response = ReadResponse::decode(reply.payload())?;
        if response.data.len() < rlen {
            return Err(Error::Reply(
                "multi-read data",
                "got less data than expected",
                response.data.len() as u32,
            ));
        }
        let (results, mut data) = response.data.split_at(size_of::<u32>() * nreq);
        for (req, result) in requests.iter_mut().zip(results.chunks_exact(4)) {
            req.result = LE::read_u32(result);
            let (chunk, rest) = data.split_at(req.rbuf.len());
            req.rbuf.copy_from_slice(chunk);
            data = rest;
        }
        Ok(())
    }

    /// Write multiple index groups/offsets with one ADS request (a "sum-up" request).
    ///
    /// This function only returns Err on errors that cause the whole sum-up
    /// request to fail (e.g. if the device doesn't support such requests).  If
    /// the request as a whole succeeds, each single write can have returned its
    /// own error.  The [`SumWriteRequest::ensure`] method will return the error for
    /// each write.
    pub fn write_multi(&self, requests: &mut [SumWriteRequest]) -> Result<()> {
        let nreq = requests.len();
        let rlen = size_of::<u32>() * nreq;
        let wlen = requests
            .iter()
            .map(|r| size_of::<IndexLength>() + r.wbuf.len())
            .sum::<usize>();
        let mut wdata = Vec::with_capacity(wlen);
        for req in requests.iter() {
            wdata.extend_from_slice(req.req.as_bytes());
        }
        for req in requests.iter() {
            wdata.extend_from_slice(req.wbuf);
        }
        let request = ReadWriteRequest {
            index_group: index::SUMUP_WRITE,
            index_offset: nreq.try_into()?,
            read_length: rlen.try_into()?,
            data: &wdata,
        };
        let reply = self.request(Command::ReadWrite, request.encode()?)?;
        let response = ReadResponse::decode(reply.payload())?;
        if response.data.len() < rlen {
            return Err(Error::Reply(
                "multi-write data",
                "got less data than expected",
                response.data.len() as u32,
            ));
        }
        for (req, result) in requests.iter_mut().zip(response.data.chunks_exact(4)) {
            req.result = LE::read_u32(result);
        }
        Ok(())
    }

    /// Return the ADS and device state of the device.
    pub fn get_state(&self) -> Result<(AdsState, u16)> {
        let reply = self.request(Command::ReadState, Vec::new())?;
        let state = StateResponse::decode(reply.payload())?;

        // Convert ADS state to the enum type
        let ads_state = AdsState::try_from(state.ads_state)
            .map_err(|e| Error::Reply("read state", e, state.ads_state.into()))?;

        Ok((ads_state, state.dev_state))
    }

    /// (Try to) set the ADS and device state of the device.
    pub fn write_control(&self, ads_state: AdsState, dev_state: u16) -> Result<()> {
        let request = WriteControlRequest {
            ads_state: ads_state as u16,
            dev_state,
            data: &[],
        };
        self.request(Command::WriteControl, request.encode()?)?;
        Ok(())
    }

    /// Add a notification for an index group/offset or a symbol.
    ///
    /// `callback` is called with each sample and the user handle, which is
    /// `user_handle` or a newly minted one.  Callbacks run on the
    /// connection's reader thread: they should be quick, and must not make
    /// requests to the same device.
    ///
    /// If the notification is not deleted explicitly using
    /// `delete_notification`, it is deleted when the connection is closed.
    pub fn add_notification<F>(
        &self,
        location: &Location,
        attributes: &Attributes,
        user_handle: Option<u32>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: FnMut(&Sample<'_>, u32) + Send + 'static,
    {
        let (conn, target) = self.client.resolve(self.addr)?;
        let timeout = self.client.timeouts.read;

        let (index_group, index_offset, symbol_handle) = match location {
            Location::Index(group, offset) => (*group, *offset, None),
            Location::Symbol(name) => {
                let handle = symbol::acquire(*self, name)?;
                (index::RW_SYMVAL_BYHANDLE, handle, Some(handle))
            }
        };
        let user_handle = user_handle.unwrap_or_else(|| conn.dispatcher().mint_user_handle());
        let registration = Registration::new(
            target,
            user_handle,
            location.clone(),
            attributes.clone(),
            symbol_handle,
            Box::new(callback),
        );

        let sent = AddNotificationRequest {
            index_group,
            index_offset,
            attributes: attributes.clone(),
        }
        .encode()
        .and_then(|payload| conn.send_add_notification(target, payload, timeout, registration));
        let release_symbol = || {
            if let Some(handle) = symbol_handle {
                let _ = symbol::release(*self, handle);
            }
        };
        let reply = match sent {
            Ok(reply) => reply,
            Err(e) => {
                release_symbol();
                return Err(e);
            }
        };

        let handle = AddNotificationResponse::decode(&reply.payload).map(|r| r.handle);
        match (check_reply(&reply, Command::AddNotification, target, true), handle) {
            (Ok(()), Ok(handle)) => Ok(Subscription { target, handle, user_handle }),
            (Ok(()), Err(e)) => {
                release_symbol();
                Err(e.into())
            }
            (Err(e), handle) => {
                // The reader installs the registration before the reply is
                // checked here; a rejected reply must not leave it behind.
                match handle.ok().and_then(|handle| conn.discard_notification(target, handle)) {
                    Some(Ok(())) => debug!("discarded notification on {} after rejected reply", target),
                    Some(Err(del)) => debug!("discarding notification on {}: {}", target, del),
                    None => release_symbol(),
                }
                Err(e)
            }
        }
    }

    /// Delete a notification with given handle.
    ///
    /// The local registration is removed even if the device reports an
    /// error.  Deleting an unknown handle does nothing.
    pub fn delete_notification(&self, handle: notif::Handle) -> Result<()> {
        let conn = match self.client.connection(self.addr.netid()) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let target = if self.addr.netid() == AmsNetId::local() {
            self.addr.with_netid(conn.source().netid())
        } else {
            self.addr
        };
        conn.delete_notification(target, handle)
    }

    /// Read a symbol's value by name.  The returned data must fill the buffer.
    pub fn read_by_name(&self, name: &str, data: &mut [u8]) -> Result<()> {
        symbol::Handle::new(*self, name)?.read(data)
    }

    /// Write a symbol's value by name.
    pub fn write_by_name(&self, name: &str, data: &[u8]) -> Result<()> {
        symbol::Handle::new(*self, name)?.write(data)
    }

    /// Read a symbol's value by name as a given type.
    pub fn read_value_by_name<T: Default + IntoBytes + FromBytes>(&self, name: &str) -> Result<T> {
        symbol::Handle::new(*self, name)?.read_value()
    }

    /// Write a symbol's value by name as a given type.
    pub fn write_value_by_name<T: IntoBytes + Immutable>(&self, name: &str, value: &T) -> Result<()> {
        symbol::Handle::new(*self, name)?.write_value(value)
    }

    /// Read several symbols by name, using sum-up requests of at most
    /// `MAX_SUM_REQUESTS` reads each.
    ///
    /// The symbols are looked up with `symbol::get_info_ex` first; if a
    /// lookup fails, so does the whole call.  Otherwise the result holds
    /// the data or the error of each read, in the order of `names`.
    pub fn read_list_by_name(&self, names: &[&str]) -> Result<Vec<Result<Vec<u8>>>> {
        let entries = self.lookup_symbols(names.iter().copied())?;
        let mut values = Vec::with_capacity(entries.len());
        for chunk in entries.chunks(MAX_SUM_REQUESTS) {
            let mut buffers = chunk.iter().map(|entry| vec![0; entry.size]).collect::<Vec<_>>();
            let mut requests = chunk
                .iter()
                .zip(buffers.iter_mut())
                .map(|(entry, buf)| SumReadRequest::new(entry.index_group, entry.index_offset, buf))
                .collect::<Vec<_>>();
            self.read_multi(&mut requests)?;
            values.extend(requests.iter().map(|req| req.data().map(<[u8]>::to_vec)));
        }
        Ok(values)
    }

    /// Write several symbols by name, using sum-up requests of at most
    /// `MAX_SUM_REQUESTS` writes each.
    ///
    /// Lookup failures fail the whole call, like in `read_list_by_name`.
    /// The result holds the outcome of each write, in the order of
    /// `values`.
    pub fn write_list_by_name(&self, values: &[(&str, &[u8])]) -> Result<Vec<Result<()>>> {
        let entries = self.lookup_symbols(values.iter().map(|&(name, _)| name))?;
        let mut results = Vec::with_capacity(entries.len());
        for (entry_chunk, value_chunk) in entries.chunks(MAX_SUM_REQUESTS).zip(values.chunks(MAX_SUM_REQUESTS)) {
            let mut requests = entry_chunk
                .iter()
                .zip(value_chunk)
                .map(|(entry, &(_, data))| SumWriteRequest::new(entry.index_group, entry.index_offset, data))
                .collect::<Vec<_>>();
            self.write_multi(&mut requests)?;
            results.extend(requests.iter().map(SumWriteRequest::ensure));
        }
        Ok(results)
    }

    fn lookup_symbols<'n>(&self, names: impl Iterator<Item = &'n str>) -> Result<Vec<symbol::SymbolEntry>> {
        names.map(|name| symbol::get_info_ex(*self, name)).collect()
    }
}

/// Copy the data of a Read/ReadWrite reply into the user buffer.
fn copy_response(action: &'static str, payload: &[u8], buf: &mut [u8]) -> Result<usize> {
    let response = ReadResponse::decode(payload)?;
    let len = response.data.len();
    if len > buf.len() {
        return Err(Error::Reply(action, "got more data than requested", len as u32));
    }
    buf[..len].copy_from_slice(response.data);
    Ok(len)
}

/// The ADS state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
#[repr(u16)]
pub enum AdsState {
    Invalid = 0,
    Idle = 1,
    Reset = 2,
    Init = 3,
    Start = 4,
    Run = 5,
    Stop = 6,
    SaveCfg = 7,
    LoadCfg = 8,
    PowerFail = 9,
    PowerGood = 10,
    Error = 11,
    Shutdown = 12,
    Suspend = 13,
    Resume = 14,
    Config = 15,
    Reconfig = 16,
    Stopping = 17,
    Incompatible = 18,
    Exception = 19,
}

impl TryFrom<u16> for AdsState {
    type Error = &'static str;

    fn try_from(value: u16) -> std::result::Result<Self, &'static str> {
        Ok(match value {
            0 => Self::Invalid,
            1 => Self::Idle,
            2 => Self::Reset,
            3 => Self::Init,
            4 => Self::Start,
            5 => Self::Run,
            6 => Self::Stop,
            7 => Self::SaveCfg,
            8 => Self::LoadCfg,
            9 => Self::PowerFail,
            10 => Self::PowerGood,
            11 => Self::Error,
            12 => Self::Shutdown,
            13 => Self::Suspend,
            14 => Self::Resume,
            15 => Self::Config,
            16 => Self::Reconfig,
            17 => Self::Stopping,
            18 => Self::Incompatible,
            19 => Self::Exception,
            _ => return Err("invalid state constant"),
        })
    }
}

impl FromStr for AdsState {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match &*s.to_ascii_lowercase() {
            "invalid" => Self::Invalid,
            "idle" => Self::Idle,
            "reset" => Self::Reset,
            "init" => Self::Init,
            "start" => Self::Start,
            "run" => Self::Run,
            "stop" => Self::Stop,
            "savecfg" => Self::SaveCfg,
            "loadcfg" => Self::LoadCfg,
            "powerfail" => Self::PowerFail,
            "powergood" => Self::PowerGood,
            "error" => Self::Error,
            "shutdown" => Self::Shutdown,
            "suspend" => Self::Suspend,
            "resume" => Self::Resume,
            "config" => Self::Config,
            "reconfig" => Self::Reconfig,
            "stopping" => Self::Stopping,
            "incompatible" => Self::Incompatible,
            "exception" => Self::Exception,
            _ => return Err("invalid state name"),
        })
    }
}

/// A single request for a [`Device::read_multi`] request.
pub struct SumReadRequest<'buf> {
    req: IndexLength,
    result: u32,
    rbuf: &'buf mut [u8],
}

impl<'buf> SumReadRequest<'buf> {
    /// Create the request with given index group, index offset and result buffer.
    pub fn new(index_group: u32, index_offset: u32, buffer: &'buf mut [u8]) -> Self {
        Self {
            req: IndexLength {
                index_group: U32::new(index_group),
                index_offset: U32::new(index_offset),
                length: U32::new(buffer.len() as u32),
            },
            result: 0,
            rbuf: buffer,
        }
    }

    /// Get the returned data.
    ///
    /// If the request returned an error, returns Err.
    pub fn data(&self) -> Result<&[u8]> {
        if self.result != 0 {
            ads_error("multi-read data", self.result)
        } else {
            Ok(self.rbuf)
        }
    }
}

/// A single request for a [`Device::write_multi`] request.
pub struct SumWriteRequest<'buf> {
    req: IndexLength,
    result: u32,
    wbuf: &'buf [u8],
}

impl<'buf> SumWriteRequest<'buf> {
    /// Create the request with given index group, index offset and input buffer.
    pub fn new(index_group: u32, index_offset: u32, buffer: &'buf [u8]) -> Self {
        Self {
            req: IndexLength {
                index_group: U32::new(index_group),
                index_offset: U32::new(index_offset),
                length: U32::new(buffer.len() as u32),
            },
            result: 0,
            wbuf: buffer,
        }
    }

    /// Verify that the data was successfully written.
    ///
    /// If the request returned an error, returns Err.
    pub fn ensure(&self) -> Result<()> {
        if self.result != 0 {
            ads_error("multi-write data", self.result)
        } else {
            Ok(())
        }
    }
}
