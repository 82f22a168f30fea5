// Code used in the crate test suite.

use std::convert::TryFrom;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LE};
use once_cell::sync::Lazy;

use crate::codec::{
    self, AddNotificationRequest, AddNotificationResponse, AmsHeader, Command, Decode,
    DeleteNotificationRequest, DeviceInfo, Encode, ReadRequest, ReadResponse, ReadWriteRequest,
    ResultResponse, StateFlags, StateResponse, WriteControlRequest, WriteRequest,
};
use crate::notif::NotificationWriter;
use crate::{index, AdsState, AmsAddr, AmsNetId, Client, RouteTable, Source, Timeouts};

mod test_netid;
mod test_notif;
mod test_route;

/// The NetID the test server answers to.
pub const DEVICE_NETID: AmsNetId = AmsNetId::new(1, 2, 3, 4, 5, 6);
/// The address the test server hands out for `Source::Request`.
pub const REQUESTED_SOURCE: AmsAddr = AmsAddr::new(AmsNetId::new(10, 1, 1, 1, 1, 1), 30000);
/// Timestamp of all notification samples: 2009-07-25 23:00 UTC.
pub const SAMPLE_STAMP: u64 = 128_930_364_000_000_000;

/// Reads in this group are answered after `ServerOpts::delay`.
pub const DELAY_GROUP: u32 = 0x6000;
/// Reads in this group are never answered.
pub const BLACKHOLE_GROUP: u32 = 0x6001;
/// Reads in this group are answered with a corrupted frame.
pub const KILL_GROUP: u32 = 0x6002;
/// Reads in this group are answered with a frame prefix declaring 4 GiB.
pub const HUGE_FRAME_GROUP: u32 = 0x6003;
/// ReadWrites in this group fail with 0x70B, but still return data.
pub const ERROR_DATA_GROUP: u32 = 0x5000;

/// Offset in PLC memory that the symbol "SYMBOL" maps to.
pub const SYMBOL_OFFSET: usize = 1020;
pub const SYMBOL_HANDLE: u32 = 77;
/// Symbol table of the server: (name, offset in PLC memory, size, type name, comment).
pub const SYMBOLS: [(&str, usize, u32, &str, &str); 2] = [
    ("SYMBOL", SYMBOL_OFFSET, 4, "UDINT", "test symbol"),
    ("MAIN.counter", 1000, 2, "UINT", ""),
];
/// ADS data type ID the server reports for all symbols.
pub const SYMBOL_DATA_TYPE: u32 = 19;
const FIRST_NOTIF_HANDLE: u32 = 132;

// Since Cargo tests run multi-threaded, start one server per thread and
// handle clients from the test functions in that thread.
thread_local! {
    static SERVER: Lazy<TestServer> = Lazy::new(|| {
        let opts = Arc::new(Mutex::new(ServerOpts::default()));
        let log = Arc::new(Mutex::new(ServerLog::default()));

        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let (opts_server, log_server) = (opts.clone(), log.clone());
        thread::spawn(move || {
            for client in socket.incoming().flatten() {
                let mut server = Server {
                    opts: opts_server.clone(),
                    log: log_server.clone(),
                    state: (AdsState::Run, 0),
                    data: vec![0; 1024],
                    notifs: Vec::new(),
                    next_handle: FIRST_NOTIF_HANDLE,
                };
                thread::spawn(move || server.handle_client(client));
            }
        });

        TestServer { port, opts, log }
    });
}

#[derive(Clone)]
pub struct TestServer {
    pub port: u16,
    opts: Arc<Mutex<ServerOpts>>,
    log: Arc<Mutex<ServerLog>>,
}

impl TestServer {
    /// A snapshot of what the server has seen so far.
    pub fn log(&self) -> ServerLog {
        self.log.lock().unwrap().clone()
    }

    /// A client with a route for `DEVICE_NETID` to this server.
    pub fn client(&self, timeouts: Timeouts, source: Source) -> Client {
        let routes = RouteTable::new();
        routes
            .add_route(&DEVICE_NETID.to_string(), &format!("127.0.0.1:{}", self.port), None)
            .unwrap();
        Client::new(routes, timeouts, source)
    }
}

// Configures different ways the server should behave.
#[derive(Clone, Default)]
pub struct ServerOpts {
    pub delay: Duration,
    pub unknown_command: bool,
    pub bad_notif: bool,
    pub ignore_invokeid: bool,
    /// Reply to AddNotification with unexpected state flags.
    pub bad_notif_flags: bool,
}

// Records requests that tests want to check.
#[derive(Clone, Default, Debug)]
pub struct ServerLog {
    /// (source, target, command) of each ADS request.
    pub requests: Vec<(AmsAddr, AmsAddr, Command)>,
    pub deleted_notifs: Vec<u32>,
    pub released_symbols: Vec<u32>,
    pub closed_ports: Vec<u16>,
}

/// Configure this thread's test server and clear its log.
pub fn config_test_server(opts: ServerOpts) -> TestServer {
    SERVER.with(|server| {
        *server.opts.lock().unwrap() = opts;
        *server.log.lock().unwrap() = ServerLog::default();
        (**server).clone()
    })
}

/// Poll `cond` until it holds, for at most 5 seconds.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

type Reply = (Vec<u8>, u32);

fn result_only(result: u32) -> Reply {
    (ResultResponse { result }.encode().unwrap(), 0)
}

fn read_reply(data: &[u8]) -> Reply {
    (ReadResponse { result: 0, data }.encode().unwrap(), 0)
}

/// Encode a symbol table entry, padded to a multiple of 4 bytes.
fn symbol_entry(&(name, offset, size, type_name, comment): &(&str, usize, u32, &str, &str)) -> Vec<u8> {
    let strings_len = name.len() + type_name.len() + comment.len() + 3;
    let entry_length = (30 + strings_len + 3) / 4 * 4;
    let mut entry = vec![0; 30];
    LE::write_u32(&mut entry[0..4], entry_length as u32);
    LE::write_u32(&mut entry[4..8], index::PLC_RW_M);
    LE::write_u32(&mut entry[8..12], offset as u32);
    LE::write_u32(&mut entry[12..16], size);
    LE::write_u32(&mut entry[16..20], SYMBOL_DATA_TYPE);
    LE::write_u32(&mut entry[20..24], 8);
    LE::write_u16(&mut entry[24..26], name.len() as u16);
    LE::write_u16(&mut entry[26..28], type_name.len() as u16);
    LE::write_u16(&mut entry[28..30], comment.len() as u16);
    for text in [name, type_name, comment] {
        entry.extend_from_slice(text.as_bytes());
        entry.push(0);
    }
    entry.resize(entry_length, 0);
    entry
}

struct Server {
    opts: Arc<Mutex<ServerOpts>>,
    log: Arc<Mutex<ServerLog>>,
    data: Vec<u8>,
    // The simulated device state.
    state: (AdsState, u16),
    // Active notifications: (handle, offset, length).
    notifs: Vec<(u32, usize, usize)>,
    next_handle: u32,
}

impl Server {
    fn handle_client(&mut self, mut socket: TcpStream) {
        loop {
            let mut prefix = [0; codec::TCP_HEADER_SIZE];
            if socket.read_exact(&mut prefix).is_err() {
                // connection was closed
                return;
            }
            let mut packet = vec![0; LE::read_u32(&prefix[2..]) as usize];
            if socket.read_exact(&mut packet).is_err() {
                return;
            }
            match LE::read_u16(&prefix) {
                0 => {}
                codec::ROUTER_PORT_CONNECT => {
                    let mut payload = REQUESTED_SOURCE.netid().0.to_vec();
                    payload.extend_from_slice(&REQUESTED_SOURCE.port().to_le_bytes());
                    let frame = codec::encode_router_frame(codec::ROUTER_PORT_CONNECT, &payload);
                    if socket.write_all(&frame.unwrap()).is_err() {
                        return;
                    }
                    continue;
                }
                codec::ROUTER_PORT_CLOSE => {
                    self.log.lock().unwrap().closed_ports.push(LE::read_u16(&packet));
                    continue;
                }
                other => panic!("unexpected AMS/TCP command {:#x}", other),
            }

            let request = codec::decode_header(&packet).unwrap();
            assert_eq!(request.state_flags, StateFlags::request());
            self.log.lock().unwrap().requests.push((request.source, request.target, request.command));
            let opts = self.opts.lock().unwrap().clone();

            // Special behavior for some index groups.
            if request.command == Command::Read {
                match ReadRequest::decode(&request.payload).map(|r| r.index_group) {
                    Ok(BLACKHOLE_GROUP) => continue,
                    Ok(KILL_GROUP) => {
                        let _ = socket.write_all(&codec::encode_router_frame(234, &[]).unwrap());
                        continue;
                    }
                    Ok(HUGE_FRAME_GROUP) => {
                        let mut prefix = vec![0, 0];
                        prefix.extend_from_slice(&u32::MAX.to_le_bytes());
                        let _ = socket.write_all(&prefix);
                        continue;
                    }
                    Ok(DELAY_GROUP) => thread::sleep(opts.delay),
                    _ => {}
                }
            }

            if opts.unknown_command {
                let mut frame = codec::encode_frame(&request.response(0, vec![1, 2, 3])).unwrap();
                frame[codec::TCP_HEADER_SIZE + 16] = 0x77;
                if socket.write_all(&frame).is_err() {
                    return;
                }
            }

            let (reply_data, error) = match request.command {
                Command::DevInfo => self.do_devinfo(&request.payload),
                Command::Read => self.do_read(&request.payload),
                Command::Write => self.do_write(&request.payload),
                Command::ReadState => self.do_read_state(&request.payload),
                Command::WriteControl => self.do_write_control(&request.payload),
                Command::AddNotification => self.do_add_notif(&request.payload),
                Command::DeleteNotification => self.do_del_notif(&request.payload),
                Command::ReadWrite => self.do_read_write(&request.payload),
                Command::Notification => (vec![], 0x701),
            };
            let success = error == 0 && ResultResponse::decode(&reply_data).map_or(false, |r| r.result == 0);

            let mut reply = request.response(error, reply_data);
            if opts.ignore_invokeid {
                reply.invoke_id = 0;
            }
            if opts.bad_notif_flags && request.command == Command::AddNotification {
                reply.state_flags = StateFlags::response() | StateFlags::HIGH_PRIORITY;
            }
            if socket.write_all(&codec::encode_frame(&reply).unwrap()).is_err() {
                return;
            }

            // Generate notifications: an initial sample for a new one, and
            // all of them after each data write.
            let data_write = WriteRequest::decode(&request.payload)
                .map_or(false, |w| w.index_group != index::RELEASE_SYMHANDLE);
            let notify: Vec<_> = match request.command {
                Command::AddNotification if success => self.notifs.last().cloned().into_iter().collect(),
                Command::Write if success && data_write => self.notifs.clone(),
                _ => vec![],
            };
            if !notify.is_empty() {
                let payload = if opts.bad_notif {
                    let mut payload = self.notification(&notify);
                    LE::write_u32(&mut payload[4..8], u32::MAX);
                    payload
                } else {
                    self.notification(&notify)
                };
                let header = AmsHeader {
                    target: request.source,
                    source: request.target,
                    command: Command::Notification,
                    state_flags: StateFlags::request(),
                    error_code: 0,
                    invoke_id: 0,
                    payload,
                };
                if socket.write_all(&codec::encode_frame(&header).unwrap()).is_err() {
                    return;
                }
            }
        }
    }

    fn notification(&self, notifs: &[(u32, usize, usize)]) -> Vec<u8> {
        let mut writer = NotificationWriter::new();
        writer.stamp(SAMPLE_STAMP);
        for &(handle, off, len) in notifs {
            writer.sample(handle, &self.data[off..][..len]).unwrap();
        }
        writer.finish().unwrap()
    }

    /// Map a symbol handle access to plain memory.
    fn offset(&self, index_group: u32, index_offset: u32) -> Result<usize, u32> {
        match index_group {
            index::PLC_RW_M => Ok(index_offset as usize),
            index::RW_SYMVAL_BYHANDLE if index_offset == SYMBOL_HANDLE => Ok(SYMBOL_OFFSET),
            index::RW_SYMVAL_BYHANDLE => Err(0x710),
            _ => Err(0x702),
        }
    }

    fn do_devinfo(&self, data: &[u8]) -> Reply {
        if !data.is_empty() {
            return (vec![], 0x706);
        }
        // no error, major 7, minor 1
        let mut out = 0u32.to_le_bytes().to_vec();
        DeviceInfo { name: "Nice device".into(), major: 7, minor: 1, version: 4024 }
            .encode_into(&mut out)
            .unwrap();
        (out, 0)
    }

    fn do_read_state(&self, data: &[u8]) -> Reply {
        if !data.is_empty() {
            return (vec![], 0x706);
        }
        let state = StateResponse {
            result: 0,
            ads_state: self.state.0 as u16,
            dev_state: self.state.1,
        };
        (state.encode().unwrap(), 0)
    }

    fn do_write_control(&mut self, data: &[u8]) -> Reply {
        let request = match WriteControlRequest::decode(data) {
            Ok(r) => r,
            Err(_) => return (vec![], 0x706),
        };
        match AdsState::try_from(request.ads_state) {
            Err(_) | Ok(AdsState::Invalid) => result_only(0x70B),
            Ok(ads_state) => {
                self.state = (ads_state, request.dev_state);
                result_only(0)
            }
        }
    }

    fn do_read(&self, data: &[u8]) -> Reply {
        let request = match ReadRequest::decode(data) {
            Ok(r) => r,
            Err(_) => return (vec![], 0x706),
        };
        let group = match request.index_group {
            DELAY_GROUP => index::PLC_RW_M,
            index::SYM_UPLOAD_INFO2 => {
                let table_length = SYMBOLS.iter().map(|sym| symbol_entry(sym).len()).sum::<usize>();
                let mut info = vec![0; 24];
                LE::write_u32(&mut info[0..4], SYMBOLS.len() as u32);
                LE::write_u32(&mut info[4..8], table_length as u32);
                return read_reply(&info[..(request.length as usize).min(24)]);
            }
            index::SYM_UPLOAD => {
                let table = SYMBOLS.iter().flat_map(symbol_entry).collect::<Vec<_>>();
                if table.len() > request.length as usize {
                    return result_only(0x705);
                }
                return read_reply(&table);
            }
            group => group,
        };
        let off = match self.offset(group, request.index_offset) {
            Ok(off) => off,
            Err(code) => return result_only(code),
        };
        let len = request.length as usize;
        if off + len > self.data.len() {
            return result_only(0x703);
        }
        read_reply(&self.data[off..][..len])
    }

    fn do_write(&mut self, data: &[u8]) -> Reply {
        let request = match WriteRequest::decode(data) {
            Ok(r) => r,
            Err(_) => return (vec![], 0x706),
        };
        if request.index_group == index::RELEASE_SYMHANDLE {
            if request.data != SYMBOL_HANDLE.to_le_bytes() {
                return result_only(0x710);
            }
            self.log.lock().unwrap().released_symbols.push(SYMBOL_HANDLE);
            return result_only(0);
        }
        let off = match self.offset(request.index_group, request.index_offset) {
            Ok(off) => off,
            Err(code) => return result_only(code),
        };
        if off + request.data.len() > self.data.len() {
            return result_only(0x703);
        }
        self.data[off..][..request.data.len()].copy_from_slice(request.data);
        result_only(0)
    }

    fn do_read_write(&mut self, data: &[u8]) -> Reply {
        let request = match ReadWriteRequest::decode(data) {
            Ok(r) => r,
            Err(_) => return (vec![], 0x706),
        };
        match request.index_group {
            index::GET_SYMHANDLE_BYNAME => {
                if request.data != b"SYMBOL" {
                    return result_only(0x710);
                }
                read_reply(&SYMBOL_HANDLE.to_le_bytes())
            }
            index::GET_SYMINFO_BYNAME => {
                if request.data != b"SYMBOL" {
                    return result_only(0x710);
                }
                let mut info = index::PLC_RW_M.to_le_bytes().to_vec();
                info.extend_from_slice(&(SYMBOL_OFFSET as u32).to_le_bytes());
                info.extend_from_slice(&4u32.to_le_bytes());
                read_reply(&info)
            }
            index::GET_SYMINFO_BYNAME_EX => {
                match SYMBOLS.iter().find(|sym| request.data == sym.0.as_bytes()) {
                    Some(sym) => read_reply(&symbol_entry(sym)),
                    None => result_only(0x710),
                }
            }
            index::SUMUP_READ => self.do_sum_read(request.index_offset, request.data),
            index::SUMUP_WRITE => self.do_sum_write(request.index_offset, request.data),
            ERROR_DATA_GROUP => {
                let reply = ReadResponse { result: 0x70B, data: &[1, 2] };
                (reply.encode().unwrap(), 0)
            }
            _ => result_only(0x702),
        }
    }

    fn do_sum_read(&self, count: u32, data: &[u8]) -> Reply {
        let mut results = Vec::new();
        let mut values = Vec::new();
        for chunk in data.chunks_exact(12).take(count as usize) {
            let request = ReadRequest::decode(chunk).unwrap();
            let len = request.length as usize;
            match self.offset(request.index_group, request.index_offset) {
                Ok(off) if off + len <= self.data.len() => {
                    results.extend_from_slice(&0u32.to_le_bytes());
                    values.extend_from_slice(&self.data[off..][..len]);
                }
                Ok(_) => {
                    results.extend_from_slice(&0x703u32.to_le_bytes());
                    values.resize(values.len() + len, 0);
                }
                Err(code) => {
                    results.extend_from_slice(&code.to_le_bytes());
                    values.resize(values.len() + len, 0);
                }
            }
        }
        results.extend_from_slice(&values);
        read_reply(&results)
    }

    fn do_sum_write(&mut self, count: u32, data: &[u8]) -> Reply {
        let (headers, mut values) = data.split_at(12 * count as usize);
        let mut results = Vec::new();
        for chunk in headers.chunks_exact(12) {
            let request = ReadRequest::decode(chunk).unwrap();
            let len = request.length as usize;
            let (value, rest) = values.split_at(len);
            values = rest;
            let code = match self.offset(request.index_group, request.index_offset) {
                Ok(off) if off + len <= self.data.len() => {
                    self.data[off..][..len].copy_from_slice(value);
                    0
                }
                Ok(_) => 0x703,
                Err(code) => code,
            };
            results.extend_from_slice(&code.to_le_bytes());
        }
        read_reply(&results)
    }

    fn do_add_notif(&mut self, data: &[u8]) -> Reply {
        let request = match AddNotificationRequest::decode(data) {
            Ok(r) => r,
            Err(_) => return (vec![], 0x706),
        };
        let off = match self.offset(request.index_group, request.index_offset) {
            Ok(off) => off,
            Err(code) => return result_only(code),
        };
        let len = request.attributes.length;
        if off + len > self.data.len() {
            return result_only(0x703);
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.notifs.push((handle, off, len));
        let reply = AddNotificationResponse { result: 0, handle };
        (reply.encode().unwrap(), 0)
    }

    fn do_del_notif(&mut self, data: &[u8]) -> Reply {
        let handle = match DeleteNotificationRequest::decode(data) {
            Ok(r) => r.handle,
            Err(_) => return (vec![], 0x706),
        };
        let before = self.notifs.len();
        self.notifs.retain(|n| n.0 != handle);
        if self.notifs.len() == before {
            return result_only(0x714);
        }
        self.log.lock().unwrap().deleted_notifs.push(handle);
        result_only(0)
    }
}
