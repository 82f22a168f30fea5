//! Implements the Beckhoff UDP message protocol for basic operations:
//! identifying a system and adding routes to its router.

use std::convert::TryInto;
use std::io::Write;
use std::net::{ToSocketAddrs, UdpSocket};
use std::str;
use std::time::Duration;

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, LE};

use crate::errors::{ads_error, ErrContext};
use crate::{AmsAddr, AmsNetId, Error, Result};

/// Magic number for the first four bytes of each UDP packet.
pub const BECKHOFF_UDP_MAGIC: u32 = 0x_71_14_66_03;

/// How long to wait for a UDP reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

const HEADER_SIZE: usize = 24;

/// Represents a message in the UDP protocol.
pub struct Message {
    items: Vec<(u16, usize, usize)>,
    data: Vec<u8>,
}

/// The operation that the PLC should execute.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceId {
    /// Get basic information about the system.
    Identify = 1,
    /// Add an AMS route to the system.
    AddRoute = 6,
}

/// Identifies a piece of information in the UDP message.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Status = 1,
    Password = 2,
    TCVersion = 3,
    OSVersion = 4,
    ComputerName = 5,
    NetID = 7,
    Options = 9,
    RouteName = 12,
    UserName = 13,
}

impl Message {
    /// Create a new UDP message.
    pub fn new(service: ServiceId, source: AmsAddr) -> Self {
        let mut data = Vec::with_capacity(100);
        data.extend_from_slice(&BECKHOFF_UDP_MAGIC.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // invoke ID
        data.extend_from_slice(&(service as u32).to_le_bytes());
        data.extend_from_slice(&source.netid().0);
        data.extend_from_slice(&source.port().to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // number of items
        Self { items: Vec::with_capacity(8), data }
    }

    /// Parse a UDP message from a byte slice, checking that it belongs to
    /// `service`.  Replies have `0x8000_0000` added to the service.
    pub fn parse(data: &[u8], service: u32) -> Result<Self> {
        let invalid = |what| Error::Reply("parsing UDP message", what, 0);
        let mut ptr = data;
        let mut header = || ptr.read_u32::<LE>().map_err(|_| invalid("message too short"));
        if header()? != BECKHOFF_UDP_MAGIC {
            return Err(invalid("magic not recognized"));
        }
        if header()? != 0 {
            return Err(invalid("invalid invoke ID"));
        }
        if header()? != service {
            return Err(invalid("unexpected service ID"));
        }
        let _source = AmsAddr::read_from(&mut ptr).map_err(|_| invalid("message too short"))?;
        let nitems = ptr.read_u32::<LE>().map_err(|_| invalid("message too short"))?;

        let mut items = Vec::with_capacity(nitems.min(64) as usize);
        let mut pos = HEADER_SIZE;
        for _ in 0..nitems {
            let tag = ptr.read_u16::<LE>().map_err(|_| invalid("item header truncated"))?;
            let len = ptr.read_u16::<LE>().map_err(|_| invalid("item header truncated"))? as usize;
            if ptr.len() < len {
                return Err(invalid("item data truncated"));
            }
            items.push((tag, pos + 4, pos + 4 + len));
            pos += 4 + len;
            ptr = &ptr[len..];
        }
        Ok(Self { items, data: data.to_vec() })
    }

    /// Set the service ID, e.g. to make a reply.
    pub fn set_service(&mut self, service: u32) {
        LE::write_u32(&mut self.data[8..12], service);
    }

    pub fn service(&self) -> u32 {
        LE::read_u32(&self.data[8..12])
    }

    fn push_item(&mut self, tag: Tag, data: &[u8], terminate: bool) -> Result<()> {
        let len = data.len() + terminate as usize;
        let len: u16 = len
            .try_into()
            .map_err(|_| Error::Reply("building UDP message", "item too long", len as u32))?;
        // Writing into a Vec can't fail.
        let _ = self.data.write_u16::<LE>(tag as u16);
        let _ = self.data.write_u16::<LE>(len);
        let start = self.data.len();
        let _ = self.data.write_all(data);
        if terminate {
            self.data.push(0);
        }
        self.items.push((tag as u16, start, self.data.len()));
        let count = self.items.len() as u32;
        LE::write_u32(&mut self.data[20..HEADER_SIZE], count);
        Ok(())
    }

    /// Add a tag containing arbitrary bytes.
    pub fn add_bytes(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.push_item(tag, data, false)
    }

    /// Add a tag containing a string with null terminator.
    pub fn add_str(&mut self, tag: Tag, data: &str) -> Result<()> {
        self.push_item(tag, data.as_bytes(), true)
    }

    /// Add a tag containing an u32.
    pub fn add_u32(&mut self, tag: Tag, data: u32) -> Result<()> {
        self.push_item(tag, &data.to_le_bytes(), false)
    }

    fn map_tag<'a, O, F>(&'a self, tag: Tag, map: F) -> Option<O>
    where
        F: Fn(&'a [u8]) -> Option<O>,
    {
        self.items
            .iter()
            .find(|item| item.0 == tag as u16)
            .and_then(|&(_, i, j)| map(&self.data[i..j]))
    }

    /// Get the data for given tag as bytes.
    pub fn get_bytes(&self, tag: Tag) -> Option<&[u8]> {
        self.map_tag(tag, Some)
    }

    /// Get the data for given tag as null-terminated string.
    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        self.map_tag(tag, |b| {
            let b = b.split(|&ch| ch == 0).next().unwrap_or(b);
            str::from_utf8(b).ok()
        })
    }

    /// Get the data for given tag as a u32.
    pub fn get_u32(&self, tag: Tag) -> Option<u32> {
        self.map_tag(tag, |mut b| b.read_u32::<LE>().ok())
    }

    /// Get the AMS address originating the message.
    pub fn get_source(&self) -> AmsAddr {
        let netid = AmsNetId::from_slice(&self.data[12..18]).unwrap_or_default();
        AmsAddr::new(netid, LE::read_u16(&self.data[18..20]))
    }

    /// The complete UDP packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Send the packet and receive a reply from the server.
    pub fn send_receive(&self, to: impl ToSocketAddrs) -> Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0").ctx("binding UDP socket")?;
        sock.send_to(self.as_bytes(), to).ctx("sending UDP request")?;

        let mut reply = [0; 576];
        sock.set_read_timeout(Some(REPLY_TIMEOUT)).ctx("setting UDP timeout")?;
        let (n, _) = sock.recv_from(&mut reply).ctx("receiving UDP reply")?;

        Self::parse(&reply[..n], self.service() | 0x8000_0000)
    }
}

/// Parameters of a route to add with `add_route_to_plc`.
#[derive(Clone, Debug)]
pub struct RouteRequest<'a> {
    /// The NetID of the route's target (usually our own).
    pub netid: AmsNetId,
    /// The IP address or hostname of the route's target (when using
    /// hostnames instead of IP addresses, beware of Windows hostname
    /// resolution).
    pub host: &'a str,
    /// Name of the route, default is `host`.
    pub route_name: Option<&'a str>,
    /// System username for the router, default is `Administrator`.
    pub username: Option<&'a str>,
    /// System password for the given user, default is `1`.
    pub password: Option<&'a str>,
    /// Marks the route as "temporary".
    pub temporary: bool,
}

/// Send a UDP message for setting a route on the system at `target` (host,
/// port; the port should normally be `ADS_UDP_PORT`).
pub fn add_route_to_plc(target: (&str, u16), route: &RouteRequest<'_>) -> Result<()> {
    let mut packet = Message::new(ServiceId::AddRoute, AmsAddr::new(route.netid, 0));
    packet.add_bytes(Tag::NetID, &route.netid.0)?;
    packet.add_str(Tag::ComputerName, route.host)?;
    packet.add_str(Tag::UserName, route.username.unwrap_or("Administrator"))?;
    packet.add_str(Tag::Password, route.password.unwrap_or("1"))?;
    packet.add_str(Tag::RouteName, route.route_name.unwrap_or(route.host))?;
    if route.temporary {
        packet.add_u32(Tag::Options, 1)?;
    }

    let reply = packet.send_receive(target)?;

    match reply.get_u32(Tag::Status) {
        None => Err(Error::Reply("adding route", "got no status in route reply", 0)),
        Some(0) => Ok(()),
        Some(n) => ads_error("adding route", n),
    }
}

/// Basic information about a system, from an Identify request.
#[derive(Clone, Debug)]
pub struct SysInfo {
    pub netid: AmsNetId,
    pub hostname: String,
    pub twincat_version: (u8, u8, u16),
    pub os_version: (&'static str, u32, u32, u32, String),
}

/// Send a UDP message for querying remote system NetID.
pub fn get_netid(target: (&str, u16)) -> Result<AmsNetId> {
    let packet = Message::new(ServiceId::Identify, AmsAddr::default());
    let reply = packet.send_receive(target)?;
    Ok(reply.get_source().netid())
}

/// Send a UDP message for querying remote system information.
pub fn get_info(target: (&str, u16)) -> Result<SysInfo> {
    let packet = Message::new(ServiceId::Identify, AmsAddr::default());
    let reply = packet.send_receive(target)?;

    let twincat_version = match reply.get_bytes(Tag::TCVersion) {
        Some(v) if v.len() >= 4 => (v[0], v[1], LE::read_u16(&v[2..4])),
        _ => (0, 0, 0),
    };
    let os_version = match reply.get_bytes(Tag::OSVersion) {
        Some(bytes) if bytes.len() >= 22 => parse_os_version(bytes),
        Some(_) => ("Unknown OS info format", 0, 0, 0, String::new()),
        None => ("No OS info", 0, 0, 0, String::new()),
    };
    Ok(SysInfo {
        netid: reply.get_source().netid(),
        hostname: reply.get_str(Tag::ComputerName).unwrap_or("unknown").into(),
        twincat_version,
        os_version,
    })
}

/// Parse an OSVERSIONINFO structure (length has been checked).
fn parse_os_version(bytes: &[u8]) -> (&'static str, u32, u32, u32, String) {
    let major = LE::read_u32(&bytes[4..8]);
    let minor = LE::read_u32(&bytes[8..12]);
    let build = LE::read_u32(&bytes[12..16]);
    let platform = match LE::read_u32(&bytes[16..20]) {
        1 => "Windows 9x",
        2 => "Windows NT",
        3 => "Windows CE",
        _ => "Unknown platform",
    };
    // UTF-16 service pack string.
    let units = bytes[20..]
        .chunks_exact(2)
        .map(LE::read_u16)
        .take_while(|&ch| ch != 0)
        .collect::<Vec<_>>();
    (platform, major, minor, build, String::from_utf16_lossy(&units))
}
