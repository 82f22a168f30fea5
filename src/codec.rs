//! Encoding and decoding of AMS/TCP frames, AMS headers and the payloads of
//! the individual ADS commands.
//!
//! Nothing in here does I/O; the connection layer feeds bytes in and takes
//! frames out.
// https://infosys.beckhoff.com/content/1033/tc3_ads_intro/115845259.html?id=6032227753916597086

use std::convert::{TryFrom, TryInto};
use std::mem::size_of;
use std::ops::BitOr;
use std::time::Duration;

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::notif::{Attributes, TransmissionMode};
use crate::{AmsAddr, AmsNetId, Result};

/// Size of the AMS/TCP prefix (reserved/router command + length).
pub const TCP_HEADER_SIZE: usize = 6;
/// Size of the AMS header.
pub const AMS_HEADER_SIZE: usize = 32;
/// Size of the fixed part of a DeviceInfo reply, after the result field.
pub const DEVICE_INFO_SIZE: usize = 20;
/// Largest AMS/TCP frame length accepted from a stream (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// AMS/TCP command of a router frame: close a port.
pub const ROUTER_PORT_CLOSE: u16 = 0x0001;
/// AMS/TCP command of a router frame: request a port.
pub const ROUTER_PORT_CONNECT: u16 = 0x1000;
/// AMS/TCP command of a router frame: the router state changed.
pub const ROUTER_NOTE: u16 = 0x1001;
/// AMS/TCP command of a router frame: get the local NetID.
pub const ROUTER_GET_NETID: u16 = 0x1002;

/// An ADS protocol command.
// https://infosys.beckhoff.com/content/1033/tc3_ads_intro/115847307.html?id=7738940192708835096
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Return device info
    DevInfo = 1,
    /// Read some data
    Read = 2,
    /// Write some data
    Write = 3,
    /// Read the ADS and device state
    ReadState = 4,
    /// Set the ADS and device state
    WriteControl = 5,
    /// Add a notification for a given index
    AddNotification = 6,
    /// Delete a notification by handle
    DeleteNotification = 7,
    /// Change occurred in a given notification,
    /// can be sent by the PLC only
    Notification = 8,
    /// Write some data, then read back some data
    /// (used as a poor-man's function call)
    ReadWrite = 9,
}

impl Command {
    /// A short description of the action, used as error context.
    pub fn action(self) -> &'static str {
        match self {
            Command::DevInfo => "get device info",
            Command::Read => "read data",
            Command::Write => "write data",
            Command::ReadWrite => "write and read data",
            Command::ReadState => "read state",
            Command::WriteControl => "write control",
            Command::AddNotification => "add notification",
            Command::DeleteNotification => "delete notification",
            Command::Notification => "notification",
        }
    }
}

impl TryFrom<u16> for Command {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        Ok(match value {
            1 => Command::DevInfo,
            2 => Command::Read,
            3 => Command::Write,
            4 => Command::ReadState,
            5 => Command::WriteControl,
            6 => Command::AddNotification,
            7 => Command::DeleteNotification,
            8 => Command::Notification,
            9 => Command::ReadWrite,
            _ => return Err(value),
        })
    }
}

/// The state flags field of the AMS header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StateFlags(pub u16);

impl StateFlags {
    pub const RESPONSE: Self = Self(0x0001);
    pub const NO_RETURN: Self = Self(0x0002);
    pub const ADS_COMMAND: Self = Self(0x0004);
    pub const SYSTEM_COMMAND: Self = Self(0x0008);
    pub const HIGH_PRIORITY: Self = Self(0x0010);
    /// 8 bytes of timestamp are added to the header.
    pub const TIMESTAMP_ADDED: Self = Self(0x0020);
    pub const UDP: Self = Self(0x0040);
    /// Command sent during the init phase.
    pub const INIT_CMD: Self = Self(0x0080);
    pub const BROADCAST: Self = Self(0x8000);

    /// Flags of a request sent by us.
    pub const fn request() -> Self {
        Self::ADS_COMMAND
    }

    /// Flags a well-formed response carries.
    pub const fn response() -> Self {
        Self(Self::ADS_COMMAND.0 | Self::RESPONSE.0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if all flags in `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A decoded AMS header together with its payload.
///
/// The data length field of the wire format is always the length of
/// `payload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmsHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub command: Command,
    pub state_flags: StateFlags,
    pub error_code: u32,
    pub invoke_id: u32,
    pub payload: Vec<u8>,
}

impl AmsHeader {
    /// Create the header of a request.
    pub fn request(
        target: AmsAddr,
        source: AmsAddr,
        command: Command,
        invoke_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            target,
            source,
            command,
            state_flags: StateFlags::request(),
            error_code: 0,
            invoke_id,
            payload,
        }
    }

    /// Create the matching response header for this request.
    pub fn response(&self, error_code: u32, payload: Vec<u8>) -> Self {
        Self {
            target: self.source,
            source: self.target,
            command: self.command,
            state_flags: StateFlags::response(),
            error_code,
            invoke_id: self.invoke_id,
            payload,
        }
    }

    pub fn is_response(&self) -> bool {
        self.state_flags.contains(StateFlags::RESPONSE)
    }

    /// Number of bytes of the encoded header and payload.
    pub fn encoded_len(&self) -> usize {
        AMS_HEADER_SIZE + self.payload.len()
    }
}

/// A complete frame read from an AMS/TCP stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// An ADS command, response or notification.
    Ads(AmsHeader),
    /// A message to or from the AMS router itself.
    Router { command: u16, payload: Vec<u8> },
}

/// Errors from decoding frames and payloads.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not enough bytes for the frame or field; on a stream, wait for more.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },
    /// The command ID is not an ADS command.  `frame` holds the complete
    /// AMS header and payload.
    #[error("unknown ADS command {command}")]
    UnknownCommand { command: u16, frame: Vec<u8> },
    /// The AMS/TCP length does not agree with the AMS header.
    #[error("AMS/TCP length does not match AMS header")]
    InconsistentLength,
    /// The AMS/TCP command is neither ADS nor a known router message.
    #[error("unknown AMS/TCP packet type {0:#x}")]
    UnknownPacket(u16),
    /// The AMS/TCP prefix declares a length over `MAX_FRAME_SIZE`.
    #[error("AMS/TCP frame length {0} exceeds the limit")]
    FrameTooLarge(usize),
    /// A payload field holds a value outside its range.
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, u32),
}

fn truncated(needed: usize, available: usize) -> DecodeError {
    DecodeError::TruncatedFrame { needed, available }
}

/// Split a fixed-layout structure off the front of `data`.
fn split_fixed<T: FromBytes>(data: &[u8]) -> std::result::Result<(T, &[u8]), DecodeError> {
    T::read_from_prefix(data).map_err(|_| truncated(size_of::<T>(), data.len()))
}

/// Split `len` bytes off the front of `data`.
fn split_bytes(data: &[u8], len: usize) -> std::result::Result<(&[u8], &[u8]), DecodeError> {
    if data.len() < len {
        return Err(truncated(len, data.len()));
    }
    Ok(data.split_at(len))
}

/// Encode the AMS header and its payload.
pub fn encode_header(header: &AmsHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(header.encoded_len());
    write_header(header, &mut buf)?;
    Ok(buf)
}

fn write_header(header: &AmsHeader, buf: &mut Vec<u8>) -> Result<()> {
    let raw = AmsHeaderRaw {
        target_netid: header.target.netid(),
        target_port: U16::new(header.target.port()),
        source_netid: header.source.netid(),
        source_port: U16::new(header.source.port()),
        command: U16::new(header.command as u16),
        state_flags: U16::new(header.state_flags.bits()),
        data_length: U32::new(header.payload.len().try_into()?),
        error_code: U32::new(header.error_code),
        invoke_id: U32::new(header.invoke_id),
    };
    buf.extend_from_slice(raw.as_bytes());
    buf.extend_from_slice(&header.payload);
    Ok(())
}

/// Decode an AMS header and its payload from the start of `data`.
///
/// Bytes after the declared data length are ignored.
pub fn decode_header(data: &[u8]) -> std::result::Result<AmsHeader, DecodeError> {
    let (raw, rest) = split_fixed::<AmsHeaderRaw>(data)?;
    let data_length = raw.data_length.get() as usize;
    if rest.len() < data_length {
        return Err(truncated(AMS_HEADER_SIZE + data_length, data.len()));
    }
    let command = Command::try_from(raw.command.get()).map_err(|command| {
        DecodeError::UnknownCommand {
            command,
            frame: data[..AMS_HEADER_SIZE + data_length].to_vec(),
        }
    })?;
    Ok(AmsHeader {
        target: AmsAddr::new(raw.target_netid, raw.target_port.get()),
        source: AmsAddr::new(raw.source_netid, raw.source_port.get()),
        command,
        state_flags: StateFlags(raw.state_flags.get()),
        error_code: raw.error_code.get(),
        invoke_id: raw.invoke_id.get(),
        payload: rest[..data_length].to_vec(),
    })
}

/// Encode a complete AMS/TCP frame for an ADS message.
pub fn encode_frame(header: &AmsHeader) -> Result<Vec<u8>> {
    let tcp = TcpHeader {
        command: U16::new(0),
        length: U32::new(header.encoded_len().try_into()?),
    };
    let mut buf = Vec::with_capacity(TCP_HEADER_SIZE + header.encoded_len());
    buf.extend_from_slice(tcp.as_bytes());
    write_header(header, &mut buf)?;
    Ok(buf)
}

/// Encode a complete AMS/TCP frame for a router message.
pub fn encode_router_frame(command: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let tcp = TcpHeader {
        command: U16::new(command),
        length: U32::new(payload.len().try_into()?),
    };
    let mut buf = Vec::with_capacity(TCP_HEADER_SIZE + payload.len());
    buf.extend_from_slice(tcp.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one AMS/TCP frame from the start of `data`.
///
/// Returns the frame and the number of bytes it occupied.  On
/// `UnknownCommand`, the frame occupied `TCP_HEADER_SIZE + frame.len()`
/// bytes and the stream is still aligned; `InconsistentLength`,
/// `UnknownPacket` and `FrameTooLarge` leave it misaligned.
///
/// The length limit is checked as soon as the prefix is complete, so an
/// oversized frame is rejected before its data is buffered.
pub fn decode_frame(data: &[u8]) -> std::result::Result<(Frame, usize), DecodeError> {
    let (tcp, rest) = split_fixed::<TcpHeader>(data)?;
    let length = tcp.length.get() as usize;
    if length > MAX_FRAME_SIZE {
        return Err(DecodeError::FrameTooLarge(length));
    }
    let total = TCP_HEADER_SIZE + length;
    if rest.len() < length {
        return Err(truncated(total, data.len()));
    }
    let packet = &rest[..length];
    match tcp.command.get() {
        0 => {
            let (raw, _) =
                split_fixed::<AmsHeaderRaw>(packet).map_err(|_| DecodeError::InconsistentLength)?;
            if AMS_HEADER_SIZE + raw.data_length.get() as usize != length {
                return Err(DecodeError::InconsistentLength);
            }
            Ok((Frame::Ads(decode_header(packet)?), total))
        }
        command @ (ROUTER_PORT_CLOSE | ROUTER_PORT_CONNECT | ROUTER_NOTE | ROUTER_GET_NETID) => {
            Ok((Frame::Router { command, payload: packet.to_vec() }, total))
        }
        other => Err(DecodeError::UnknownPacket(other)),
    }
}

/// A command payload that can be written to the wire.
pub trait Encode {
    /// Number of bytes `encode_into` appends.
    fn encoded_len(&self) -> usize;

    /// Append the wire form to `buf`.
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Return the wire form as a new vector.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// A command payload that can be parsed from the wire.
pub trait Decode<'a>: Sized {
    fn decode(data: &'a [u8]) -> std::result::Result<Self, DecodeError>;
}

/// Payload of a Read request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub length: u32,
}

impl Encode for ReadRequest {
    fn encoded_len(&self) -> usize {
        size_of::<IndexLength>()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = IndexLength {
            index_group: U32::new(self.index_group),
            index_offset: U32::new(self.index_offset),
            length: U32::new(self.length),
        };
        buf.extend_from_slice(raw.as_bytes());
        Ok(())
    }
}

impl Decode<'_> for ReadRequest {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, _) = split_fixed::<IndexLength>(data)?;
        Ok(Self {
            index_group: raw.index_group.get(),
            index_offset: raw.index_offset.get(),
            length: raw.length.get(),
        })
    }
}

/// Payload of a Read or ReadWrite response.
///
/// A response with a nonzero result may consist of only the result field, in
/// which case `data` is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadResponse<'a> {
    pub result: u32,
    pub data: &'a [u8],
}

impl Encode for ReadResponse<'_> {
    fn encoded_len(&self) -> usize {
        size_of::<ResultLength>() + self.data.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = ResultLength {
            result: U32::new(self.result),
            length: U32::new(self.data.len().try_into()?),
        };
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.data);
        Ok(())
    }
}

impl<'a> Decode<'a> for ReadResponse<'a> {
    fn decode(data: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        let (result, _) = split_fixed::<U32>(data)?;
        if result.get() != 0 && data.len() < size_of::<ResultLength>() {
            return Ok(Self { result: result.get(), data: &[] });
        }
        let (raw, rest) = split_fixed::<ResultLength>(data)?;
        let (data, _) = split_bytes(rest, raw.length.get() as usize)?;
        Ok(Self { result: raw.result.get(), data })
    }
}

/// Payload of a Write request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRequest<'a> {
    pub index_group: u32,
    pub index_offset: u32,
    pub data: &'a [u8],
}

impl Encode for WriteRequest<'_> {
    fn encoded_len(&self) -> usize {
        size_of::<IndexLength>() + self.data.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = IndexLength {
            index_group: U32::new(self.index_group),
            index_offset: U32::new(self.index_offset),
            length: U32::new(self.data.len().try_into()?),
        };
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.data);
        Ok(())
    }
}

impl<'a> Decode<'a> for WriteRequest<'a> {
    fn decode(data: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, rest) = split_fixed::<IndexLength>(data)?;
        let (data, _) = split_bytes(rest, raw.length.get() as usize)?;
        Ok(Self {
            index_group: raw.index_group.get(),
            index_offset: raw.index_offset.get(),
            data,
        })
    }
}

/// Payload of a ReadWrite request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadWriteRequest<'a> {
    pub index_group: u32,
    pub index_offset: u32,
    pub read_length: u32,
    pub data: &'a [u8],
}

impl Encode for ReadWriteRequest<'_> {
    fn encoded_len(&self) -> usize {
        size_of::<IndexLengthRW>() + self.data.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = IndexLengthRW {
            index_group: U32::new(self.index_group),
            index_offset: U32::new(self.index_offset),
            read_length: U32::new(self.read_length),
            write_length: U32::new(self.data.len().try_into()?),
        };
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.data);
        Ok(())
    }
}

impl<'a> Decode<'a> for ReadWriteRequest<'a> {
    fn decode(data: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, rest) = split_fixed::<IndexLengthRW>(data)?;
        let (data, _) = split_bytes(rest, raw.write_length.get() as usize)?;
        Ok(Self {
            index_group: raw.index_group.get(),
            index_offset: raw.index_offset.get(),
            read_length: raw.read_length.get(),
            data,
        })
    }
}

/// Payload of the responses that only carry a result: Write, WriteControl
/// and DeleteNotification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultResponse {
    pub result: u32,
}

impl Encode for ResultResponse {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.result.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for ResultResponse {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (result, _) = split_fixed::<U32>(data)?;
        Ok(Self { result: result.get() })
    }
}

/// Device info returned from an ADS server.
///
/// Encoded and decoded without the leading result field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name of the ADS device/service.
    pub name: String,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build version.
    pub version: u16,
}

impl Encode for DeviceInfo {
    fn encoded_len(&self) -> usize {
        DEVICE_INFO_SIZE
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut raw = DeviceInfoRaw {
            major: self.major,
            minor: self.minor,
            version: U16::new(self.version),
            name: [0; 16],
        };
        // Keep room for the terminator.
        let n = self.name.len().min(15);
        raw.name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        buf.extend_from_slice(raw.as_bytes());
        Ok(())
    }
}

impl Decode<'_> for DeviceInfo {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, _) = split_fixed::<DeviceInfoRaw>(data)?;
        // Technically it's Windows-1252, but in practice no non-ASCII occurs.
        let name = raw
            .name
            .iter()
            .take_while(|&&ch| ch > 0)
            .map(|&ch| ch as char)
            .collect::<String>();
        Ok(Self {
            name,
            major: raw.major,
            minor: raw.minor,
            version: raw.version.get(),
        })
    }
}

/// Payload of a ReadState response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateResponse {
    pub result: u32,
    pub ads_state: u16,
    pub dev_state: u16,
}

impl Encode for StateResponse {
    fn encoded_len(&self) -> usize {
        size_of::<ReadStateRaw>()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = ReadStateRaw {
            result: U32::new(self.result),
            ads_state: U16::new(self.ads_state),
            dev_state: U16::new(self.dev_state),
        };
        buf.extend_from_slice(raw.as_bytes());
        Ok(())
    }
}

impl Decode<'_> for StateResponse {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, _) = split_fixed::<ReadStateRaw>(data)?;
        Ok(Self {
            result: raw.result.get(),
            ads_state: raw.ads_state.get(),
            dev_state: raw.dev_state.get(),
        })
    }
}

/// Payload of a WriteControl request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteControlRequest<'a> {
    pub ads_state: u16,
    pub dev_state: u16,
    pub data: &'a [u8],
}

impl Encode for WriteControlRequest<'_> {
    fn encoded_len(&self) -> usize {
        size_of::<WriteControlRaw>() + self.data.len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = WriteControlRaw {
            ads_state: U16::new(self.ads_state),
            dev_state: U16::new(self.dev_state),
            data_length: U32::new(self.data.len().try_into()?),
        };
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(self.data);
        Ok(())
    }
}

impl<'a> Decode<'a> for WriteControlRequest<'a> {
    fn decode(data: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, rest) = split_fixed::<WriteControlRaw>(data)?;
        let (data, _) = split_bytes(rest, raw.data_length.get() as usize)?;
        Ok(Self {
            ads_state: raw.ads_state.get(),
            dev_state: raw.dev_state.get(),
            data,
        })
    }
}

/// Payload of an AddNotification request.
///
/// The delay and cycle time go over the wire in units of 100 ns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddNotificationRequest {
    pub index_group: u32,
    pub index_offset: u32,
    pub attributes: Attributes,
}

pub(crate) fn duration_to_ticks(duration: Duration) -> Result<u32> {
    Ok((duration.as_nanos() / 100).try_into()?)
}

pub(crate) fn ticks_to_duration(ticks: u32) -> Duration {
    Duration::from_nanos(u64::from(ticks) * 100)
}

impl Encode for AddNotificationRequest {
    fn encoded_len(&self) -> usize {
        size_of::<AddNotif>()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let raw = AddNotif {
            index_group: U32::new(self.index_group),
            index_offset: U32::new(self.index_offset),
            length: U32::new(self.attributes.length.try_into()?),
            trans_mode: U32::new(self.attributes.trans_mode as u32),
            max_delay: U32::new(duration_to_ticks(self.attributes.max_delay)?),
            cycle_time: U32::new(duration_to_ticks(self.attributes.cycle_time)?),
            reserved: [0; 16],
        };
        buf.extend_from_slice(raw.as_bytes());
        Ok(())
    }
}

impl Decode<'_> for AddNotificationRequest {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (raw, _) = split_fixed::<AddNotif>(data)?;
        let mode = raw.trans_mode.get();
        let trans_mode = TransmissionMode::try_from(mode)
            .map_err(|_| DecodeError::InvalidValue("transmission mode", mode))?;
        Ok(Self {
            index_group: raw.index_group.get(),
            index_offset: raw.index_offset.get(),
            attributes: Attributes::new(
                raw.length.get() as usize,
                trans_mode,
                ticks_to_duration(raw.max_delay.get()),
                ticks_to_duration(raw.cycle_time.get()),
            ),
        })
    }
}

/// Payload of an AddNotification response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddNotificationResponse {
    pub result: u32,
    pub handle: u32,
}

impl Encode for AddNotificationResponse {
    fn encoded_len(&self) -> usize {
        size_of::<ResultLength>()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.result.to_le_bytes());
        buf.extend_from_slice(&self.handle.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for AddNotificationResponse {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (result, rest) = split_fixed::<U32>(data)?;
        // Error replies may stop after the result.
        let handle = match split_fixed::<U32>(rest) {
            Ok((handle, _)) => handle.get(),
            Err(e) if result.get() == 0 => return Err(e),
            Err(_) => 0,
        };
        Ok(Self { result: result.get(), handle })
    }
}

/// Payload of a DeleteNotification request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteNotificationRequest {
    pub handle: u32,
}

impl Encode for DeleteNotificationRequest {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.handle.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for DeleteNotificationRequest {
    fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (handle, _) = split_fixed::<U32>(data)?;
        Ok(Self { handle: handle.get() })
    }
}

/// Read a router port reply (`ROUTER_PORT_CONNECT` payload) as an address.
pub fn decode_port_reply(payload: &[u8]) -> std::result::Result<AmsAddr, DecodeError> {
    let (netid, rest) = split_fixed::<AmsNetId>(payload)?;
    let (port, _) = split_fixed::<U16>(rest)?;
    Ok(AmsAddr::new(netid, port.get()))
}

// Fixed wire structures.  pub(crate) so that sum-up requests in the client
// can reuse them.

#[derive(FromBytes, IntoBytes, Immutable, Debug)]
#[repr(C)]
pub(crate) struct TcpHeader {
    /// 0x0 - ADS command
    /// 0x1 - close port
    /// 0x1000 - open port
    /// 0x1001 - note from router (router state changed)
    /// 0x1002 - get local netid
    pub command: U16,
    pub length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, Debug)]
#[repr(C)]
pub(crate) struct AmsHeaderRaw {
    pub target_netid: AmsNetId,
    pub target_port: U16,
    pub source_netid: AmsNetId,
    pub source_port: U16,
    pub command: U16,
    pub state_flags: U16,
    pub data_length: U32,
    pub error_code: U32,
    pub invoke_id: U32,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct DeviceInfoRaw {
    pub major: u8,
    pub minor: u8,
    pub version: U16,
    pub name: [u8; 16],
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct IndexLength {
    pub index_group: U32,
    pub index_offset: U32,
    pub length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct ResultLength {
    pub result: U32,
    pub length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct IndexLengthRW {
    pub index_group: U32,
    pub index_offset: U32,
    pub read_length: U32,
    pub write_length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct ReadStateRaw {
    pub result: U32,
    pub ads_state: U16,
    pub dev_state: U16,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct WriteControlRaw {
    pub ads_state: U16,
    pub dev_state: U16,
    pub data_length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub(crate) struct AddNotif {
    pub index_group: U32,
    pub index_offset: U32,
    pub length: U32,
    pub trans_mode: U32,
    pub max_delay: U32,
    pub cycle_time: U32,
    pub reserved: [u8; 16],
}

#[test]
fn test_struct_sizes() {
    assert_eq!(size_of::<TcpHeader>(), TCP_HEADER_SIZE);
    assert_eq!(size_of::<AmsHeaderRaw>(), AMS_HEADER_SIZE);
    assert_eq!(size_of::<DeviceInfoRaw>(), DEVICE_INFO_SIZE);
    assert_eq!(size_of::<AddNotif>(), 40);
}
