//! Wrappers for symbol operations and symbol handles.

use byteorder::{ByteOrder, LE};
use log::debug;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::codec::{self, DecodeError};
use crate::index;
use crate::{Device, Error, Result};

/// A handle to a variable within the ADS device.
///
/// The handle is released automatically on drop.
pub struct Handle<'c> {
    device: Device<'c>,
    handle: u32,
}

impl<'c> Handle<'c> {
    /// Create a new handle to a single symbol.
    pub fn new(device: Device<'c>, symbol: &str) -> Result<Self> {
        let handle = acquire(device, symbol)?;
        Ok(Self { device, handle })
    }

    /// The raw handle, usable as index offset in `RW_SYMVAL_BYHANDLE`.
    pub fn raw(&self) -> u32 {
        self.handle
    }

    /// Read data from the variable (returned data must match size of buffer).
    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.device.read_exact(index::RW_SYMVAL_BYHANDLE, self.handle, buf)
    }

    /// Write data to the variable.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.device.write(index::RW_SYMVAL_BYHANDLE, self.handle, buf)
    }

    /// Read data of given type.
    ///
    /// See `Device::read_value` for details.
    pub fn read_value<T: Default + IntoBytes + FromBytes>(&self) -> Result<T> {
        self.device.read_value(index::RW_SYMVAL_BYHANDLE, self.handle)
    }

    /// Write data of given type.
    pub fn write_value<T: IntoBytes + Immutable>(&self, value: &T) -> Result<()> {
        self.device.write_value(index::RW_SYMVAL_BYHANDLE, self.handle, value)
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        let _ = release(self.device, self.handle);
    }
}

/// Acquire a raw handle for the symbol.
pub(crate) fn acquire(device: Device<'_>, symbol: &str) -> Result<u32> {
    let mut handle_bytes = [0; 4];
    device.write_read_exact(index::GET_SYMHANDLE_BYNAME, 0, symbol.as_bytes(), &mut handle_bytes)?;
    Ok(LE::read_u32(&handle_bytes))
}

/// Give a raw handle back to the device.
pub(crate) fn release(device: Device<'_>, handle: u32) -> Result<()> {
    device.write(index::RELEASE_SYMHANDLE, 0, &handle.to_le_bytes())
}

/// Location and size of a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub index_group: u32,
    pub index_offset: u32,
    pub size: usize,
}

/// Get symbol location and size by name.
pub fn get_info(device: Device<'_>, symbol: &str) -> Result<SymbolInfo> {
    let mut buf = [0; 12];
    device.write_read_exact(index::GET_SYMINFO_BYNAME, 0, symbol.as_bytes(), &mut buf)?;
    Ok(SymbolInfo {
        index_group: LE::read_u32(&buf[0..4]),
        index_offset: LE::read_u32(&buf[4..8]),
        size: LE::read_u32(&buf[8..12]) as usize,
    })
}

/// Get symbol size by name.
pub fn get_size(device: Device<'_>, symbol: &str) -> Result<usize> {
    get_info(device, symbol).map(|info| info.size)
}

/// Get symbol location (index group and index offset) by name.
pub fn get_location(device: Device<'_>, symbol: &str) -> Result<(u32, u32)> {
    get_info(device, symbol).map(|info| (info.index_group, info.index_offset))
}

/// Size of the fixed part of a symbol entry.
const ENTRY_HEADER_SIZE: usize = 30;
/// Reply buffer for `get_info_ex`: the fixed part and three strings of up
/// to 255 characters with their terminators.
const ENTRY_BUFFER_SIZE: usize = ENTRY_HEADER_SIZE + 3 * 256;

/// Fixed part of a symbol entry, followed by the NUL-terminated name, type
/// name and comment.
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct EntryHeader {
    entry_length: U32,
    index_group: U32,
    index_offset: U32,
    size: U32,
    data_type: U32,
    flags: U32,
    name_length: U16,
    type_length: U16,
    comment_length: U16,
}

/// A complete symbol table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub index_group: u32,
    pub index_offset: u32,
    pub size: usize,
    /// The ADS data type ID (e.g. 19 for UDINT).
    pub data_type: u32,
    pub flags: u32,
    /// The PLC type name, e.g. `"UDINT"` or `"ARRAY [0..9] OF INT"`.
    pub type_name: String,
    pub comment: String,
}

impl SymbolEntry {
    /// Parse one entry off the front of `data`.
    ///
    /// Returns the entry and the number of bytes it occupies, which can
    /// include padding after the comment.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = EntryHeader::read_from_prefix(data).map_err(|_| {
            DecodeError::TruncatedFrame { needed: ENTRY_HEADER_SIZE, available: data.len() }
        })?;
        let entry_length = header.entry_length.get();
        let lengths = [header.name_length.get(), header.type_length.get(), header.comment_length.get()];
        let needed = ENTRY_HEADER_SIZE + lengths.iter().map(|&len| len as usize + 1).sum::<usize>();
        if (entry_length as usize) < needed || entry_length as usize > data.len() {
            return Err(DecodeError::InvalidValue("symbol entry length", entry_length).into());
        }

        let mut strings = &data[ENTRY_HEADER_SIZE..entry_length as usize];
        let name = take_string(&mut strings, lengths[0]);
        let type_name = take_string(&mut strings, lengths[1]);
        let comment = take_string(&mut strings, lengths[2]);
        let entry = Self {
            name,
            index_group: header.index_group.get(),
            index_offset: header.index_offset.get(),
            size: header.size.get() as usize,
            data_type: header.data_type.get(),
            flags: header.flags.get(),
            type_name,
            comment,
        };
        Ok((entry, entry_length as usize))
    }
}

/// Split a string and its NUL terminator off `data`; the length has been
/// checked against the entry length.
fn take_string(data: &mut &[u8], len: u16) -> String {
    let (text, rest) = data.split_at(len as usize);
    *data = rest.get(1..).unwrap_or(&[]);
    String::from_utf8_lossy(text).into_owned()
}

/// Get the complete symbol entry by name, including type name and comment.
pub fn get_info_ex(device: Device<'_>, symbol: &str) -> Result<SymbolEntry> {
    let mut buf = vec![0; ENTRY_BUFFER_SIZE];
    let len = device.write_read(index::GET_SYMINFO_BYNAME_EX, 0, symbol.as_bytes(), &mut buf)?;
    SymbolEntry::parse(&buf[..len]).map(|(entry, _)| entry)
}

/// Upload the device's complete symbol table.
pub fn upload(device: Device<'_>) -> Result<Vec<SymbolEntry>> {
    let mut info = [0; 24];
    let len = device.read(index::SYM_UPLOAD_INFO2, 0, &mut info)?;
    if len < 8 {
        return Err(Error::Reply("symbol upload info", "got less data than expected", len as u32));
    }
    let count = LE::read_u32(&info[0..4]);
    let table_length = LE::read_u32(&info[4..8]);

    if table_length as usize > codec::MAX_FRAME_SIZE {
        return Err(DecodeError::InvalidValue("symbol table length", table_length).into());
    }

    let mut table = vec![0; table_length as usize];
    let len = device.read(index::SYM_UPLOAD, 0, &mut table)?;
    let mut data = &table[..len];
    let mut symbols = Vec::new();
    for _ in 0..count {
        let (entry, used) = SymbolEntry::parse(data)?;
        symbols.push(entry);
        data = &data[used..];
    }
    debug!("uploaded {} symbols from {}", symbols.len(), device.addr());
    Ok(symbols)
}
