//! Index groups used by this crate and commonly needed with `Device`.
//!
//! The values are fixed by the ADS protocol, see the
//! [ADS documentation](https://infosys.beckhoff.com/content/1033/tc3_ads_intro/117241867.html).

/// PLC memory (%M fields).
pub const PLC_RW_M: u32 = 0x4020;
/// PLC memory as bits (%MX fields); the offset is `byte * 8 + bit`.
pub const PLC_RW_MX: u32 = 0x4021;
/// Byte length of the %M area (offset 0).
pub const PLC_SIZE_M: u32 = 0x4025;
/// Retain data area.
pub const PLC_RW_RB: u32 = 0x4030;
/// Data area.
pub const PLC_RW_DB: u32 = 0x4040;

/// ReadWrite with the symbol name as write data returns a u32 handle.
pub const GET_SYMHANDLE_BYNAME: u32 = 0xF003;
/// Symbol value by handle; the handle is the index offset.
pub const RW_SYMVAL_BYHANDLE: u32 = 0xF005;
/// Write the handle (offset 0) to release it.
pub const RELEASE_SYMHANDLE: u32 = 0xF006;
/// ReadWrite with the symbol name returns index group, offset and size.
pub const GET_SYMINFO_BYNAME: u32 = 0xF007;
/// ReadWrite with the symbol name returns its complete symbol entry.
pub const GET_SYMINFO_BYNAME_EX: u32 = 0xF009;
/// The symbol table, as consecutive symbol entries.
pub const SYM_UPLOAD: u32 = 0xF00B;
/// Symbol count and byte length of the symbol table.
pub const SYM_UPLOAD_INFO: u32 = 0xF00C;
/// Like `SYM_UPLOAD_INFO`, followed by data type and dynamic symbol counts.
pub const SYM_UPLOAD_INFO2: u32 = 0xF00F;

/// Process image of the physical inputs (%I fields).
pub const IO_RW_I: u32 = 0xF020;
/// Process image of the physical outputs (%Q fields).
pub const IO_RW_Q: u32 = 0xF030;

/// Sum-up read: the offset is the number of reads, the write data their
/// (group, offset, length) triples.
pub const SUMUP_READ: u32 = 0xF080;
/// Sum-up write: like `SUMUP_READ`, followed by the data of all writes.
pub const SUMUP_WRITE: u32 = 0xF081;
