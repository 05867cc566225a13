// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ioctl command words and the fixed-layout parameter records exchanged with
//! the guest driver ABI.
//!
//! All records are little endian. Inputs shorter than a record are
//! zero-extended; outputs are truncated to the caller's buffer.

use std::io::{self, Cursor, Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use nvas_common::NvResult;

// ── Command word ────────────────────────────────────────────────────────────

/// Ioctl command word: `[31 out][30 in][29..16 length][15..8 group][7..0 nr]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ioctl {
    pub raw: u32,
}

impl Ioctl {
    pub const fn new(raw: u32) -> Self {
        Self { raw }
    }

    pub const fn build(group: u8, nr: u8, length: u16, is_in: bool, is_out: bool) -> Self {
        let raw = (nr as u32)
            | ((group as u32) << 8)
            | (((length as u32) & 0x3FFF) << 16)
            | ((is_in as u32) << 30)
            | ((is_out as u32) << 31);
        Self { raw }
    }

    pub const fn nr(self) -> u8 {
        self.raw as u8
    }

    pub const fn group(self) -> u8 {
        (self.raw >> 8) as u8
    }

    pub const fn length(self) -> u16 {
        ((self.raw >> 16) & 0x3FFF) as u16
    }

    pub const fn is_in(self) -> bool {
        self.raw & (1 << 30) != 0
    }

    pub const fn is_out(self) -> bool {
        self.raw & (1 << 31) != 0
    }
}

impl std::fmt::Debug for Ioctl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ioctl(0x{:08X}: group='{}', nr=0x{:X}, len={}, in={}, out={})",
            self.raw,
            self.group() as char,
            self.nr(),
            self.length(),
            self.is_in(),
            self.is_out()
        )
    }
}

// ── Record codec ────────────────────────────────────────────────────────────

/// A fixed-size wire record.
pub trait IoctlRecord: Sized {
    const SIZE: usize;

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>;
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    /// Decode from `input`, zero-extending it to [`Self::SIZE`].
    fn decode(input: &[u8]) -> io::Result<Self> {
        let mut buf = vec![0u8; Self::SIZE];
        let len = input.len().min(Self::SIZE);
        buf[..len].copy_from_slice(&input[..len]);
        Self::read_from(&mut Cursor::new(buf))
    }

    /// Encode into `output`, truncating to its length.
    fn encode(&self, output: &mut [u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        let len = output.len().min(buf.len());
        output[..len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

/// Decode a fixed record, run `handler` on it, and copy it back to `output`.
pub fn wrap_fixed<T: IoctlRecord>(
    input: &[u8],
    output: &mut [u8],
    handler: impl FnOnce(&mut T) -> NvResult,
) -> NvResult {
    let mut params = match T::decode(input) {
        Ok(params) => params,
        Err(err) => {
            log::error!("ioctl: failed to decode {} byte record: {}", T::SIZE, err);
            return NvResult::InvalidSize;
        }
    };
    let result = handler(&mut params);
    if let Err(err) = params.encode(output) {
        log::error!("ioctl: failed to encode {} byte record: {}", T::SIZE, err);
        return NvResult::InvalidSize;
    }
    result
}

/// Decode an array of records filling `input`, run `handler` on them, and
/// copy as many as fit back to `output`.
pub fn wrap_variable<T: IoctlRecord>(
    input: &[u8],
    output: &mut [u8],
    handler: impl FnOnce(&mut [T]) -> NvResult,
) -> NvResult {
    let mut entries = match decode_array::<T>(input) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("ioctl: failed to decode record array: {}", err);
            return NvResult::InvalidSize;
        }
    };
    let result = handler(&mut entries);
    if let Err(err) = encode_array(&entries, output) {
        log::error!("ioctl: failed to encode record array: {}", err);
        return NvResult::InvalidSize;
    }
    result
}

/// Like [`wrap_fixed`], with an additional array of `U` records exchanged
/// through `inline_output`.
pub fn wrap_fixed_inline_out<T: IoctlRecord, U: IoctlRecord + Default>(
    input: &[u8],
    output: &mut [u8],
    inline_output: &mut [u8],
    handler: impl FnOnce(&mut T, &mut [U]) -> NvResult,
) -> NvResult {
    let mut inline = Vec::new();
    inline.resize_with(inline_output.len() / U::SIZE, U::default);
    let result = wrap_fixed(input, output, |params: &mut T| handler(params, &mut inline));
    if let Err(err) = encode_array(&inline, inline_output) {
        log::error!("ioctl: failed to encode inline output: {}", err);
        return NvResult::InvalidSize;
    }
    result
}

fn decode_array<T: IoctlRecord>(input: &[u8]) -> io::Result<Vec<T>> {
    input.chunks_exact(T::SIZE).map(T::decode).collect()
}

fn encode_array<T: IoctlRecord>(entries: &[T], output: &mut [u8]) -> io::Result<()> {
    for (entry, chunk) in entries.iter().zip(output.chunks_mut(T::SIZE)) {
        entry.encode(chunk)?;
    }
    Ok(())
}

// ── Parameter records ───────────────────────────────────────────────────────

bitflags! {
    /// Placement flags shared by AllocateSpace and MapBufferEx.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MappingFlags: u32 {
        const FIXED = 1 << 0;
        const SPARSE = 1 << 1;
        const REMAP = 1 << 8;
    }
}

/// AllocAsEx: initialise the address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlAllocAsEx {
    pub flags: u32,
    pub as_fd: i32,
    pub big_page_size: u32,
    pub reserved: u32,
    pub va_range_start: u64,
    pub va_range_end: u64,
    pub va_range_split: u64,
}

impl IoctlRecord for IoctlAllocAsEx {
    const SIZE: usize = 40;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            flags: r.read_u32::<LittleEndian>()?,
            as_fd: r.read_i32::<LittleEndian>()?,
            big_page_size: r.read_u32::<LittleEndian>()?,
            reserved: r.read_u32::<LittleEndian>()?,
            va_range_start: r.read_u64::<LittleEndian>()?,
            va_range_end: r.read_u64::<LittleEndian>()?,
            va_range_split: r.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_i32::<LittleEndian>(self.as_fd)?;
        w.write_u32::<LittleEndian>(self.big_page_size)?;
        w.write_u32::<LittleEndian>(self.reserved)?;
        w.write_u64::<LittleEndian>(self.va_range_start)?;
        w.write_u64::<LittleEndian>(self.va_range_end)?;
        w.write_u64::<LittleEndian>(self.va_range_split)
    }
}

/// AllocateSpace. `offset` doubles as the requested alignment on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlAllocSpace {
    pub pages: u32,
    pub page_size: u32,
    pub flags: MappingFlags,
    pub pad: u32,
    pub offset: u64,
}

impl IoctlRecord for IoctlAllocSpace {
    const SIZE: usize = 24;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            pages: r.read_u32::<LittleEndian>()?,
            page_size: r.read_u32::<LittleEndian>()?,
            flags: MappingFlags::from_bits_retain(r.read_u32::<LittleEndian>()?),
            pad: r.read_u32::<LittleEndian>()?,
            offset: r.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.pages)?;
        w.write_u32::<LittleEndian>(self.page_size)?;
        w.write_u32::<LittleEndian>(self.flags.bits())?;
        w.write_u32::<LittleEndian>(self.pad)?;
        w.write_u64::<LittleEndian>(self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlFreeSpace {
    pub offset: u64,
    pub pages: u32,
    pub page_size: u32,
}

impl IoctlRecord for IoctlFreeSpace {
    const SIZE: usize = 16;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset: r.read_u64::<LittleEndian>()?,
            pages: r.read_u32::<LittleEndian>()?,
            page_size: r.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.pages)?;
        w.write_u32::<LittleEndian>(self.page_size)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlMapBufferEx {
    pub flags: MappingFlags,
    pub kind: u32,
    pub handle: u32,
    pub page_size: u32,
    pub buffer_offset: i64,
    pub mapping_size: u64,
    pub offset: i64,
}

impl IoctlRecord for IoctlMapBufferEx {
    const SIZE: usize = 40;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            flags: MappingFlags::from_bits_retain(r.read_u32::<LittleEndian>()?),
            kind: r.read_u32::<LittleEndian>()?,
            handle: r.read_u32::<LittleEndian>()?,
            page_size: r.read_u32::<LittleEndian>()?,
            buffer_offset: r.read_i64::<LittleEndian>()?,
            mapping_size: r.read_u64::<LittleEndian>()?,
            offset: r.read_i64::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.flags.bits())?;
        w.write_u32::<LittleEndian>(self.kind)?;
        w.write_u32::<LittleEndian>(self.handle)?;
        w.write_u32::<LittleEndian>(self.page_size)?;
        w.write_i64::<LittleEndian>(self.buffer_offset)?;
        w.write_u64::<LittleEndian>(self.mapping_size)?;
        w.write_i64::<LittleEndian>(self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlUnmapBuffer {
    pub offset: i64,
}

impl IoctlRecord for IoctlUnmapBuffer {
    const SIZE: usize = 8;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset: r.read_i64::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i64::<LittleEndian>(self.offset)
    }
}

/// One entry of a Remap batch. Offsets and sizes are in big pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlRemapEntry {
    pub flags: u16,
    pub kind: u16,
    pub handle: u32,
    pub handle_offset_big_pages: u32,
    pub as_offset_big_pages: u32,
    pub big_pages: u32,
}

impl IoctlRecord for IoctlRemapEntry {
    const SIZE: usize = 20;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            flags: r.read_u16::<LittleEndian>()?,
            kind: r.read_u16::<LittleEndian>()?,
            handle: r.read_u32::<LittleEndian>()?,
            handle_offset_big_pages: r.read_u32::<LittleEndian>()?,
            as_offset_big_pages: r.read_u32::<LittleEndian>()?,
            big_pages: r.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.kind)?;
        w.write_u32::<LittleEndian>(self.handle)?;
        w.write_u32::<LittleEndian>(self.handle_offset_big_pages)?;
        w.write_u32::<LittleEndian>(self.as_offset_big_pages)?;
        w.write_u32::<LittleEndian>(self.big_pages)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlBindChannel {
    pub fd: i32,
}

impl IoctlRecord for IoctlBindChannel {
    const SIZE: usize = 4;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            fd: r.read_i32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(self.fd)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaRegion {
    pub offset: u64,
    pub page_size: u32,
    pub pad: u32,
    pub pages: u64,
}

impl IoctlRecord for VaRegion {
    const SIZE: usize = 24;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset: r.read_u64::<LittleEndian>()?,
            page_size: r.read_u32::<LittleEndian>()?,
            pad: r.read_u32::<LittleEndian>()?,
            pages: r.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.page_size)?;
        w.write_u32::<LittleEndian>(self.pad)?;
        w.write_u64::<LittleEndian>(self.pages)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlGetVaRegions {
    pub buf_addr: u64,
    pub buf_size: u32,
    pub reserved: u32,
    pub regions: [VaRegion; 2],
}

impl IoctlRecord for IoctlGetVaRegions {
    const SIZE: usize = 16 + 2 * VaRegion::SIZE;

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            buf_addr: r.read_u64::<LittleEndian>()?,
            buf_size: r.read_u32::<LittleEndian>()?,
            reserved: r.read_u32::<LittleEndian>()?,
            regions: [VaRegion::read_from(r)?, VaRegion::read_from(r)?],
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.buf_addr)?;
        w.write_u32::<LittleEndian>(self.buf_size)?;
        w.write_u32::<LittleEndian>(self.reserved)?;
        for region in &self.regions {
            region.write_to(w)?;
        }
        Ok(())
    }
}
