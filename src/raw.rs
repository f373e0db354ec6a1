use crate::Key;
use crate::platform::{AlignedOps, FnCrc32, Platform};
use crate::u24::u24;
use alloc::vec;
use core::mem::{size_of, transmute};
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const SECTOR_SIZE: usize = 4096;
pub(crate) const ENTRY_STATE_BITMAP_SIZE: usize = 32;
pub(crate) const ENTRY_COUNT: usize = 126;
pub(crate) const ENTRY_SIZE: usize = size_of::<Item>();

/// A string or blob has to fit into a single page: one header entry plus up
/// to 125 data entries.
pub(crate) const MAX_VALUE_SIZE: usize = (ENTRY_COUNT - 1) * ENTRY_SIZE;

pub(crate) const PAGE_VERSION: u8 = 0xFE;

// Compile-time assertion to ensure page structure size matches flash sector size
const _: () = assert!(
    size_of::<PageHeader>() + ENTRY_STATE_BITMAP_SIZE + ENTRY_COUNT * size_of::<Item>()
        == SECTOR_SIZE,
    "Page structure size must equal flash sector size"
);

#[repr(C, packed)]
pub(crate) struct RawPage {
    pub(crate) header: PageHeader,
    pub(crate) entry_state_bitmap: [u8; ENTRY_STATE_BITMAP_SIZE],
    pub(crate) items: [u8; ENTRY_COUNT * size_of::<Item>()],
}

/// Two bits per entry. NOR flash only clears bits outside of a sector erase,
/// so the legal transitions are exactly Empty -> Written -> Erased.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum EntryState {
    Empty,
    Written,
    Erased,
    Illegal,
}

impl EntryState {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b11 => EntryState::Empty,
            0b10 => EntryState::Written,
            0b00 => EntryState::Erased,
            _ => EntryState::Illegal,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            EntryState::Empty => 0b11,
            EntryState::Written => 0b10,
            EntryState::Erased => 0b00,
            EntryState::Illegal => 0b01,
        }
    }
}

const PSB_INIT: u32 = 0x1;
const PSB_FULL: u32 = 0x2;
const PSB_FREEING: u32 = 0x4;
const PSB_CORRUPT: u32 = 0x8;

#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub(crate) enum PageState {
    // All bits set, default state after a sector erase. The page has not
    // been initialized yet.
    Uninitialized = u32::MAX,

    // Page is initialized and accepts writes.
    Active = PageState::Uninitialized as u32 & !PSB_INIT,

    // Page will not accept new records.
    Full = PageState::Active as u32 & !PSB_FULL,

    // Live records are being moved off this page.
    Freeing = PageState::Full as u32 & !PSB_FREEING,

    // Page was found in an unrecoverable state. It is kept around for
    // diagnostics and erased once free pages run out.
    Corrupt = PageState::Freeing as u32 & !PSB_CORRUPT,

    // Page object was not loaded from flash.
    Invalid = 0,
}

const PAGE_STATE_UNINITIALIZED: u32 = PageState::Uninitialized as u32;
const PAGE_STATE_ACTIVE: u32 = PageState::Active as u32;
const PAGE_STATE_FULL: u32 = PageState::Full as u32;
const PAGE_STATE_FREEING: u32 = PageState::Freeing as u32;
const PAGE_STATE_INVALID: u32 = PageState::Invalid as u32;

impl From<u32> for PageState {
    fn from(val: u32) -> Self {
        match val {
            PAGE_STATE_UNINITIALIZED => PageState::Uninitialized,
            PAGE_STATE_ACTIVE => PageState::Active,
            PAGE_STATE_FULL => PageState::Full,
            PAGE_STATE_FREEING => PageState::Freeing,
            PAGE_STATE_INVALID => PageState::Invalid,
            // any other bit pattern, including the on-flash Corrupt marker
            _ => PageState::Corrupt,
        }
    }
}

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ItemType {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x04,
    U64 = 0x08,
    I8 = 0x11,
    I16 = 0x12,
    I32 = 0x14,
    I64 = 0x18,
    Str = 0x21,
    Blob = 0x41,
    Any = 0xff,
}

impl ItemType {
    /// Datatype tag of a record as it may legally appear on flash. `Any` is
    /// a search wildcard and never stored.
    pub(crate) fn stored(tag: u8) -> Option<ItemType> {
        match ItemType::from_repr(tag) {
            Some(ItemType::Any) | None => None,
            some => some,
        }
    }

    pub(crate) fn is_varlen(&self) -> bool {
        matches!(self, ItemType::Str | ItemType::Blob)
    }

    pub(crate) fn primitive_width(&self) -> Option<usize> {
        match self {
            ItemType::U8 | ItemType::I8 => Some(1),
            ItemType::U16 | ItemType::I16 => Some(2),
            ItemType::U32 | ItemType::I32 => Some(4),
            ItemType::U64 | ItemType::I64 => Some(8),
            _ => None,
        }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct PageHeader {
    pub(crate) state: u32,
    pub(crate) sequence: u32,
    pub(crate) version: u8,
    pub(crate) _reserved: [u8; 19],
    pub(crate) crc: u32,
}

pub(crate) union PageHeaderBytes {
    pub(crate) header: PageHeader,
    pub(crate) raw: [u8; size_of::<PageHeader>()],
}

impl PageHeader {
    /// The state word mutates over the page's lifetime and the CRC field is
    /// the stored result, so the checksum covers everything in between.
    pub(crate) fn compute_crc(&self, crc32: FnCrc32) -> u32 {
        let buf: [u8; size_of::<PageHeader>()] = unsafe { transmute(*self) };
        crc32(0, &buf[4..28])
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct Item {
    pub(crate) namespace_index: u8,
    pub(crate) datatype: u8,
    pub(crate) span: u8,
    pub(crate) _reserved: u8,
    pub(crate) crc: u32,
    pub(crate) key: Key,
    pub(crate) data: ItemData,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) union ItemData {
    pub(crate) raw: [u8; 8],
    pub(crate) varlen: VarLenData,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct VarLenData {
    pub(crate) size: u16,
    _reserved: u16,
    pub(crate) crc: u32,
}

impl VarLenData {
    pub(crate) fn new(size: u16, crc: u32) -> Self {
        Self {
            size,
            _reserved: u16::MAX,
            crc,
        }
    }
}

impl Item {
    pub(crate) fn new(
        namespace_index: u8,
        datatype: ItemType,
        span: u8,
        key: Key,
        data: ItemData,
        crc32: FnCrc32,
    ) -> Item {
        let mut item = Item {
            namespace_index,
            datatype: datatype as u8,
            span,
            _reserved: 0xFF,
            crc: 0,
            key,
            data,
        };
        item.crc = item.compute_crc(crc32);
        item
    }

    pub(crate) fn as_bytes(&self) -> [u8; size_of::<Item>()] {
        unsafe { transmute(*self) }
    }

    // Safety: every field of Item accepts any bit pattern
    pub(crate) fn from_bytes(buf: [u8; size_of::<Item>()]) -> Item {
        unsafe { transmute(buf) }
    }

    /// Record checksum with the CRC field taken as zero.
    pub(crate) fn compute_crc(&self, crc32: FnCrc32) -> u32 {
        let mut copy = *self;
        copy.crc = 0;
        crc32(0, &copy.as_bytes())
    }

    pub(crate) fn item_type(&self) -> Option<ItemType> {
        ItemType::stored(self.datatype)
    }

    pub(crate) fn hash(&self, crc32: FnCrc32) -> u24 {
        Self::hash_of(crc32, self.namespace_index, &self.key)
    }

    /// 24-bit key digest for the in-memory lookup lists. Collisions are
    /// accepted in favor of memory efficiency and resolved by re-reading
    /// the record.
    pub(crate) fn hash_of(crc32: FnCrc32, namespace_index: u8, key: &Key) -> u24 {
        let mut crc = crc32(0, &[namespace_index]);
        crc = crc32(crc, key.as_bytes());
        u24::from_u32(crc & 0x00FF_FFFF)
    }
}

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#x}: [{}]", offset, bytes.len());

    if bytes.is_empty() {
        return Ok(());
    }

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if the remaining data is all ones -
        // that is the default state of the flash
        if trailer.iter().any(|&b| b != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        Ok(())
    }
}
