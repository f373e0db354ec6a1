use crate::Key;
use crate::error::Error;
use crate::platform::{AlignedOps, FnCrc32, Platform};
use crate::raw::{
    ENTRY_COUNT, ENTRY_SIZE, EntryState, Item, ItemData, ItemType, PAGE_VERSION, PageHeader,
    PageHeaderBytes, PageState, RawPage, SECTOR_SIZE, VarLenData, write_aligned,
};
use crate::u24::u24;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::mem::{offset_of, size_of};
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// One flash sector and its in-memory summary: classified state, sequence
/// number, a copy of the entry-state bitmap, entry counters and a hash list
/// of the written records for fast lookup. Record payloads stay on flash.
pub(crate) struct Page {
    address: usize,
    state: PageState,
    sequence: u32,
    bitmap: [u8; crate::raw::ENTRY_STATE_BITMAP_SIZE],
    hash_list: Vec<HashListEntry>,
    used_entries: u8,
    erased_entries: u8,
}

pub(crate) struct HashListEntry {
    pub(crate) hash: u24,
    pub(crate) index: u8,
}

/// Namespace registry record encountered while scanning a page.
pub(crate) struct NamespaceSlot {
    pub(crate) name: Key,
    pub(crate) index: u8,
}

pub(crate) enum LoadedPage {
    /// Uninitialized or corrupt; usable again after a sector erase.
    Free(Page),
    /// Holds records, together with any namespace registry entries found.
    Live(Page, Vec<NamespaceSlot>),
}

impl Page {
    pub(crate) fn blank(address: usize) -> Self {
        Self {
            address,
            state: PageState::Uninitialized,
            sequence: 0,
            bitmap: [0xFF; crate::raw::ENTRY_STATE_BITMAP_SIZE],
            hash_list: Vec::new(),
            used_entries: 0,
            erased_entries: 0,
        }
    }

    fn corrupt(address: usize) -> Self {
        Self {
            state: PageState::Corrupt,
            ..Self::blank(address)
        }
    }

    /// Reads one sector and classifies it. Recoverable anomalies (torn
    /// records, lost bitmap updates) are repaired on the spot; a page that
    /// cannot be parsed comes back as `Free` in the `Corrupt` state and is
    /// erased when its sector is needed.
    pub(crate) fn load<T: Platform>(hal: &mut T, address: usize) -> Result<LoadedPage, Error> {
        #[cfg(feature = "defmt")]
        trace!("page load @{:#x}", address);

        let mut buf = [0u8; SECTOR_SIZE];
        hal.read(address as u32, &mut buf)
            .map_err(|_| Error::FlashError)?;

        if buf[..size_of::<PageHeader>()].iter().all(|&b| b == 0xFF) {
            return if buf.iter().all(|&b| b == 0xFF) {
                Ok(LoadedPage::Free(Page::blank(address)))
            } else {
                // the header never made it to flash but something else did
                Ok(LoadedPage::Free(Page::corrupt(address)))
            };
        }

        // Safety: RawPage is a packed aggregate of byte arrays and words,
        // every bit pattern is valid
        let raw: RawPage = unsafe { core::mem::transmute(buf) };
        let state = PageState::from(raw.header.state);

        let mut page = Page {
            address,
            state,
            sequence: raw.header.sequence,
            bitmap: raw.entry_state_bitmap,
            hash_list: Vec::new(),
            used_entries: 0,
            erased_entries: 0,
        };

        match state {
            PageState::Corrupt | PageState::Invalid => return Ok(LoadedPage::Free(page)),
            PageState::Uninitialized => {
                // state word still blank while other header bytes are not
                page.state = PageState::Corrupt;
                return Ok(LoadedPage::Free(page));
            }
            PageState::Active | PageState::Full | PageState::Freeing => {}
        }

        if raw.header.crc != raw.header.compute_crc(T::crc32) {
            #[cfg(feature = "defmt")]
            warn!("page @{:#x}: header crc mismatch", address);
            page.state = PageState::Corrupt;
            return Ok(LoadedPage::Free(page));
        }

        let mut namespaces: Vec<NamespaceSlot> = Vec::new();
        let mut index = 0u8;
        while (index as usize) < ENTRY_COUNT {
            match page.entry_state(index) {
                EntryState::Erased | EntryState::Illegal => {
                    page.erased_entries += 1;
                    index += 1;
                }
                EntryState::Empty => {
                    let bytes = entry_bytes(&raw, index);
                    if bytes.iter().all(|&b| b == 0xFF) {
                        index += 1;
                        continue;
                    }
                    let item = Item::from_bytes(bytes);
                    if !record_complete::<T>(&raw, index, &item) {
                        // half-programmed record; retire the slot so the
                        // free pointer never lands on dirty flash
                        page.set_entry_state_range::<T>(hal, index..index + 1, EntryState::Erased)?;
                        page.erased_entries += 1;
                        index += 1;
                        continue;
                    }
                    // the record was written completely, only the bitmap
                    // update was lost
                    #[cfg(feature = "defmt")]
                    trace!("page @{:#x}: recovering record at entry {}", address, index);
                    page.set_entry_state_range::<T>(
                        hal,
                        index..index + item.span,
                        EntryState::Written,
                    )?;
                    let span = item.span;
                    page.accept(item, index, T::crc32, &mut namespaces);
                    index += span;
                }
                EntryState::Written => {
                    let item = Item::from_bytes(entry_bytes(&raw, index));
                    if item.crc != item.compute_crc(T::crc32)
                        || !span_in_bounds(index, item.span)
                        || item.item_type().is_none()
                    {
                        #[cfg(feature = "defmt")]
                        warn!("page @{:#x}: dropping invalid record at entry {}", address, index);
                        page.set_entry_state_range::<T>(hal, index..index + 1, EntryState::Erased)?;
                        page.erased_entries += 1;
                        index += 1;
                        continue;
                    }
                    // data entries that never had their bitmap bits flipped
                    // mean the record is torn
                    let torn = (index + 1..index + item.span)
                        .any(|i| page.entry_state(i) != EntryState::Written);
                    if torn {
                        page.set_entry_state_range::<T>(
                            hal,
                            index..index + item.span,
                            EntryState::Erased,
                        )?;
                        page.erased_entries += item.span;
                        index += item.span;
                        continue;
                    }
                    page.accept(item, index, T::crc32, &mut namespaces);
                    index += item.span;
                }
            }
        }

        Ok(LoadedPage::Live(page, namespaces))
    }

    /// Books a scanned record into the in-memory summary. Registry records
    /// (namespace index 0) feed the namespace list instead of the hash list.
    fn accept(
        &mut self,
        item: Item,
        index: u8,
        crc32: FnCrc32,
        namespaces: &mut Vec<NamespaceSlot>,
    ) {
        self.used_entries += item.span;
        if item.namespace_index == 0 {
            namespaces.push(NamespaceSlot {
                name: item.key,
                index: unsafe { item.data.raw[0] },
            });
        } else {
            self.hash_list.push(HashListEntry {
                hash: item.hash(crc32),
                index,
            });
        }
    }

    pub(crate) fn initialize<T: Platform>(
        &mut self,
        hal: &mut T,
        sequence: u32,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("initialize @{:#x} seq {}", self.address, sequence);
        debug_assert_eq!(self.state, PageState::Uninitialized);

        let mut header = PageHeader {
            state: PageState::Active as u32,
            sequence,
            version: PAGE_VERSION,
            _reserved: [0xFF; 19],
            crc: 0,
        };
        header.crc = header.compute_crc(T::crc32);
        let raw = PageHeaderBytes { header };

        write_aligned(hal, self.address as u32, unsafe { &raw.raw })
            .map_err(|_| Error::FlashError)?;

        self.state = PageState::Active;
        self.sequence = sequence;
        Ok(())
    }

    fn write_state<T: Platform>(&mut self, hal: &mut T, state: PageState) -> Result<(), Error> {
        write_aligned(hal, self.address as u32, &(state as u32).to_le_bytes())
            .map_err(|_| Error::FlashError)?;
        self.state = state;
        Ok(())
    }

    pub(crate) fn mark_full<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("mark_full @{:#x}", self.address);
        self.write_state(hal, PageState::Full)
    }

    pub(crate) fn mark_freeing<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("mark_freeing @{:#x}", self.address);
        self.write_state(hal, PageState::Freeing)
    }

    /// Appends a single-entry record. The record is written before its
    /// bitmap bits flip to `Written`, so an interruption leaves the entry
    /// logically absent.
    pub(crate) fn write_entry<T: Platform>(
        &mut self,
        hal: &mut T,
        namespace_index: u8,
        datatype: ItemType,
        key: Key,
        data: ItemData,
    ) -> Result<u8, Error> {
        if self.free_entries() < 1 {
            return Err(Error::PageFull);
        }
        let index = self.next_free_entry() as u8;
        let item = Item::new(namespace_index, datatype, 1, key, data, T::crc32);

        #[cfg(feature = "defmt")]
        trace!("write_entry @{:#x}[{}]", self.address, index);

        write_aligned(hal, self.entry_address(index) as u32, &item.as_bytes())
            .map_err(|_| Error::FlashError)?;
        self.set_entry_state_range::<T>(hal, index..index + 1, EntryState::Written)?;

        self.used_entries += 1;
        if namespace_index != 0 {
            self.hash_list.push(HashListEntry {
                hash: item.hash(T::crc32),
                index,
            });
        }
        if self.next_free_entry() == ENTRY_COUNT {
            self.mark_full(hal)?;
        }
        Ok(index)
    }

    /// Appends a string or blob record: header entry, then the payload
    /// spilled over the following entries, then the bitmap flip.
    pub(crate) fn write_varlen<T: Platform>(
        &mut self,
        hal: &mut T,
        namespace_index: u8,
        datatype: ItemType,
        key: Key,
        data: &[u8],
    ) -> Result<u8, Error> {
        let span = data.len().div_ceil(ENTRY_SIZE) + 1;
        if span > ENTRY_COUNT {
            return Err(Error::ValueTooLong);
        }
        if span > self.free_entries() {
            return Err(Error::PageFull);
        }
        let index = self.next_free_entry() as u8;

        #[cfg(feature = "defmt")]
        trace!(
            "write_varlen @{:#x}[{}..{}]",
            self.address,
            index,
            index + span as u8
        );

        let payload = ItemData {
            varlen: VarLenData::new(data.len() as u16, T::crc32(0, data)),
        };
        let item = Item::new(namespace_index, datatype, span as u8, key, payload, T::crc32);

        write_aligned(hal, self.entry_address(index) as u32, &item.as_bytes())
            .map_err(|_| Error::FlashError)?;
        write_aligned(hal, self.entry_address(index + 1) as u32, data)
            .map_err(|_| Error::FlashError)?;
        self.set_entry_state_range::<T>(hal, index..index + span as u8, EntryState::Written)?;

        self.used_entries += span as u8;
        self.hash_list.push(HashListEntry {
            hash: item.hash(T::crc32),
            index,
        });
        if self.next_free_entry() == ENTRY_COUNT {
            self.mark_full(hal)?;
        }
        Ok(index)
    }

    /// Reads and verifies the record header at `index`. A blank or
    /// checksum-failing entry reads as absent.
    pub(crate) fn read_entry<T: Platform>(&self, hal: &mut T, index: u8) -> Result<Item, Error> {
        let mut buf = [0u8; ENTRY_SIZE];
        hal.read(self.entry_address(index) as u32, &mut buf)
            .map_err(|_| Error::FlashError)?;

        if buf.iter().all(|&b| b == 0xFF) {
            return Err(Error::KeyNotFound);
        }
        let item = Item::from_bytes(buf);
        if item.crc != item.compute_crc(T::crc32) {
            return Err(Error::KeyNotFound);
        }
        Ok(item)
    }

    /// Reads the payload of a string/blob record whose header sits at
    /// `index`. The caller checks the payload checksum.
    pub(crate) fn read_varlen_data<T: Platform>(
        &self,
        hal: &mut T,
        index: u8,
        item: &Item,
    ) -> Result<Vec<u8>, Error> {
        match item.item_type() {
            Some(t) if t.is_varlen() => {}
            Some(t) => return Err(Error::TypeMismatch(t)),
            None => return Err(Error::CorruptedData),
        }
        let size = unsafe { item.data.varlen.size } as usize;
        let mut buf = vec![0u8; T::align_read(size)];
        if !buf.is_empty() {
            hal.read(self.entry_address(index + 1) as u32, &mut buf)
                .map_err(|_| Error::FlashError)?;
        }
        buf.truncate(size);
        Ok(buf)
    }

    /// Per-page lookup of the record for (namespace, key). Hash list hits
    /// are verified against the actual record.
    pub(crate) fn find<T: Platform>(
        &self,
        hal: &mut T,
        namespace_index: u8,
        key: &Key,
    ) -> Result<Option<(u8, Item)>, Error> {
        let hash = Item::hash_of(T::crc32, namespace_index, key);
        for entry in &self.hash_list {
            if entry.hash != hash {
                continue;
            }
            let item = match self.read_entry(hal, entry.index) {
                Ok(item) => item,
                Err(Error::KeyNotFound) => continue,
                Err(e) => return Err(e),
            };
            if item.namespace_index == namespace_index && item.key == *key {
                return Ok(Some((entry.index, item)));
            }
        }
        Ok(None)
    }

    /// Flips every entry of the record's span from `Written` to `Erased`.
    pub(crate) fn erase_entry<T: Platform>(
        &mut self,
        hal: &mut T,
        index: u8,
        span: u8,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_entry @{:#x}[{}..{}]", self.address, index, index + span);

        self.set_entry_state_range::<T>(hal, index..index + span, EntryState::Erased)?;
        self.erased_entries += span;
        self.used_entries -= span;
        self.hash_list.retain(|entry| entry.index != index);
        Ok(())
    }

    pub(crate) fn entry_state(&self, index: u8) -> EntryState {
        let byte = self.bitmap[(index / 4) as usize];
        EntryState::from_bits(byte >> ((index % 4) * 2))
    }

    /// Updates the in-memory bitmap (1->0 transitions only) and writes the
    /// touched, word-aligned window back to flash.
    pub(crate) fn set_entry_state_range<T: Platform>(
        &mut self,
        hal: &mut T,
        indices: Range<u8>,
        state: EntryState,
    ) -> Result<(), Error> {
        for index in indices.clone() {
            let shift = (index % 4) * 2;
            let mask = 0b11u8 << shift;
            let bits = state.bits() << shift;
            self.bitmap[(index / 4) as usize] &= bits | !mask;
        }

        let start_byte = (indices.start / 4) as usize;
        let end_byte = ((indices.end - 1) / 4) as usize;
        let aligned_start = T::align_write_floor(start_byte);
        let aligned_end = T::align_write_ceil(end_byte + 1);

        let offset = self.address + offset_of!(RawPage, entry_state_bitmap) + aligned_start;
        write_aligned(hal, offset as u32, &self.bitmap[aligned_start..aligned_end])
            .map_err(|_| Error::FlashError)
    }

    fn entry_address(&self, index: u8) -> usize {
        self.address + offset_of!(RawPage, items) + ENTRY_SIZE * index as usize
    }

    pub(crate) fn next_free_entry(&self) -> usize {
        self.used_entries as usize + self.erased_entries as usize
    }

    pub(crate) fn free_entries(&self) -> usize {
        ENTRY_COUNT - self.next_free_entry()
    }

    pub(crate) fn address(&self) -> usize {
        self.address
    }

    pub(crate) fn state(&self) -> PageState {
        self.state
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn used(&self) -> u8 {
        self.used_entries
    }

    pub(crate) fn erased(&self) -> u8 {
        self.erased_entries
    }

    pub(crate) fn hash_entries(&self) -> &[HashListEntry] {
        &self.hash_list
    }

    /// (empty, written, erased, illegal) entry counts from the bitmap.
    pub(crate) fn entry_statistics(&self) -> (u32, u32, u32, u32) {
        let mut counts = (0u32, 0u32, 0u32, 0u32);
        for index in 0..ENTRY_COUNT as u8 {
            match self.entry_state(index) {
                EntryState::Empty => counts.0 += 1,
                EntryState::Written => counts.1 += 1,
                EntryState::Erased => counts.2 += 1,
                EntryState::Illegal => counts.3 += 1,
            }
        }
        counts
    }
}

fn entry_bytes(raw: &RawPage, index: u8) -> [u8; ENTRY_SIZE] {
    let offset = ENTRY_SIZE * index as usize;
    let mut buf = [0u8; ENTRY_SIZE];
    buf.copy_from_slice(&raw.items[offset..offset + ENTRY_SIZE]);
    buf
}

fn span_in_bounds(index: u8, span: u8) -> bool {
    span >= 1 && index as usize + span as usize <= ENTRY_COUNT
}

/// Whether an entry still flagged `Empty` holds a record whose write in
/// fact completed (valid header checksum, and for strings/blobs a valid
/// payload checksum too).
fn record_complete<T: Platform>(raw: &RawPage, index: u8, item: &Item) -> bool {
    if item.crc != item.compute_crc(T::crc32) || !span_in_bounds(index, item.span) {
        return false;
    }
    let Some(datatype) = item.item_type() else {
        return false;
    };
    if datatype.is_varlen() {
        let size = unsafe { item.data.varlen.size } as usize;
        if size > (item.span as usize - 1) * ENTRY_SIZE {
            return false;
        }
        let offset = ENTRY_SIZE * (index as usize + 1);
        T::crc32(0, &raw.items[offset..offset + size]) == unsafe { item.data.varlen.crc }
    } else {
        item.span == 1
    }
}

impl PartialEq<Self> for Page {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Page {}

impl PartialOrd<Self> for Page {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Free-page heap order: already-erased pages first, then by address for
// stable allocation; loaded pages by descending age.
impl Ord for Page {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.state, other.state) {
            (PageState::Uninitialized, PageState::Uninitialized) => {
                other.address.cmp(&self.address)
            }
            (PageState::Uninitialized, _) => Ordering::Greater,
            (_, PageState::Uninitialized) => Ordering::Less,
            (_, _) => other.sequence.cmp(&self.sequence),
        }
    }
}
