use crate::Key;
use crate::error::Error;
use crate::handle::{Handle, OpenMode};
use crate::manager::PageManager;
use crate::page::Page;
use crate::platform::Platform;
use crate::raw::{ENTRY_COUNT, Item, ItemData, ItemType, MAX_VALUE_SIZE, PageState, SECTOR_SIZE};
use crate::u24::u24;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// The store keeps a summary of every page in memory; its footprint grows
/// with the number of sectors in the partition.
pub struct Store<T: Platform> {
    pub(crate) hal: T,
    pub(crate) manager: PageManager,
    pub(crate) namespaces: BTreeMap<Key, u8>,
    pub(crate) faulted: bool,
}

/// What a record write carries besides its header entry.
#[derive(Copy, Clone)]
enum Record<'a> {
    Inline(ItemData),
    Varlen(&'a [u8]),
}

impl<T: Platform> Store<T> {
    /// Mounts the `partition_size / 4096` sectors starting at
    /// `partition_offset` and rebuilds the in-memory state:
    ///
    /// 1. resolves the namespace registry,
    /// 2. builds a hashed key cache per page for quick lookups,
    /// 3. finishes a relocation interrupted by power loss,
    /// 4. drops stale duplicates left by interrupted overwrites.
    ///
    /// Pages or records with invalid checksums are repaired or retired
    /// without reporting an error.
    pub fn new(partition_offset: usize, partition_size: usize, hal: T) -> Result<Self, Error> {
        if !partition_offset.is_multiple_of(SECTOR_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }
        if !partition_size.is_multiple_of(SECTOR_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }
        let sectors = partition_size / SECTOR_SIZE;
        if sectors > u16::MAX as usize {
            return Err(Error::InvalidPartitionSize);
        }
        if sectors < 2 {
            return Err(Error::PartitionTooSmall);
        }

        let mut hal = hal;
        let (manager, slots) = PageManager::load(&mut hal, partition_offset, sectors)?;

        let mut namespaces = BTreeMap::new();
        for slot in slots {
            namespaces.insert(slot.name, slot.index);
        }

        let mut store = Self {
            hal,
            manager,
            namespaces,
            faulted: false,
        };
        store.manager.complete_relocation(&mut store.hal)?;
        store.dedup()?;
        Ok(store)
    }

    /// Binds a handle to a namespace. `ReadWrite` creates the namespace if
    /// it does not exist yet; `ReadOnly` fails with `NamespaceNotFound`
    /// instead. The handle borrows the store exclusively, dropping it is
    /// "close".
    pub fn open(&mut self, namespace: &Key, mode: OpenMode) -> Result<Handle<'_, T>, Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }
        if namespace.is_empty() {
            return Err(Error::InvalidName);
        }
        let namespace_index =
            match self.namespace_index(namespace, mode == OpenMode::ReadWrite) {
                Ok(index) => index,
                Err(e @ (Error::FlashError | Error::RemoveFailed)) => {
                    self.faulted = true;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
        Ok(Handle {
            store: self,
            namespace_index,
            mode,
        })
    }

    fn namespace_index(&mut self, name: &Key, create: bool) -> Result<u8, Error> {
        if let Some(&index) = self.namespaces.get(name) {
            return Ok(index);
        }
        if !create {
            return Err(Error::NamespaceNotFound);
        }

        // smallest unused index; 0 is the registry itself, 255 is reserved
        let index = (1..=254u8)
            .find(|candidate| !self.namespaces.values().any(|used| used == candidate))
            .ok_or(Error::FlashFull)?;

        #[cfg(feature = "defmt")]
        trace!("creating namespace {}", index);

        let mut raw = [0xFF; 8];
        raw[0] = index;
        self.write_item(0, ItemType::U8, name, Record::Inline(ItemData { raw }))?;
        self.namespaces.insert(*name, index);
        Ok(index)
    }

    /// Appends the record on the active page, rolling over to a fresh page
    /// when it does not fit, then retires any prior copy of the key. The
    /// write-new-then-erase-old order means an interruption leaves at most
    /// one stale duplicate, which the next mount resolves.
    fn write_item(
        &mut self,
        namespace_index: u8,
        datatype: ItemType,
        key: &Key,
        record: Record<'_>,
    ) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::InvalidName);
        }
        if let Record::Varlen(data) = record {
            if data.len() > MAX_VALUE_SIZE {
                return Err(Error::ValueTooLong);
            }
        }

        let written = loop {
            let mut page = self.manager.active_page(&mut self.hal)?;
            let result = match record {
                Record::Inline(data) => {
                    page.write_entry(&mut self.hal, namespace_index, datatype, *key, data)
                }
                Record::Varlen(data) => {
                    page.write_varlen(&mut self.hal, namespace_index, datatype, *key, data)
                }
            };
            match result {
                Ok(index) => {
                    let address = page.address();
                    self.manager.restore(page);
                    break (address, index);
                }
                Err(Error::PageFull) => {
                    if page.state() == PageState::Active {
                        page.mark_full(&mut self.hal)?;
                    }
                    self.manager.restore(page);
                }
                Err(e) => {
                    self.manager.restore(page);
                    return Err(e);
                }
            }
        };

        self.erase_stale(namespace_index, key, written)
    }

    /// Drops every live copy of (namespace, key) except the record at
    /// `keep`. Failures here come back as `RemoveFailed`: the new value is
    /// already durable.
    fn erase_stale(
        &mut self,
        namespace_index: u8,
        key: &Key,
        keep: (usize, u8),
    ) -> Result<(), Error> {
        if namespace_index == 0 {
            // registry records are written once and never replaced
            return Ok(());
        }

        let hash = Item::hash_of(T::crc32, namespace_index, key);
        let mut stale: Vec<(usize, u8, u8)> = Vec::new();
        for (page_index, page) in self.manager.pages().iter().enumerate() {
            for entry in page.hash_entries() {
                if entry.hash != hash || (page.address(), entry.index) == keep {
                    continue;
                }
                let item = match page.read_entry(&mut self.hal, entry.index) {
                    Ok(item) => item,
                    Err(Error::KeyNotFound) => continue,
                    Err(_) => return Err(Error::RemoveFailed),
                };
                if item.namespace_index == namespace_index && item.key == *key {
                    stale.push((page_index, entry.index, item.span));
                }
            }
        }
        for (page_index, index, span) in stale {
            self.manager.pages_mut()[page_index]
                .erase_entry(&mut self.hal, index, span)
                .map_err(|_| Error::RemoveFailed)?;
        }
        Ok(())
    }

    /// Cross-page lookup of the live record for (namespace, key).
    fn find_item(&mut self, namespace_index: u8, key: &Key) -> Result<(usize, u8, Item), Error> {
        if key.is_empty() {
            return Err(Error::InvalidName);
        }
        for (page_index, page) in self.manager.pages().iter().enumerate() {
            if let Some((index, item)) = page.find(&mut self.hal, namespace_index, key)? {
                return Ok((page_index, index, item));
            }
        }
        Err(Error::KeyNotFound)
    }

    pub(crate) fn write_primitive(
        &mut self,
        namespace_index: u8,
        datatype: ItemType,
        key: &Key,
        value: u64,
    ) -> Result<(), Error> {
        let width = datatype
            .primitive_width()
            .ok_or(Error::TypeMismatch(datatype))?;
        let mut raw = [0xFF; 8];
        raw[..width].copy_from_slice(&value.to_le_bytes()[..width]);
        self.write_item(namespace_index, datatype, key, Record::Inline(ItemData { raw }))
    }

    pub(crate) fn write_str(
        &mut self,
        namespace_index: u8,
        key: &Key,
        value: &str,
    ) -> Result<(), Error> {
        // stored with the terminator, like the size reported back
        if value.len() + 1 > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLong);
        }
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(b'\0');
        self.write_item(namespace_index, ItemType::Str, key, Record::Varlen(&buf))
    }

    pub(crate) fn write_blob(
        &mut self,
        namespace_index: u8,
        key: &Key,
        value: &[u8],
    ) -> Result<(), Error> {
        self.write_item(namespace_index, ItemType::Blob, key, Record::Varlen(value))
    }

    pub(crate) fn read_primitive(
        &mut self,
        namespace_index: u8,
        datatype: ItemType,
        key: &Key,
    ) -> Result<u64, Error> {
        let (_, _, item) = self.find_item(namespace_index, key)?;
        let found = item.item_type().ok_or(Error::CorruptedData)?;
        if found != datatype {
            return Err(Error::TypeMismatch(found));
        }
        Ok(u64::from_le_bytes(unsafe { item.data.raw }))
    }

    /// Reads and checksums the payload of a string/blob record. A payload
    /// that no longer verifies is retired on the spot and reads as absent.
    fn read_varlen_item(
        &mut self,
        namespace_index: u8,
        datatype: ItemType,
        key: &Key,
    ) -> Result<Vec<u8>, Error> {
        let (page_index, index, item) = self.find_item(namespace_index, key)?;
        let found = item.item_type().ok_or(Error::CorruptedData)?;
        if found != datatype {
            return Err(Error::TypeMismatch(found));
        }
        let data =
            self.manager.pages()[page_index].read_varlen_data(&mut self.hal, index, &item)?;
        if T::crc32(0, &data) != unsafe { item.data.varlen.crc } {
            self.manager.pages_mut()[page_index].erase_entry(&mut self.hal, index, item.span)?;
            return Err(Error::KeyNotFound);
        }
        Ok(data)
    }

    pub(crate) fn read_string(
        &mut self,
        namespace_index: u8,
        key: &Key,
    ) -> Result<String, Error> {
        let data = self.read_varlen_item(namespace_index, ItemType::Str, key)?;
        let Some((&0, text)) = data.split_last() else {
            return Err(Error::CorruptedData);
        };
        let text = core::str::from_utf8(text).map_err(|_| Error::CorruptedData)?;
        Ok(text.to_string())
    }

    pub(crate) fn read_blob(&mut self, namespace_index: u8, key: &Key) -> Result<Vec<u8>, Error> {
        self.read_varlen_item(namespace_index, ItemType::Blob, key)
    }

    /// Copies a stored string or blob into a caller buffer and returns the
    /// stored size. A too-small buffer reports the required size instead of
    /// writing anything.
    pub(crate) fn read_into(
        &mut self,
        namespace_index: u8,
        key: &Key,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let (page_index, index, item) = self.find_item(namespace_index, key)?;
        let found = item.item_type().ok_or(Error::CorruptedData)?;
        if !found.is_varlen() {
            return Err(Error::TypeMismatch(found));
        }
        let required = unsafe { item.data.varlen.size } as usize;
        if buf.len() < required {
            return Err(Error::BufferTooSmall { required });
        }
        let data =
            self.manager.pages()[page_index].read_varlen_data(&mut self.hal, index, &item)?;
        if T::crc32(0, &data) != unsafe { item.data.varlen.crc } {
            self.manager.pages_mut()[page_index].erase_entry(&mut self.hal, index, item.span)?;
            return Err(Error::KeyNotFound);
        }
        buf[..required].copy_from_slice(&data);
        Ok(required)
    }

    /// Stored size of a string or blob, terminator included for strings.
    pub(crate) fn value_size(&mut self, namespace_index: u8, key: &Key) -> Result<usize, Error> {
        let (_, _, item) = self.find_item(namespace_index, key)?;
        let found = item.item_type().ok_or(Error::CorruptedData)?;
        if !found.is_varlen() {
            return Err(Error::TypeMismatch(found));
        }
        Ok(unsafe { item.data.varlen.size } as usize)
    }

    pub(crate) fn erase_key(&mut self, namespace_index: u8, key: &Key) -> Result<(), Error> {
        let (page_index, index, item) = self.find_item(namespace_index, key)?;
        self.manager.pages_mut()[page_index].erase_entry(&mut self.hal, index, item.span)
    }

    /// Erases every record of the namespace. The registry entry stays so
    /// the index keeps its meaning. Succeeds even when nothing is stored.
    pub(crate) fn erase_namespace(&mut self, namespace_index: u8) -> Result<(), Error> {
        for page_index in 0..self.manager.pages().len() {
            let mut victims: Vec<(u8, u8)> = Vec::new();
            let page = &self.manager.pages()[page_index];
            for entry in page.hash_entries() {
                let item = match page.read_entry(&mut self.hal, entry.index) {
                    Ok(item) => item,
                    Err(Error::KeyNotFound) => continue,
                    Err(e) => return Err(e),
                };
                if item.namespace_index == namespace_index {
                    victims.push((entry.index, item.span));
                }
            }
            for (index, span) in victims {
                self.manager.pages_mut()[page_index].erase_entry(&mut self.hal, index, span)?;
            }
        }
        Ok(())
    }

    /// Startup pass over all pages: when the same (namespace, key) is live
    /// on more than one page, only the copy with the highest page sequence
    /// (then highest entry index) survives. Interrupted overwrites and
    /// interrupted relocations both funnel into this rule.
    fn dedup(&mut self) -> Result<(), Error> {
        let mut by_hash: BTreeMap<u24, Vec<(usize, u8, u32)>> = BTreeMap::new();
        for (page_index, page) in self.manager.pages().iter().enumerate() {
            for entry in page.hash_entries() {
                by_hash
                    .entry(entry.hash)
                    .or_default()
                    .push((page_index, entry.index, page.sequence()));
            }
        }

        for (_, candidates) in by_hash {
            if candidates.len() <= 1 {
                continue;
            }

            // same hash does not mean same key, group by the real identity
            let mut groups: BTreeMap<(u8, Key), Vec<(usize, u8, u32, u8)>> = BTreeMap::new();
            for (page_index, index, sequence) in candidates {
                let item =
                    match self.manager.pages()[page_index].read_entry(&mut self.hal, index) {
                        Ok(item) => item,
                        Err(Error::KeyNotFound) => continue,
                        Err(e) => return Err(e),
                    };
                groups
                    .entry((item.namespace_index, item.key))
                    .or_default()
                    .push((page_index, index, sequence, item.span));
            }

            for (_, mut group) in groups {
                if group.len() <= 1 {
                    continue;
                }
                group.sort_by_key(|&(_, index, sequence, _)| (sequence, index));
                for &(page_index, index, _, span) in &group[..group.len() - 1] {
                    #[cfg(feature = "defmt")]
                    trace!("dropping stale duplicate at entry {}", index);
                    self.manager.pages_mut()[page_index].erase_entry(
                        &mut self.hal,
                        index,
                        span,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Detailed page and entry usage of the partition.
    pub fn statistics(&self) -> StoreStatistics {
        let mut pages: Vec<&Page> = self.manager.iter_all().collect();
        // sorted for stable output, this is also used in tests
        pages.sort_by_key(|page| page.address());

        let mut page_stats = PageStatistics {
            empty: 0,
            active: 0,
            full: 0,
            freeing: 0,
            corrupted: 0,
        };

        let entries_per_page: Vec<EntryStatistics> = pages
            .into_iter()
            .map(|page| {
                match page.state() {
                    PageState::Uninitialized => page_stats.empty += 1,
                    PageState::Active => page_stats.active += 1,
                    PageState::Full => page_stats.full += 1,
                    PageState::Freeing => page_stats.freeing += 1,
                    PageState::Corrupt | PageState::Invalid => page_stats.corrupted += 1,
                }

                if matches!(page.state(), PageState::Corrupt | PageState::Invalid) {
                    EntryStatistics {
                        empty: 0,
                        written: 0,
                        erased: 0,
                        illegal: ENTRY_COUNT as u32,
                    }
                } else {
                    let (empty, written, erased, illegal) = page.entry_statistics();
                    EntryStatistics {
                        empty,
                        written,
                        erased,
                        illegal,
                    }
                }
            })
            .collect();

        let entries_overall = entries_per_page.iter().fold(
            EntryStatistics {
                empty: 0,
                written: 0,
                erased: 0,
                illegal: 0,
            },
            |acc, x| EntryStatistics {
                empty: acc.empty + x.empty,
                written: acc.written + x.written,
                erased: acc.erased + x.erased,
                illegal: acc.illegal + x.illegal,
            },
        );

        StoreStatistics {
            pages: page_stats,
            entries_per_page,
            entries_overall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatistics {
    pub pages: PageStatistics,
    pub entries_per_page: Vec<EntryStatistics>,
    pub entries_overall: EntryStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStatistics {
    pub empty: u16,
    pub active: u16,
    pub full: u16,
    pub freeing: u16,
    pub corrupted: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatistics {
    pub empty: u32,
    pub written: u32,
    pub erased: u32,
    pub illegal: u32,
}
