use crate::error::Error;
use crate::page::{LoadedPage, NamespaceSlot, Page};
use crate::platform::Platform;
use crate::raw::{ENTRY_COUNT, EntryState, PageState, SECTOR_SIZE};
use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Bookkeeping for the page pool: live pages in ascending sequence order
/// (the active page, if any, last) plus a heap of free pages. One free page
/// is always held in reserve so compaction has somewhere to move records.
pub(crate) struct PageManager {
    pages: Vec<Page>,
    free_pages: BinaryHeap<Page>,
}

impl PageManager {
    /// Loads every sector of the partition and rebuilds the sequence order.
    /// Also returns the namespace registry entries found while scanning.
    pub(crate) fn load<T: Platform>(
        hal: &mut T,
        base_address: usize,
        sector_count: usize,
    ) -> Result<(Self, Vec<NamespaceSlot>), Error> {
        let mut manager = PageManager {
            pages: Vec::with_capacity(sector_count),
            free_pages: BinaryHeap::with_capacity(sector_count),
        };
        let mut namespaces = Vec::new();

        for sector in 0..sector_count {
            let address = base_address + sector * SECTOR_SIZE;
            match Page::load(hal, address)? {
                LoadedPage::Free(page) => manager.free_pages.push(page),
                LoadedPage::Live(page, mut slots) => {
                    manager.pages.push(page);
                    namespaces.append(&mut slots);
                }
            }
        }

        manager.pages.sort_by_key(Page::sequence);
        manager.demote_duplicate_active(hal)?;
        Ok((manager, namespaces))
    }

    /// Only one page may accept writes. If an interrupted operation left
    /// several pages in the `Active` state, the one with the highest
    /// sequence number survives and the others are demoted to `Full`.
    fn demote_duplicate_active<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let active: Vec<usize> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.state() == PageState::Active)
            .map(|(index, _)| index)
            .collect();
        let Some((_, rest)) = active.split_last() else {
            return Ok(());
        };
        for &index in rest {
            #[cfg(feature = "defmt")]
            warn!(
                "duplicate active page @{:#x}, demoting to full",
                self.pages[index].address()
            );
            self.pages[index].mark_full(hal)?;
        }
        Ok(())
    }

    /// Finishes a relocation that was interrupted by power loss: records of
    /// a `Freeing` page that have not arrived on the destination yet are
    /// copied over, then the source sector is erased.
    pub(crate) fn complete_relocation<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let Some(index) = self
            .pages
            .iter()
            .position(|page| page.state() == PageState::Freeing)
        else {
            return Ok(());
        };

        #[cfg(feature = "defmt")]
        trace!("resuming relocation of page @{:#x}", self.pages[index].address());

        // computed before the source leaves the pool so sequence numbers
        // stay strictly increasing
        let sequence = self.next_sequence();
        let source = self.pages.swap_remove(index);

        let target = match self
            .pages
            .iter()
            .position(|page| page.state() == PageState::Active)
        {
            Some(index) => self.pages.swap_remove(index),
            None => self.fresh_page(hal, sequence)?,
        };

        self.copy_entries(hal, &source, target)?;
        self.erase_page(hal, source)
    }

    pub(crate) fn take_active(&mut self) -> Option<Page> {
        self.pages
            .pop_if(|page| page.state() == PageState::Active)
    }

    pub(crate) fn restore(&mut self, page: Page) {
        self.pages.push(page);
    }

    /// Hands out the page new records go to, allocating (and if necessary
    /// compacting) when none is active. Ownership moves to the caller;
    /// `restore` puts the page back.
    pub(crate) fn active_page<T: Platform>(&mut self, hal: &mut T) -> Result<Page, Error> {
        if let Some(page) = self.take_active() {
            return Ok(page);
        }

        // only the reserve page is left, reclaim a full one first
        if self.free_pages.len() == 1 {
            self.reclaim(hal)?;
        }

        if let Some(page) = self.take_active() {
            return Ok(page);
        }

        if self.free_pages.len() <= 1 {
            return Err(Error::FlashFull);
        }

        let sequence = self.next_sequence();
        self.fresh_page(hal, sequence)
    }

    /// Pops a free page, erases it if it is not blank and stamps it with
    /// `sequence` as the new active page.
    fn fresh_page<T: Platform>(&mut self, hal: &mut T, sequence: u32) -> Result<Page, Error> {
        let Some(mut page) = self.free_pages.pop() else {
            return Err(Error::FlashFull);
        };
        if page.state() != PageState::Uninitialized {
            hal.erase(page.address() as u32, (page.address() + SECTOR_SIZE) as u32)
                .map_err(|_| Error::FlashError)?;
            page = Page::blank(page.address());
        }
        page.initialize(hal, sequence)?;
        Ok(page)
    }

    /// Next sequence number: one greater than the maximum observed.
    pub(crate) fn next_sequence(&self) -> u32 {
        self.pages
            .iter()
            .map(Page::sequence)
            .max()
            .map_or(0, |sequence| sequence + 1)
    }

    /// Garbage collection. The source is the `Full` page with the highest
    /// erased-to-used ratio, ties broken by lowest sequence number so older
    /// sectors get erased first (wear-leveling). Its live records move to a
    /// freshly initialized page, then the source sector is erased.
    fn reclaim<T: Platform>(&mut self, hal: &mut T) -> Result<(), Error> {
        let sequence = self.next_sequence();

        let source = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.state() == PageState::Full && page.erased() > 0)
            .max_by(|(_, a), (_, b)| {
                let lhs = u32::from(a.erased()) * u32::from(b.used());
                let rhs = u32::from(b.erased()) * u32::from(a.used());
                lhs.cmp(&rhs)
                    .then_with(|| b.sequence().cmp(&a.sequence()))
            })
            .map(|(index, _)| index);
        let Some(index) = source else {
            return Err(Error::FlashFull);
        };

        let mut source = self.pages.swap_remove(index);

        #[cfg(feature = "defmt")]
        trace!(
            "reclaiming page @{:#x} ({} used, {} erased)",
            source.address(),
            source.used(),
            source.erased()
        );

        if source.used() > 0 {
            source.mark_freeing(hal)?;
            let target = self.fresh_page(hal, sequence)?;
            self.copy_entries(hal, &source, target)?;
        }
        self.erase_page(hal, source)
    }

    /// Copies every written record of `source` into `target` and pushes the
    /// target into the pool. If an earlier copy attempt was interrupted,
    /// records already present on the target are skipped.
    fn copy_entries<T: Platform>(
        &mut self,
        hal: &mut T,
        source: &Page,
        mut target: Page,
    ) -> Result<(), Error> {
        let mut resume_marker = match target.hash_entries().iter().max_by_key(|e| e.index) {
            Some(entry) => Some(target.read_entry(hal, entry.index)?),
            None => None,
        };

        let mut index = 0u8;
        while (index as usize) < ENTRY_COUNT {
            if source.entry_state(index) != EntryState::Written {
                index += 1;
                continue;
            }
            let item = match source.read_entry(hal, index) {
                Ok(item) => item,
                Err(Error::KeyNotFound) => {
                    index += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(marker) = &resume_marker {
                if item == *marker {
                    resume_marker = None;
                }
                index += item.span;
                continue;
            }

            match item.item_type() {
                Some(datatype) if datatype.is_varlen() => {
                    let data = source.read_varlen_data(hal, index, &item)?;
                    target.write_varlen(hal, item.namespace_index, datatype, item.key, &data)?;
                }
                Some(datatype) => {
                    target.write_entry(hal, item.namespace_index, datatype, item.key, item.data)?;
                }
                None => {}
            }
            index += item.span;
        }

        self.pages.push(target);
        Ok(())
    }

    /// Erases the sector and returns the page to the free pool.
    fn erase_page<T: Platform>(&mut self, hal: &mut T, page: Page) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase page @{:#x}", page.address());

        hal.erase(page.address() as u32, (page.address() + SECTOR_SIZE) as u32)
            .map_err(|_| Error::FlashError)?;
        self.free_pages.push(Page::blank(page.address()));
        Ok(())
    }

    pub(crate) fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub(crate) fn pages_mut(&mut self) -> &mut [Page] {
        &mut self.pages
    }

    /// Live and free pages alike, in no particular order.
    pub(crate) fn iter_all(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().chain(self.free_pages.iter())
    }
}
