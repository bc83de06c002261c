use core::mem;
use core::ops::Range;
use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::addr::PhysAddr;
use crate::error::{Error, Result};
use crate::page_table::{link_datum, PageKind, PageTable, KIND_FREE, KIND_LINK_BODY};
use crate::quickpool::{Quickpool, DIVISIONS};
use crate::skiplist::{FreeRangeIndex, Node};
use crate::PAGE_SIZE;

/// `PagePool` manages a contiguous region of physical memory and hands out
/// single 4 KiB pages and multi-page contiguous extents ("page links").
///
/// Single-page traffic is served from a lock-free striped cache and falls
/// back to the free-range index, which also fully owns multi-page requests.
/// Every page carries an ownership tag in the pool's page table, so frees
/// are validated and multi-page frees need only the start address.
pub struct PagePool {
    state: &'static PoolState,
}

#[repr(C)]
#[repr(align(64))]
struct PoolState {
    pages_start: PhysAddr,
    page_count: usize,
    free_pages: AtomicUsize,
    /// Serializes refills and extent allocations. Frees never take it.
    alloc_lock: Mutex<()>,
    table: PageTable,
    quickpool: Quickpool,
    index: FreeRangeIndex,
}

impl PagePool {
    /// Creates a `PagePool` owning the provided physical address range. The
    /// pool state, page table and free-range nodes are carved off the front
    /// of the region; the remainder becomes the page-aligned usable span.
    ///
    /// Regions of more than `u16::MAX - 1` pages are refused, so a page
    /// reference always fits 16 bits.
    ///
    /// # Safety
    ///
    /// `mem` must be a valid, unused memory range. After this call the range
    /// is owned by the pool; any direct use of memory not obtained through
    /// `alloc_page`/`alloc_link` is undefined.
    pub unsafe fn manage(mem: Range<PhysAddr>) -> Option<PagePool> {
        let pages_end = mem.end.align_down(PAGE_SIZE);
        let mut cursor = mem.start;

        let state = claim_memory::<PoolState>(&mut cursor, pages_end, 1)?;

        // Upper bound on the page count, before metadata is carved. The
        // table and node array are sized from it and the real count is
        // recomputed below; the difference is waste, not an error.
        let estimate = pages_end.as_usize().saturating_sub(cursor.as_usize()) / PAGE_SIZE;
        if estimate == 0 {
            return None;
        }
        if estimate > u16::MAX as usize - 1 {
            log::error!("region of {estimate} pages exceeds the 16-bit page index space");
            return None;
        }

        let table_mem = claim_memory::<AtomicU8>(&mut cursor, pages_end, estimate)?;
        let node_mem = claim_memory::<Node>(&mut cursor, pages_end, estimate + 1)?;

        let pages_start = cursor.align_up(PAGE_SIZE);
        if pages_start > pages_end {
            return None;
        }
        let page_count = (pages_end - pages_start) / PAGE_SIZE;
        if page_count == 0 {
            return None;
        }

        // Zeroed bytes are a valid (dead, unlocked) node and a valid entry.
        ptr::write_bytes(node_mem, 0, page_count + 1);
        ptr::write_bytes(table_mem, 0, page_count);
        let nodes = slice::from_raw_parts(node_mem as *const Node, page_count + 1);
        let entries = slice::from_raw_parts(table_mem as *const AtomicU8, page_count);

        state.write(PoolState {
            pages_start,
            page_count,
            free_pages: AtomicUsize::new(page_count),
            alloc_lock: Mutex::new(()),
            table: PageTable::new(entries),
            quickpool: Quickpool::new(pages_start.as_usize(), page_count),
            index: FreeRangeIndex::new(nodes),
        });
        let state = &*state;

        let _seeded = state.index.insert(0, page_count);
        debug_assert!(_seeded.is_ok(), "fresh index rejected the initial extent");

        log::info!(
            "managing {page_count} pages at {pages_start}, {} bytes of metadata",
            pages_start - mem.start,
        );

        Some(PagePool { state })
    }

    /// Allocates one page, tagging it with `kind` and `datum` in the page
    /// table. Prefers the quickpool; a miss takes a chunk of up to a
    /// sixteenth of the pool off the free-range index and caches the rest.
    ///
    /// # Safety
    ///
    /// `self` must have been created using `manage`.
    pub unsafe fn alloc_page(&self, kind: PageKind, datum: u8) -> Result<PhysAddr> {
        let state = self.state;
        let mut tries = 0;
        loop {
            if let Some(page) = state.quickpool.pop_any() {
                return Ok(self.claim_single(PhysAddr::new(page), kind, datum));
            }

            match state.alloc_lock.try_lock() {
                Some(_refill) => {
                    let want = (state.page_count / 16).max(1);
                    if let Some((first, got)) = state.index.remove_best_fit(want, want - 1) {
                        log::debug!("refill took {got} pages at page {first}");
                        if got > 1 {
                            state
                                .quickpool
                                .push(self.page_address(first + 1).as_usize(), got - 1);
                        }
                        return Ok(self.claim_single(self.page_address(first), kind, datum));
                    }
                    tries += 1;
                    if tries >= 5 {
                        return Err(Error::OutOfMemory);
                    }
                }
                // Another thread holds the refill lock; its surplus pages
                // will show up in the stripes, so just go around again.
                None => {}
            }
            delay(tries.max(1));
        }
    }

    /// Returns a single page to the pool.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by `alloc_page` on this pool.
    pub unsafe fn free_page(&self, page: PhysAddr) -> Result<()> {
        let state = self.state;
        let index = self.checked_index(page)?;
        let kind = state.table.kind(index);
        if kind == KIND_FREE {
            log::error!("double free of page {index}");
            return Err(Error::InvalidFree(index));
        }
        if kind == PageKind::PageLink as u8 || kind == KIND_LINK_BODY {
            log::error!("page {index} belongs to a page link, free the link instead");
            return Err(Error::InvalidFree(index));
        }

        state.table.set(index, KIND_FREE, 0);
        state.quickpool.push(page.as_usize(), 1);
        state.free_pages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates `len >= 2` contiguous pages and records the length in the
    /// page table, so `free_link` needs only the start address. Requests of
    /// an eighth of the pool or more are served worst fit, smaller ones
    /// best fit.
    ///
    /// # Safety
    ///
    /// `self` must have been created using `manage`.
    pub unsafe fn alloc_link(&self, len: usize) -> Result<PhysAddr> {
        if len < 2 {
            return Err(Error::InvalidLength(len));
        }
        let state = self.state;
        let mut tries = 0;
        loop {
            if state.free_pages.load(Ordering::Relaxed) < len {
                return Err(Error::OutOfMemory);
            }

            let taken = {
                let _guard = state.alloc_lock.lock();
                let mut taken = self.take_extent(len);
                if taken.is_none() {
                    // The missing pages may be sitting in the stripes.
                    // Reclaim them high to low, retrying after each stripe.
                    for stripe in (0..DIVISIONS).rev() {
                        self.drain_stripe(stripe);
                        taken = self.take_extent(len);
                        if taken.is_some() {
                            break;
                        }
                    }
                }
                taken
            };

            match taken {
                Some(first) => {
                    for i in 0..len {
                        let kind = if i == 0 {
                            PageKind::PageLink as u8
                        } else {
                            KIND_LINK_BODY
                        };
                        state.table.set(first + i, kind, link_datum(len, i));
                    }
                    state.free_pages.fetch_sub(len, Ordering::Relaxed);
                    return Ok(self.page_address(first));
                }
                None => {
                    tries += 1;
                    if tries > 2 {
                        return Err(Error::OutOfMemory);
                    }
                    delay(tries);
                }
            }
        }
    }

    /// Returns the page link starting at `link` to the pool. The length is
    /// decoded from the page table and the whole extent is validated before
    /// anything changes; a page in the middle of a link is refused.
    ///
    /// # Safety
    ///
    /// `link` must have been returned by `alloc_link` on this pool.
    pub unsafe fn free_link(&self, link: PhysAddr) -> Result<()> {
        let state = self.state;
        let first = self.checked_index(link)?;
        if state.table.kind(first) != PageKind::PageLink as u8 {
            log::error!("free of page {first} which does not start a page link");
            return Err(Error::InvalidFree(first));
        }
        let len = state.table.link_len(first);
        if len < 2 || first + len > state.page_count {
            log::error!("page link at {first} decodes to invalid length {len}");
            return Err(Error::InvalidFree(first));
        }
        for body in first + 1..first + len {
            if state.table.kind(body) != KIND_LINK_BODY {
                log::error!("page link at {first} is torn at page {body}");
                return Err(Error::InvalidFree(body));
            }
        }

        // Retag before inserting: the pages stay ours until the insert
        // publishes them, and allocators retag only after taking them out.
        for page in first..first + len {
            state.table.set(page, KIND_FREE, 0);
        }
        match state.index.insert(first, len) {
            Ok(()) => {
                state.free_pages.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                // Index refused the extent, so the table was lying; put the
                // link tags back so the failure is inspectable.
                for i in 0..len {
                    let kind = if i == 0 {
                        PageKind::PageLink as u8
                    } else {
                        KIND_LINK_BODY
                    };
                    state.table.set(first + i, kind, link_datum(len, i));
                }
                Err(err)
            }
        }
    }

    /// Flushes every quickpool stripe into the free-range index, restoring
    /// full coalescing. Called by callers that want a quiescent view.
    pub fn drain_quickpools(&self) {
        for stripe in (0..DIVISIONS).rev() {
            self.drain_stripe(stripe);
        }
    }

    pub fn free_page_count(&self) -> usize {
        self.state.free_pages.load(Ordering::Relaxed)
    }

    pub fn total_page_count(&self) -> usize {
        self.state.page_count
    }

    /// Size in pages of the largest free extent the index currently holds.
    /// Pages cached in the quickpool are not included; drain first for an
    /// exact answer.
    pub fn largest_free_extent(&self) -> usize {
        self.state.index.largest_size()
    }

    /// Kind nibble of the page table entry for `index`.
    pub fn page_kind(&self, index: usize) -> u8 {
        self.state.table.kind(index)
    }

    /// Datum nibble of the page table entry for `index`.
    pub fn page_datum(&self, index: usize) -> u8 {
        self.state.table.datum(index)
    }

    /// Index of the page containing `page`, which must lie in the pool.
    pub fn page_index(&self, page: PhysAddr) -> usize {
        (page - self.state.pages_start) / PAGE_SIZE
    }

    /// Base address of page `index`, which must be below `total_page_count`.
    pub fn page_address(&self, index: usize) -> PhysAddr {
        self.state.pages_start + index * PAGE_SIZE
    }

    fn claim_single(&self, page: PhysAddr, kind: PageKind, datum: u8) -> PhysAddr {
        let state = self.state;
        state.table.set(self.page_index(page), kind as u8, datum);
        state.free_pages.fetch_sub(1, Ordering::Relaxed);
        page
    }

    fn take_extent(&self, len: usize) -> Option<usize> {
        let state = self.state;
        if len >= state.page_count / 8 {
            // Worst fit: carving big requests out of the largest extent
            // keeps them serviceable for longer.
            if state.index.largest_size() < len {
                return None;
            }
            let (first, got) = state.index.remove_largest()?;
            if got < len {
                // The largest shrank between the probe and the removal.
                if let Err(err) = state.index.insert(first, got) {
                    log::error!("could not return extent at {first}: {err}");
                }
                return None;
            }
            if got > len {
                if let Err(err) = state.index.insert(first + len, got - len) {
                    log::error!("lost the tail of a split extent: {err}");
                }
            }
            Some(first)
        } else {
            let (first, got) = state.index.remove_best_fit(len, 0)?;
            debug_assert_eq!(got, len);
            Some(first)
        }
    }

    fn drain_stripe(&self, stripe: usize) {
        let state = self.state;
        let mut drained = 0;
        while let Some(page) = state.quickpool.pop(stripe) {
            let index = self.page_index(PhysAddr::new(page));
            if let Err(err) = state.index.insert(index, 1) {
                log::error!("dropping page {index} on drain: {err}");
            }
            drained += 1;
        }
        if drained != 0 {
            log::debug!("drained {drained} pages from stripe {stripe}");
        }
    }

    fn checked_index(&self, page: PhysAddr) -> Result<usize> {
        let state = self.state;
        if !page.is_aligned(PAGE_SIZE) || page < state.pages_start {
            return Err(Error::OutOfRange(page.as_usize()));
        }
        let index = (page - state.pages_start) / PAGE_SIZE;
        if index >= state.page_count {
            return Err(Error::OutOfRange(index));
        }
        Ok(index)
    }
}

unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

/// Bump-allocates `n` values of `T` from the front of the region.
fn claim_memory<T: Sized>(cursor: &mut PhysAddr, end: PhysAddr, n: usize) -> Option<*mut T> {
    let base = cursor.align_up(mem::align_of::<T>());
    let bytes = mem::size_of::<T>().checked_mul(n)?;
    let next = base.as_usize().checked_add(bytes)?;
    if next >= end.as_usize() {
        return None;
    }
    *cursor = PhysAddr::new(next);
    Some(base.as_mut_ptr::<T>())
}

fn delay(tries: usize) {
    for _ in 0..tries {
        core::hint::spin_loop();
    }
}
