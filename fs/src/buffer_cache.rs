//! Buffer cache: fixed-size block caching in front of a `BlockDevice`.
//!
//! This is the classic `bread`/`getblk`/`brelse` interface — a cache of
//! disk blocks, each backed by a slice of a shared physical page, looked up
//! by `(device id, block number)`. `BUFFERS_PER_PAGE` same-size buffers
//! share one backing frame, grouped by cache slot index, so the buffer
//! cache and page cache occupy pages the same way instead of wasting three
//! quarters of every frame behind a 1KB buffer.
//!
//! Buffers are only written back at three points, matching this crate's
//! page-cache writeback policy: an explicit `bwrite`, `sync_all`, and
//! eviction of a dirty buffer during reclaim. There is no background
//! flusher thread.

use slopos_lib::IrqMutex;
use slopos_mm::mm_constants::PAGE_SIZE_4KB_USIZE;
use slopos_mm::page_alloc::OwnedPageFrame;

use crate::blockdev::{BlockDevice, BlockDeviceError};

/// Logical block size used by the buffer cache. ext2's common 1KB block
/// size fits four to a page; a buffer never uses more than one page.
pub const BLOCK_SIZE: usize = 1024;
/// Number of same-size buffers packed into one backing page.
const BUFFERS_PER_PAGE: usize = PAGE_SIZE_4KB_USIZE / BLOCK_SIZE;
const MAX_BUFFERS: usize = 128;
const MAX_PAGES: usize = MAX_BUFFERS.div_ceil(BUFFERS_PER_PAGE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    CacheFull,
    Device(BlockDeviceError),
}

impl From<BlockDeviceError> for BufferError {
    fn from(e: BlockDeviceError) -> Self {
        BufferError::Device(e)
    }
}

struct BufferHead {
    in_use: bool,
    dev_id: u32,
    block: u64,
    uptodate: bool,
    dirty: bool,
    refcount: u32,
}

impl BufferHead {
    const fn empty() -> Self {
        Self {
            in_use: false,
            dev_id: 0,
            block: 0,
            uptodate: false,
            dirty: false,
            refcount: 0,
        }
    }
}

struct BufferCache {
    heads: [BufferHead; MAX_BUFFERS],
    /// Backing frames, one per group of `BUFFERS_PER_PAGE` cache slots.
    /// Allocated lazily the first time a slot in the group is used, and
    /// never freed back: `MAX_PAGES` frames is a fixed, small ceiling.
    pages: [Option<OwnedPageFrame>; MAX_PAGES],
}

impl BufferCache {
    const fn new() -> Self {
        Self {
            heads: [const { BufferHead::empty() }; MAX_BUFFERS],
            pages: [const { None }; MAX_PAGES],
        }
    }

    fn find(&self, dev_id: u32, block: u64) -> Option<usize> {
        self.heads
            .iter()
            .position(|h| h.in_use && h.dev_id == dev_id && h.block == block)
    }

    fn ensure_page(&mut self, idx: usize) -> Result<(), BufferError> {
        let group = idx / BUFFERS_PER_PAGE;
        if self.pages[group].is_none() {
            self.pages[group] = Some(OwnedPageFrame::alloc_zeroed().ok_or(BufferError::CacheFull)?);
        }
        Ok(())
    }

    fn data_ptr(&self, idx: usize) -> *mut u8 {
        let group = idx / BUFFERS_PER_PAGE;
        let slot = idx % BUFFERS_PER_PAGE;
        let base: *mut u8 = self.pages[group]
            .as_ref()
            .expect("buffer slot used before its page was allocated")
            .as_mut_ptr();
        unsafe { base.add(slot * BLOCK_SIZE) }
    }

    fn data_mut(&self, idx: usize) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data_ptr(idx), BLOCK_SIZE) }
    }

    fn data(&self, idx: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data_ptr(idx), BLOCK_SIZE) }
    }

    fn alloc_slot(&mut self, dev_id: u32, block: u64) -> Result<usize, BufferError> {
        let idx = match self.heads.iter().position(|h| !h.in_use) {
            Some(idx) => idx,
            None => {
                // Evict a clean, unreferenced buffer. The group's page stays
                // allocated; only the head is reset.
                self.heads
                    .iter()
                    .position(|h| h.in_use && h.refcount == 0 && !h.dirty)
                    .ok_or(BufferError::CacheFull)?
            }
        };
        self.ensure_page(idx)?;
        self.heads[idx] = BufferHead {
            in_use: true,
            dev_id,
            block,
            uptodate: false,
            dirty: false,
            refcount: 0,
        };
        Ok(idx)
    }
}

static CACHE: IrqMutex<BufferCache> = IrqMutex::new(BufferCache::new());

/// A pinned reference to a cached block. `BLOCK_SIZE` bytes, valid until
/// dropped.
pub struct BufferRef {
    idx: usize,
}

impl BufferRef {
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the slot is pinned by our refcount for the life of this ref.
        let guard = CACHE.lock();
        let ptr = guard.data(self.idx).as_ptr();
        unsafe { core::slice::from_raw_parts(ptr, BLOCK_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let guard = CACHE.lock();
        let ptr = guard.data_mut(self.idx).as_mut_ptr();
        unsafe { core::slice::from_raw_parts_mut(ptr, BLOCK_SIZE) }
    }

    pub fn mark_dirty(&mut self) {
        CACHE.lock().heads[self.idx].dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        CACHE.lock().heads[self.idx].dirty
    }

    /// Write this buffer back to `device` if dirty.
    pub fn bwrite(&mut self, device: &mut dyn BlockDevice) -> Result<(), BufferError> {
        let mut guard = CACHE.lock();
        if !guard.heads[self.idx].dirty {
            return Ok(());
        }
        let offset = guard.heads[self.idx].block * BLOCK_SIZE as u64;
        let data: [u8; BLOCK_SIZE] = {
            let mut tmp = [0u8; BLOCK_SIZE];
            tmp.copy_from_slice(guard.data(self.idx));
            tmp
        };
        drop(guard);
        device.write_at(offset, &data)?;
        CACHE.lock().heads[self.idx].dirty = false;
        Ok(())
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        CACHE.lock().heads[self.idx].refcount += 1;
        Self { idx: self.idx }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        let mut guard = CACHE.lock();
        let h = &mut guard.heads[self.idx];
        if h.refcount > 0 {
            h.refcount -= 1;
        }
    }
}

/// Get (allocating if necessary) the cache slot for `(dev_id, block)`
/// without performing any I/O. The buffer's contents are unspecified
/// until either populated by `bread` or explicitly written and marked
/// up to date by the caller.
pub fn getblk(dev_id: u32, block: u64) -> Result<BufferRef, BufferError> {
    let mut guard = CACHE.lock();
    let idx = match guard.find(dev_id, block) {
        Some(idx) => idx,
        None => guard.alloc_slot(dev_id, block)?,
    };
    guard.heads[idx].refcount += 1;
    Ok(BufferRef { idx })
}

/// Get the block, reading it from `device` if it is not already cached.
pub fn bread(dev_id: u32, block: u64, device: &mut dyn BlockDevice) -> Result<BufferRef, BufferError> {
    let buf = getblk(dev_id, block)?;
    let needs_read = !CACHE.lock().heads[buf.idx].uptodate;
    if needs_read {
        let offset = block * BLOCK_SIZE as u64;
        let mut tmp = [0u8; BLOCK_SIZE];
        device.read_at(offset, &mut tmp)?;
        let mut guard = CACHE.lock();
        guard.data_mut(buf.idx).copy_from_slice(&tmp);
        guard.heads[buf.idx].uptodate = true;
    }
    Ok(buf)
}

/// Flush every dirty buffer belonging to `dev_id`.
pub fn sync_all(dev_id: u32, device: &mut dyn BlockDevice) -> Result<(), BufferError> {
    let dirty_blocks: [u64; MAX_BUFFERS] = {
        let guard = CACHE.lock();
        let mut blocks = [0u64; MAX_BUFFERS];
        for (i, h) in guard.heads.iter().enumerate() {
            if h.in_use && h.dev_id == dev_id && h.dirty {
                blocks[i] = h.block | (1 << 63);
            }
        }
        blocks
    };

    for (i, marker) in dirty_blocks.iter().enumerate() {
        if marker & (1 << 63) == 0 {
            continue;
        }
        let block = marker & !(1 << 63);
        let offset = block * BLOCK_SIZE as u64;
        let data: [u8; BLOCK_SIZE] = {
            let guard = CACHE.lock();
            let mut tmp = [0u8; BLOCK_SIZE];
            tmp.copy_from_slice(guard.data(i));
            tmp
        };
        device.write_at(offset, &data)?;
        CACHE.lock().heads[i].dirty = false;
    }
    Ok(())
}

/// Reclaim callback registered with the page allocator: frees clean,
/// unreferenced buffers under memory pressure. Returns whether any page
/// was actually freed.
pub fn try_reclaim() -> bool {
    let mut guard = CACHE.lock();
    if let Some(idx) = guard
        .heads
        .iter()
        .position(|h| h.in_use && h.refcount == 0 && !h.dirty)
    {
        guard.heads[idx] = BufferHead::empty();
        true
    } else {
        false
    }
}

const _: () = assert!(BLOCK_SIZE <= PAGE_SIZE_4KB_USIZE);
const _: () = assert!(PAGE_SIZE_4KB_USIZE % BLOCK_SIZE == 0);
