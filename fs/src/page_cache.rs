//! Page cache: caches whole pages of file content, keyed by
//! `(filesystem, inode, page-aligned offset)`.
//!
//! Each cached page is filled by calling `FileSystem::read` for a full
//! page's worth of bytes (`readpage`) and written back with
//! `FileSystem::write` (`writepage`) — there is no page-granularity method
//! on `FileSystem` itself, so the page cache adapts the whole-file
//! interface rather than requiring every filesystem to grow one.
//!
//! This module also owns the *file mapping* registry that bridges `mmap`
//! across the crate boundary: `slopos-mm` cannot depend on `slopos-fs`, so
//! a `VmaNode` only ever carries an opaque `file_map_id`. The mapping from
//! that id back to `(FileSystem, InodeId, shared)` lives here, and the
//! page-fault path (in `boot`, which depends on both crates) calls
//! [`fault_in_page`] to resolve a fault to a physical page.

use slopos_lib::IrqMutex;
use slopos_mm::mm_constants::PAGE_SIZE_4KB_USIZE;
use slopos_mm::page_alloc::OwnedPageFrame;

use crate::vfs::traits::{FileSystem, InodeId, VfsError, VfsResult};

const MAX_CACHE_PAGES: usize = 256;
const MAX_MAPPINGS: usize = 64;

struct CachedPage {
    in_use: bool,
    fs: Option<&'static dyn FileSystem>,
    inode: InodeId,
    page_offset: u64,
    frame: Option<OwnedPageFrame>,
    dirty: bool,
    refcount: u32,
}

impl CachedPage {
    const fn empty() -> Self {
        Self {
            in_use: false,
            fs: None,
            inode: 0,
            page_offset: 0,
            frame: None,
            dirty: false,
            refcount: 0,
        }
    }

    fn matches(&self, fs: &'static dyn FileSystem, inode: InodeId, page_offset: u64) -> bool {
        self.in_use
            && self.inode == inode
            && self.page_offset == page_offset
            && self
                .fs
                .map(|f| core::ptr::eq(f as *const dyn FileSystem as *const (), fs as *const dyn FileSystem as *const ()))
                .unwrap_or(false)
    }
}

struct PageCache {
    pages: [CachedPage; MAX_CACHE_PAGES],
}

impl PageCache {
    const fn new() -> Self {
        Self {
            pages: [const { CachedPage::empty() }; MAX_CACHE_PAGES],
        }
    }

    fn find(&self, fs: &'static dyn FileSystem, inode: InodeId, page_offset: u64) -> Option<usize> {
        self.pages.iter().position(|p| p.matches(fs, inode, page_offset))
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.pages.iter().position(|p| !p.in_use) {
            return Some(idx);
        }
        self.pages
            .iter()
            .position(|p| p.in_use && p.refcount == 0 && !p.dirty)
    }
}

static CACHE: IrqMutex<PageCache> = IrqMutex::new(PageCache::new());

fn page_align(offset: u64) -> u64 {
    offset & !(PAGE_SIZE_4KB_USIZE as u64 - 1)
}

/// A pinned reference to one cached page of file content.
pub struct PageRef {
    idx: usize,
}

impl PageRef {
    pub fn phys_addr(&self) -> slopos_abi::addr::PhysAddr {
        CACHE.lock().pages[self.idx]
            .frame
            .as_ref()
            .expect("cached page always has a backing frame")
            .phys_addr()
    }

    pub fn mark_dirty(&mut self) {
        CACHE.lock().pages[self.idx].dirty = true;
    }

    fn data_ptr(&self) -> *mut u8 {
        use slopos_mm::hhdm::PhysAddrHhdm;
        self.phys_addr().to_virt().as_mut_ptr()
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        CACHE.lock().pages[self.idx].refcount += 1;
        Self { idx: self.idx }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let mut guard = CACHE.lock();
        let p = &mut guard.pages[self.idx];
        if p.refcount > 0 {
            p.refcount -= 1;
        }
    }
}

/// Fetch (reading through on a miss) the page of `fs`/`inode` covering
/// `offset`. This is the `readpage` path.
pub fn get_page(fs: &'static dyn FileSystem, inode: InodeId, offset: u64) -> VfsResult<PageRef> {
    let page_offset = page_align(offset);

    {
        let mut guard = CACHE.lock();
        if let Some(idx) = guard.find(fs, inode, page_offset) {
            guard.pages[idx].refcount += 1;
            return Ok(PageRef { idx });
        }
    }

    let frame = OwnedPageFrame::alloc_zeroed().ok_or(VfsError::NoSpace)?;
    let buf: &mut [u8] =
        unsafe { core::slice::from_raw_parts_mut(frame.as_mut_ptr(), PAGE_SIZE_4KB_USIZE) };
    let _read = fs.read(inode, page_offset, buf)?;

    let mut guard = CACHE.lock();
    // Someone may have raced us and filled this page already.
    if let Some(idx) = guard.find(fs, inode, page_offset) {
        guard.pages[idx].refcount += 1;
        return Ok(PageRef { idx });
    }
    let idx = guard.alloc_slot().ok_or(VfsError::NoSpace)?;
    guard.pages[idx] = CachedPage {
        in_use: true,
        fs: Some(fs),
        inode,
        page_offset,
        frame: Some(frame),
        dirty: false,
        refcount: 1,
    };
    Ok(PageRef { idx })
}

/// Read through the cache, the `generic_file_read` path shared with mmap:
/// every byte returned was faulted in (or already resident) as a whole
/// cache page, so a concurrent mmap of the same file sees the same data.
pub fn cached_read(
    fs: &'static dyn FileSystem,
    inode: InodeId,
    offset: u64,
    buf: &mut [u8],
) -> VfsResult<usize> {
    let size = fs.stat(inode)?.size;
    if offset >= size || buf.is_empty() {
        return Ok(0);
    }
    let want = buf.len().min((size - offset) as usize);

    let mut done = 0usize;
    while done < want {
        let pos = offset + done as u64;
        let page_off = page_align(pos);
        let in_page = (pos - page_off) as usize;
        let page = get_page(fs, inode, pos)?;
        let chunk = (PAGE_SIZE_4KB_USIZE - in_page).min(want - done);
        let src = unsafe { core::slice::from_raw_parts(page.data_ptr(), PAGE_SIZE_4KB_USIZE) };
        buf[done..done + chunk].copy_from_slice(&src[in_page..in_page + chunk]);
        done += chunk;
    }
    Ok(done)
}

/// Write through the cache, the `generic_file_write` path shared with mmap:
/// dirties the cache pages covering the write instead of touching the
/// filesystem directly, so a subsequent mmap read (or `writeback`) observes
/// it. For a shared mapping the cache is flushed immediately since there is
/// no background writeback thread to catch a dirty page later; callers that
/// want that still call `writeback_inode` explicitly (`fsync`, eviction).
pub fn cached_write(
    fs: &'static dyn FileSystem,
    inode: InodeId,
    offset: u64,
    buf: &[u8],
) -> VfsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        let page_off = page_align(pos);
        let in_page = (pos - page_off) as usize;
        let mut page = get_page(fs, inode, pos)?;
        let chunk = (PAGE_SIZE_4KB_USIZE - in_page).min(buf.len() - done);
        let dst = unsafe { core::slice::from_raw_parts_mut(page.data_ptr(), PAGE_SIZE_4KB_USIZE) };
        dst[in_page..in_page + chunk].copy_from_slice(&buf[done..done + chunk]);
        page.mark_dirty();
        done += chunk;
    }

    // No background flusher: push the new bytes out now so a direct
    // `FileSystem::read` (bypassing the cache) or a later remount sees them.
    writeback_inode(fs, inode);
    Ok(done)
}

/// Write a dirty page back through `FileSystem::write` (the `writepage`
/// path). No-op if the page is clean.
pub fn writeback(page: &mut PageRef) -> VfsResult<()> {
    let mut guard = CACHE.lock();
    let p = &mut guard.pages[page.idx];
    if !p.dirty {
        return Ok(());
    }
    let fs = p.fs.expect("page in cache always has an owning fs");
    let inode = p.inode;
    let page_offset = p.page_offset;
    let frame = p.frame.as_ref().expect("cached page always has a backing frame");
    let buf: &[u8] = unsafe { core::slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE_4KB_USIZE) };
    drop(guard);

    fs.write(inode, page_offset, buf)?;

    let mut guard = CACHE.lock();
    if let Some(idx) = guard.find(fs, inode, page_offset) {
        guard.pages[idx].dirty = false;
    }
    Ok(())
}

/// Write back every dirty cached page belonging to `fs`/`inode`. Called
/// from `cached_write` (no background flusher) and from an explicit
/// `fsync`/sync path.
pub fn writeback_inode(fs: &'static dyn FileSystem, inode: InodeId) {
    loop {
        let idx = {
            let guard = CACHE.lock();
            guard
                .pages
                .iter()
                .position(|p| p.matches(fs, inode, p.page_offset) && p.dirty)
        };
        let Some(idx) = idx else {
            return;
        };
        {
            let mut guard = CACHE.lock();
            guard.pages[idx].refcount += 1;
        }
        let mut page = PageRef { idx };
        let _ = writeback(&mut page);
    }
}

/// Write back every dirty page in the cache, regardless of owner. Called
/// from the `sync` syscall.
pub fn writeback_all() {
    loop {
        let idx = {
            let guard = CACHE.lock();
            guard.pages.iter().position(|p| p.in_use && p.dirty)
        };
        let Some(idx) = idx else {
            return;
        };
        {
            let mut guard = CACHE.lock();
            guard.pages[idx].refcount += 1;
        }
        let mut page = PageRef { idx };
        let _ = writeback(&mut page);
    }
}

/// Drop every cached page belonging to `fs`/`inode` past `new_size`
/// (called on truncate).
pub fn invalidate_inode(fs: &'static dyn FileSystem, inode: InodeId, new_size: u64) {
    let mut guard = CACHE.lock();
    let cutoff = page_align(new_size);
    for p in guard.pages.iter_mut() {
        if p.matches(fs, inode, p.page_offset) && p.page_offset >= cutoff {
            *p = CachedPage::empty();
        }
    }
}

/// Reclaim callback registered with the page allocator.
pub fn try_reclaim() -> bool {
    let mut guard = CACHE.lock();
    if let Some(idx) = guard
        .pages
        .iter()
        .position(|p| p.in_use && p.refcount == 0 && !p.dirty)
    {
        guard.pages[idx] = CachedPage::empty();
        true
    } else {
        false
    }
}

// --- File mapping registry: the mmap <-> page cache bridge -----------------

#[derive(Clone, Copy)]
struct FileMapping {
    in_use: bool,
    fs: Option<&'static dyn FileSystem>,
    inode: InodeId,
    shared: bool,
}

static MAPPINGS: IrqMutex<[FileMapping; MAX_MAPPINGS]> = IrqMutex::new(
    [FileMapping {
        in_use: false,
        fs: None,
        inode: 0,
        shared: false,
    }; MAX_MAPPINGS],
);

/// Register a file-backed mapping and return the opaque id `slopos-mm`
/// stores on the owning `VmaNode`.
pub fn register_mapping(fs: &'static dyn FileSystem, inode: InodeId, shared: bool) -> Option<i32> {
    let mut guard = MAPPINGS.lock();
    let idx = guard.iter().position(|m| !m.in_use)?;
    guard[idx] = FileMapping {
        in_use: true,
        fs: Some(fs),
        inode,
        shared,
    };
    Some(idx as i32)
}

/// Release a file mapping id (called from `munmap` once the last VMA
/// referencing it is torn down).
pub fn unregister_mapping(file_map_id: i32) {
    if file_map_id < 0 {
        return;
    }
    let mut guard = MAPPINGS.lock();
    if let Some(slot) = guard.get_mut(file_map_id as usize) {
        *slot = FileMapping {
            in_use: false,
            fs: None,
            inode: 0,
            shared: false,
        };
    }
}

pub struct MappingInfo {
    pub fs: &'static dyn FileSystem,
    pub inode: InodeId,
    pub shared: bool,
}

pub fn mapping_info(file_map_id: i32) -> Option<MappingInfo> {
    if file_map_id < 0 {
        return None;
    }
    let guard = MAPPINGS.lock();
    let m = guard.get(file_map_id as usize)?;
    if !m.in_use {
        return None;
    }
    Some(MappingInfo {
        fs: m.fs?,
        inode: m.inode,
        shared: m.shared,
    })
}

/// Resolve a page fault on a file-backed VMA: get (reading through on a
/// miss) the cache page covering `file_offset` for `file_map_id`.
///
/// For a private mapping the caller maps the returned page read-only and
/// COW; the existing copy-on-write fault handler takes over from there on
/// the first write. For a shared mapping the caller maps it read-write and
/// every write is flushed immediately via [`writeback`], since there is no
/// background flusher to catch a dirty PTE bit later.
pub fn fault_in_page(file_map_id: i32, file_offset: u64) -> VfsResult<PageRef> {
    let info = mapping_info(file_map_id).ok_or(VfsError::InvalidArgument)?;
    get_page(info.fs, info.inode, file_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_down() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(4095), 0);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(4097), 4096);
    }
}
