//! Dentry cache: name-to-inode bindings layered over each filesystem's own
//! inode space.
//!
//! Mirrors Linux's dcache in miniature: a dentry binds a `(parent, name)`
//! pair to an inode (or to nothing, for a cached negative lookup). Dentries
//! are refcounted; a refcount of zero makes an entry eligible for LRU
//! reclaim. There is no separate inode cache here — `(fs, inode)` is already
//! a stable identity handed out by the owning `FileSystem` impl, so the
//! dentry *is* the cache entry for both name resolution and the handful of
//! places (page cache, mmap) that need to key off an inode identity.
//!
//! Storage is a fixed slab, scanned linearly, in keeping with this tree's
//! existing fixed-capacity tables (`MountTable`, `FileioState`).

use slopos_lib::IrqMutex;

use crate::vfs::traits::{FileSystem, InodeId};
use crate::MAX_NAME_LEN;

const MAX_DENTRIES: usize = 512;
const NO_PARENT: i32 = -1;
const ROOT_DENTRY: i32 = 0;

#[derive(Clone, Copy)]
struct Dentry {
    in_use: bool,
    name: [u8; MAX_NAME_LEN],
    name_len: u8,
    parent: i32,
    fs: Option<&'static dyn FileSystem>,
    /// `None` for a negative dentry: the name is cached as "does not exist".
    inode: Option<InodeId>,
    refcount: u32,
}

impl Dentry {
    const fn empty() -> Self {
        Self {
            in_use: false,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
            parent: NO_PARENT,
            fs: None,
            inode: None,
            refcount: 0,
        }
    }

    fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

struct DentryCache {
    slots: [Dentry; MAX_DENTRIES],
}

impl DentryCache {
    const fn new() -> Self {
        Self {
            slots: [Dentry::empty(); MAX_DENTRIES],
        }
    }

    fn find_child(&self, parent: i32, fs: &'static dyn FileSystem, name: &[u8]) -> Option<usize> {
        for (idx, d) in self.slots.iter().enumerate() {
            if d.in_use
                && d.parent == parent
                && core::ptr::eq(d.fs.unwrap() as *const dyn FileSystem as *const (), fs as *const dyn FileSystem as *const ())
                && d.name_bytes() == name
            {
                return Some(idx);
            }
        }
        None
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        // Prefer an unused slot; otherwise LRU-reclaim the first refcount-zero entry.
        if let Some(idx) = self.slots.iter().position(|d| !d.in_use) {
            return Some(idx);
        }
        self.slots
            .iter()
            .position(|d| d.in_use && d.refcount == 0 && d.parent != NO_PARENT)
    }

    fn insert(
        &mut self,
        parent: i32,
        fs: &'static dyn FileSystem,
        name: &[u8],
        inode: Option<InodeId>,
    ) -> Option<usize> {
        if let Some(idx) = self.find_child(parent, fs, name) {
            self.slots[idx].inode = inode;
            return Some(idx);
        }
        let idx = self.alloc_slot()?;
        let len = name.len().min(MAX_NAME_LEN);
        let mut buf = [0u8; MAX_NAME_LEN];
        buf[..len].copy_from_slice(&name[..len]);
        self.slots[idx] = Dentry {
            in_use: true,
            name: buf,
            name_len: len as u8,
            parent,
            fs: Some(fs),
            inode,
            refcount: 0,
        };
        Some(idx)
    }
}

static DCACHE: IrqMutex<DentryCache> = IrqMutex::new(DentryCache::new());

/// A reference-counted handle into the dentry cache.
///
/// Dropping the handle releases the reference; it does not eagerly free the
/// slot (reclaim happens lazily from `alloc_slot` under memory pressure, as
/// in `vfs::traits`'s design note on LRU-reclaimed dentries).
pub struct DentryRef {
    idx: i32,
}

impl DentryRef {
    pub fn is_negative(&self) -> bool {
        if self.idx < 0 {
            return true;
        }
        DCACHE.lock().slots[self.idx as usize].inode.is_none()
    }

    pub fn fs(&self) -> Option<&'static dyn FileSystem> {
        if self.idx < 0 {
            return None;
        }
        DCACHE.lock().slots[self.idx as usize].fs
    }

    pub fn inode(&self) -> Option<InodeId> {
        if self.idx < 0 {
            return None;
        }
        DCACHE.lock().slots[self.idx as usize].inode
    }
}

impl Clone for DentryRef {
    fn clone(&self) -> Self {
        if self.idx >= 0 {
            DCACHE.lock().slots[self.idx as usize].refcount += 1;
        }
        Self { idx: self.idx }
    }
}

impl Drop for DentryRef {
    fn drop(&mut self) {
        if self.idx >= 0 {
            let mut guard = DCACHE.lock();
            let d = &mut guard.slots[self.idx as usize];
            if d.refcount > 0 {
                d.refcount -= 1;
            }
        }
    }
}

/// Look up (and cache) a single path component under `parent`.
///
/// On a cache miss, calls the filesystem's `lookup`; a `NotFound` result is
/// itself cached as a negative dentry so repeated misses (e.g. `access()`
/// probes) don't re-enter the filesystem.
pub fn lookup_one(
    parent_ref: &DentryRef,
    fs: &'static dyn FileSystem,
    parent_inode: InodeId,
    name: &[u8],
) -> Result<DentryRef, crate::vfs::traits::VfsError> {
    use crate::vfs::traits::VfsError;

    let parent_idx = parent_ref.idx;

    {
        let guard = DCACHE.lock();
        if let Some(idx) = guard.find_child(parent_idx, fs, name) {
            let inode = guard.slots[idx].inode;
            drop(guard);
            return bump_and_wrap(idx, inode);
        }
    }

    match fs.lookup(parent_inode, name) {
        Ok(inode) => {
            let mut guard = DCACHE.lock();
            let idx = guard
                .insert(parent_idx, fs, name, Some(inode))
                .ok_or(VfsError::NoSpace)?;
            drop(guard);
            bump_and_wrap(idx, Some(inode))
        }
        Err(VfsError::NotFound) => {
            let mut guard = DCACHE.lock();
            let idx = guard
                .insert(parent_idx, fs, name, None)
                .ok_or(VfsError::NoSpace)?;
            drop(guard);
            Err(VfsError::NotFound)
        }
        Err(e) => Err(e),
    }
}

fn bump_and_wrap(
    idx: usize,
    inode: Option<InodeId>,
) -> Result<DentryRef, crate::vfs::traits::VfsError> {
    use crate::vfs::traits::VfsError;
    if inode.is_none() {
        return Err(VfsError::NotFound);
    }
    DCACHE.lock().slots[idx].refcount += 1;
    Ok(DentryRef { idx: idx as i32 })
}

/// Bind (and return a reference to) the root dentry of a freshly mounted
/// filesystem. Idempotent per `(fs, root_inode)` pair.
pub fn root_dentry(fs: &'static dyn FileSystem) -> DentryRef {
    let root_inode = fs.root_inode();
    let mut guard = DCACHE.lock();
    if let Some(idx) = guard.find_child(NO_PARENT, fs, b"") {
        guard.slots[idx].inode = Some(root_inode);
        guard.slots[idx].refcount += 1;
        return DentryRef { idx: idx as i32 };
    }
    let idx = guard
        .insert(NO_PARENT, fs, b"", Some(root_inode))
        .expect("dentry cache exhausted while mounting root");
    guard.slots[idx].refcount += 1;
    let _ = ROOT_DENTRY;
    DentryRef { idx: idx as i32 }
}

/// Invalidate every cached dentry belonging to `fs` (used on unmount).
pub fn invalidate_fs(fs: &'static dyn FileSystem) -> usize {
    let mut guard = DCACHE.lock();
    let mut count = 0;
    for d in guard.slots.iter_mut() {
        if d.in_use
            && d.fs
                .map(|f| core::ptr::eq(f as *const dyn FileSystem as *const (), fs as *const dyn FileSystem as *const ()))
                .unwrap_or(false)
        {
            *d = Dentry::empty();
            count += 1;
        }
    }
    count
}
