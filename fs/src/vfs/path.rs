//! Path resolution (`namei`): turns an absolute byte-string path into a
//! concrete `(filesystem, inode)` pair.
//!
//! Resolution walks one component at a time, consulting the dentry cache
//! before falling through to `FileSystem::lookup`, and re-checks the mount
//! table after every component so a path that crosses into a different
//! mounted filesystem partway through (e.g. `/mnt/usb/file` where `/mnt/usb`
//! is its own mount) lands on the right `FileSystem` impl. Symlinks are
//! followed up to `MAX_SYMLINK_HOPS` to bound loops.

use crate::dcache::{self, DentryRef};
use crate::vfs::mount::resolve_mount;
use crate::vfs::traits::{FileSystem, FileType, InodeId, VfsError, VfsResult};
use crate::{MAX_NAME_LEN, MAX_PATH_LEN};

const MAX_SYMLINK_HOPS: u32 = 8;
const MAX_DEPTH: usize = 32;

/// The result of resolving a path: the filesystem that owns the target
/// inode and the inode itself.
pub struct ResolvedPath {
    pub fs: &'static dyn FileSystem,
    pub inode: InodeId,
}

/// Resolve an absolute path to its final `(filesystem, inode)`.
pub fn resolve_path(path: &[u8]) -> VfsResult<ResolvedPath> {
    resolve_internal(path, 0)
}

/// Resolve the parent directory of `path` and return it alongside the
/// final path component (the entry name within that directory).
///
/// Used by operations that create or remove a single name (`create`,
/// `unlink`, `mkdir`): the parent must already exist, but the final
/// component need not.
pub fn resolve_parent(path: &[u8]) -> VfsResult<(ResolvedPath, &[u8])> {
    if path.is_empty() || path[0] != b'/' {
        return Err(VfsError::InvalidPath);
    }

    let mut last_slash = 0usize;
    for (i, &b) in path.iter().enumerate() {
        if b == b'/' {
            last_slash = i;
        }
    }

    let name = &path[last_slash + 1..];
    if name.is_empty() || name == b"." || name == b".." {
        return Err(VfsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VfsError::NameTooLong);
    }

    let parent_path: &[u8] = if last_slash == 0 { b"/" } else { &path[..last_slash] };
    let parent = resolve_path(parent_path)?;

    let stat = parent.fs.stat(parent.inode)?;
    if stat.file_type != FileType::Directory {
        return Err(VfsError::NotDirectory);
    }

    Ok((parent, name))
}

fn resolve_internal(path: &[u8], hops: u32) -> VfsResult<ResolvedPath> {
    if path.is_empty() || path[0] != b'/' {
        return Err(VfsError::InvalidPath);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(VfsError::NameTooLong);
    }

    let (root_fs, _) = resolve_mount(b"/")?;

    // `dentries[depth]` is the directory we are currently inside;
    // `dentries[0]` is always the root of `root_fs`.
    let mut dentries: [Option<DentryRef>; MAX_DEPTH] = core::array::from_fn(|_| None);
    dentries[0] = Some(dcache::root_dentry(root_fs));
    let mut depth = 0usize;

    let mut abs_buf = [0u8; MAX_PATH_LEN];
    abs_buf[0] = b'/';
    let mut abs_len = 1usize;

    for component in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
        if component == b"." {
            continue;
        }

        if component == b".." {
            if depth > 0 {
                dentries[depth] = None;
                depth -= 1;
                // Recompute abs_len by trimming back to the previous slash.
                while abs_len > 1 && abs_buf[abs_len - 1] != b'/' {
                    abs_len -= 1;
                }
                if abs_len > 1 {
                    abs_len -= 1;
                }
            }
            continue;
        }

        if component.len() > MAX_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }
        if depth + 1 >= MAX_DEPTH {
            return Err(VfsError::NameTooLong);
        }

        let parent_ref = dentries[depth].as_ref().expect("current dir always set");
        let parent_fs = parent_ref.fs().expect("root always bound");
        let parent_inode = parent_ref.inode().expect("root always bound");

        let child_ref = dcache::lookup_one(parent_ref, parent_fs, parent_inode, component)?;

        // Extend the running absolute path, then see whether this exact
        // prefix is itself a mount point.
        let mut new_abs_len = abs_len;
        if new_abs_len > 1 {
            abs_buf[new_abs_len] = b'/';
            new_abs_len += 1;
        }
        abs_buf[new_abs_len..new_abs_len + component.len()].copy_from_slice(component);
        new_abs_len += component.len();

        let (mut child_fs, mut child_inode) = (parent_fs, child_ref.inode().unwrap());
        let mut effective_ref = child_ref;

        if let Ok((mounted_fs, _relative)) = resolve_mount(&abs_buf[..new_abs_len]) {
            if !core::ptr::eq(
                mounted_fs as *const dyn FileSystem as *const (),
                parent_fs as *const dyn FileSystem as *const (),
            ) {
                child_fs = mounted_fs;
                child_inode = mounted_fs.root_inode();
                effective_ref = dcache::root_dentry(mounted_fs);
            }
        }

        let stat = child_fs.stat(child_inode)?;
        if stat.file_type == FileType::Symlink {
            if hops + 1 > MAX_SYMLINK_HOPS {
                return Err(VfsError::TooManyLinks);
            }

            let mut link_buf = [0u8; MAX_PATH_LEN];
            let link_len = child_fs.readlink(child_inode, &mut link_buf)?;
            let target = &link_buf[..link_len];

            // Remaining unresolved suffix of the original path.
            let consumed = component.as_ptr() as usize + component.len() - path.as_ptr() as usize;
            let remainder = &path[consumed..];

            let mut combined = [0u8; MAX_PATH_LEN * 2];
            let mut clen = 0usize;

            if !target.is_empty() && target[0] == b'/' {
                combined[..target.len()].copy_from_slice(target);
                clen = target.len();
            } else {
                // Relative target: resolve against the current directory.
                combined[..abs_len].copy_from_slice(&abs_buf[..abs_len]);
                clen = abs_len;
                if clen > 1 {
                    combined[clen] = b'/';
                    clen += 1;
                }
                combined[clen..clen + target.len()].copy_from_slice(target);
                clen += target.len();
            }

            if !remainder.is_empty() {
                combined[clen] = b'/';
                clen += 1;
                combined[clen..clen + remainder.len()].copy_from_slice(remainder);
                clen += remainder.len();
            }

            return resolve_internal(&combined[..clen], hops + 1);
        }

        depth += 1;
        dentries[depth] = Some(effective_ref);
        abs_len = new_abs_len;
    }

    let final_ref = dentries[depth].as_ref().unwrap();
    Ok(ResolvedPath {
        fs: final_ref.fs().unwrap(),
        inode: final_ref.inode().unwrap(),
    })
}
