//! Builtin filesystem bring-up.
//!
//! Mounts the root filesystem (ext2 over virtio-blk when available, a ramfs
//! otherwise), plus a `/tmp` ramfs and a `/dev` devfs. Idempotent: a second
//! call is a no-op.

use slopos_lib::InitFlag;

use crate::devfs::DevFs;
use crate::ext2_vfs::{EXT2_VFS_STATIC, ext2_vfs_is_initialized};
use crate::ramfs::RamFs;
use crate::vfs::mount::mount;
use crate::vfs::ops::vfs_mkdir;
use crate::vfs::traits::VfsResult;

static ROOT_RAMFS: RamFs = RamFs::new_const();
static TMP_RAMFS: RamFs = RamFs::new_const();
static DEV_DEVFS: DevFs = DevFs::new();
static VFS_INIT: InitFlag = InitFlag::new();

pub fn vfs_init_builtin_filesystems() -> VfsResult<()> {
    if !VFS_INIT.init_once() {
        return Ok(());
    }

    if ext2_vfs_is_initialized() {
        mount(b"/", &EXT2_VFS_STATIC, 0)?;
    } else {
        mount(b"/", &ROOT_RAMFS, 0)?;
    }

    let _ = vfs_mkdir(b"/tmp");
    mount(b"/tmp", &TMP_RAMFS, 0)?;

    let _ = vfs_mkdir(b"/dev");
    mount(b"/dev", &DEV_DEVFS, 0)?;

    Ok(())
}

pub fn vfs_is_initialized() -> bool {
    VFS_INIT.is_set()
}
