use core::ffi::c_int;

use slopos_abi::syscall::{MAP_ANONYMOUS, MAP_SHARED};
use slopos_fs::fileio::file_fs_inode_for_fd;
use slopos_fs::page_cache::{register_mapping, unregister_mapping};

define_syscall!(syscall_mmap(ctx, args) requires(let process_id) {
    let addr = args.arg0;
    let length = args.arg1;
    let prot = args.arg2;
    let flags = args.arg3;
    let fd = args.arg4 as i64;
    let offset = args.arg5;

    let result = if flags & MAP_ANONYMOUS != 0 || fd < 0 {
        slopos_mm::process_vm::process_vm_mmap_anon(process_id, addr, length, prot, flags)
    } else {
        mmap_file_backed(process_id, addr, length, prot, flags, fd as c_int, offset)
    };

    ctx.from_nonzero(result)
});

define_syscall!(syscall_munmap(ctx, args) requires(let process_id) {
    let addr = args.arg0;
    let length = args.arg1;
    let rc = slopos_mm::process_vm::process_vm_munmap(process_id, addr, length, release_file_mapping);
    ctx.from_rc(rc)
});

define_syscall!(syscall_mprotect(ctx, args) requires(let process_id) {
    let addr = args.arg0;
    let length = args.arg1;
    let prot = args.arg2;
    let rc = slopos_mm::process_vm::process_vm_mprotect(process_id, addr, length, prot);
    ctx.from_rc(rc)
});

/// Resolve `fd` to its backing `(FileSystem, InodeId)`, register it with the
/// page cache's file-mapping table, and hand the resulting opaque id to
/// `slopos-mm`. Rolls the registration back if the mmap itself fails.
fn mmap_file_backed(
    process_id: u32,
    addr: u64,
    length: u64,
    prot: u64,
    flags: u64,
    fd: c_int,
    offset: u64,
) -> u64 {
    let Some((fs, inode, _size)) = file_fs_inode_for_fd(process_id, fd) else {
        return 0;
    };

    let shared = flags & MAP_SHARED != 0;
    let Some(file_map_id) = register_mapping(fs, inode, shared) else {
        return 0;
    };

    let mapped = slopos_mm::process_vm::process_vm_mmap_file(
        process_id, addr, length, prot, flags, file_map_id, offset,
    );
    if mapped == 0 {
        unregister_mapping(file_map_id);
    }
    mapped
}

fn release_file_mapping(file_map_id: i32) {
    unregister_mapping(file_map_id);
}
