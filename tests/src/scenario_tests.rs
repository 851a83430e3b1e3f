//! End-to-end scenario tests.
//!
//! Unlike the per-module suites, these exercise a whole subsystem path the
//! way a real caller would: fork a task and collect its exit status, force a
//! COW fault across a real clone, deliver a signal to a blocked task, fault
//! in a file-backed mapping through the page cache, drain a pipe to EOF, and
//! run the shebang interpreter chain to its depth limit.

use core::ffi::c_char;
use core::ptr;
use core::sync::atomic::Ordering;

use slopos_abi::signal::{SIGUSR1, sig_bit};
use slopos_abi::syscall::{MAP_SHARED, PROT_READ, PROT_WRITE};
use slopos_abi::task::{BlockReason, TaskExitRecord};
use slopos_lib::klog_info;
use slopos_lib::testing::TestResult;

use slopos_core::exec::ExecError;
use slopos_core::sched::task_wait_for;
use slopos_core::sched_tests::SchedFixture;
use slopos_core::syscall::signal::raise_signal_on_task_id;
use slopos_core::task::{
    INVALID_TASK_ID, TASK_FLAG_USER_MODE, TASK_PRIORITY_NORMAL, Task, TaskStatus, task_create,
    task_find_by_id, task_fork, task_get_exit_record, task_set_state, task_set_state_with_reason,
    task_terminate,
};

use slopos_mm::demand::{is_file_backed_fault, map_file_backed_page};
use slopos_mm::hhdm::PhysAddrHhdm;
use slopos_mm::mm_constants::{PAGE_SIZE_4KB, PROCESS_CODE_START_VA};
use slopos_mm::paging::virt_to_phys_in_dir;
use slopos_mm::process_vm::process_vm_mmap_file;
use slopos_mm::test_fixtures::{ProcessVmGuard, map_test_page};

use slopos_fs::vfs::ops::{vfs_mkdir, vfs_open};
use slopos_fs::vfs::traits::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};
use slopos_fs::{MAX_NAME_LEN, file_close_fd, file_pipe_create, file_read_fd, file_write_fd};
use slopos_fs::page_cache::{fault_in_page, register_mapping};
use slopos_fs::{mount, vfs_init_builtin_filesystems};
use slopos_fs::PIPE_EPIPE;

fn spawn_blocked_user_task(name: &[u8]) -> u32 {
    let task_id = task_create(
        name.as_ptr() as *const c_char,
        unsafe { core::mem::transmute(PROCESS_CODE_START_VA as usize) },
        ptr::null_mut(),
        TASK_PRIORITY_NORMAL,
        TASK_FLAG_USER_MODE,
    );
    if task_id != INVALID_TASK_ID {
        task_set_state(task_id, TaskStatus::Blocked);
    }
    task_id
}

/// fork() a user task, terminate the child, and collect its exit record
/// through the same fast path `waitpid(2)` uses.
pub fn test_scenario_fork_exit_wait() -> TestResult {
    let _fixture = SchedFixture::new();

    let parent_id = spawn_blocked_user_task(b"ScenarioForkParent\0");
    if parent_id == INVALID_TASK_ID {
        klog_info!("SCENARIO: fork parent creation failed");
        return TestResult::Fail;
    }

    let parent_ptr = task_find_by_id(parent_id);
    if parent_ptr.is_null() {
        klog_info!("SCENARIO: fork parent lookup failed");
        return TestResult::Fail;
    }

    let child_id = task_fork(parent_ptr);
    if child_id == INVALID_TASK_ID {
        klog_info!("SCENARIO: fork of a blocked user-mode parent failed");
        return TestResult::Fail;
    }
    task_set_state(child_id, TaskStatus::Blocked);

    if task_terminate(child_id) != 0 {
        klog_info!("SCENARIO: child terminate failed");
        return TestResult::Fail;
    }

    let mut record = TaskExitRecord::empty();
    if task_get_exit_record(child_id, &mut record) != 0 {
        klog_info!("SCENARIO: no exit record for terminated child");
        return TestResult::Fail;
    }
    if record.task_id != child_id {
        klog_info!(
            "SCENARIO: exit record task_id mismatch ({} != {})",
            record.task_id,
            child_id
        );
        return TestResult::Fail;
    }

    // A second waiter asking for a task that already exited must not block.
    let _ = task_wait_for(child_id);

    TestResult::Pass
}

/// Clone a process VM with COW, let both parent and child fault on the same
/// shared page, and confirm each ends up with its own private copy.
pub fn test_scenario_cow_clone_diverges() -> TestResult {
    let Some(parent) = ProcessVmGuard::new() else {
        klog_info!("SCENARIO: parent process VM creation failed");
        return TestResult::Fail;
    };

    const TEST_VA: u64 = 0x5000_0000;
    let Some(phys) = map_test_page(parent.page_dir, TEST_VA, 0x07) else {
        klog_info!("SCENARIO: failed to map shared test page");
        return TestResult::Fail;
    };
    if let Some(virt) = phys.to_virt_checked() {
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0xAA, PAGE_SIZE_4KB as usize);
        }
    }

    let Some(child) = parent.clone_cow() else {
        klog_info!("SCENARIO: clone_cow failed");
        return TestResult::Fail;
    };

    if !slopos_mm::paging::paging_is_cow(parent.page_dir, slopos_abi::addr::VirtAddr::new(TEST_VA))
    {
        klog_info!("SCENARIO: parent mapping not marked COW after clone");
        return TestResult::Fail;
    }

    if let Err(e) =
        slopos_mm::cow::handle_cow_fault(parent.page_dir, TEST_VA)
    {
        klog_info!("SCENARIO: parent COW resolution failed: {:?}", e);
        return TestResult::Fail;
    }
    if let Err(e) = slopos_mm::cow::handle_cow_fault(child.page_dir, TEST_VA) {
        klog_info!("SCENARIO: child COW resolution failed: {:?}", e);
        return TestResult::Fail;
    }

    let parent_phys = virt_to_phys_in_dir(parent.page_dir, slopos_abi::addr::VirtAddr::new(TEST_VA));
    let child_phys = virt_to_phys_in_dir(child.page_dir, slopos_abi::addr::VirtAddr::new(TEST_VA));
    if parent_phys.is_null() || child_phys.is_null() {
        klog_info!("SCENARIO: COW resolution left a hole in the mapping");
        return TestResult::Fail;
    }
    if parent_phys.as_u64() == child_phys.as_u64() {
        klog_info!("SCENARIO: parent and child still share the backing frame after COW");
        return TestResult::Fail;
    }

    if let Some(pv) = parent_phys.to_virt_checked() {
        unsafe { *pv.as_mut_ptr::<u8>() = 0xBB };
    }
    if let Some(cv) = child_phys.to_virt_checked() {
        let first_byte = unsafe { *cv.as_mut_ptr::<u8>() };
        if first_byte != 0xAA {
            klog_info!("SCENARIO: child copy corrupted by parent write (got 0x{:x})", first_byte);
            return TestResult::Fail;
        }
    }

    TestResult::Pass
}

/// Block a task, raise SIGUSR1 on it, and confirm it comes back READY with
/// the signal latched pending.
pub fn test_scenario_signal_wakes_paused_task() -> TestResult {
    let _fixture = SchedFixture::new();

    let task_id = task_create(
        b"ScenarioSigTarget\0".as_ptr() as *const c_char,
        unsafe { core::mem::transmute(PROCESS_CODE_START_VA as usize) },
        ptr::null_mut(),
        TASK_PRIORITY_NORMAL,
        TASK_FLAG_USER_MODE,
    );
    if task_id == INVALID_TASK_ID {
        klog_info!("SCENARIO: signal target creation failed");
        return TestResult::Fail;
    }

    if task_set_state_with_reason(task_id, TaskStatus::Blocked, BlockReason::Generic) != 0 {
        klog_info!("SCENARIO: failed to pause signal target");
        return TestResult::Fail;
    }

    let task_ptr: *mut Task = task_find_by_id(task_id);
    if task_ptr.is_null() {
        klog_info!("SCENARIO: signal target lookup failed");
        return TestResult::Fail;
    }

    raise_signal_on_task_id(task_id, SIGUSR1);

    let pending = unsafe { (*task_ptr).signal_pending.load(Ordering::Acquire) };
    if pending & sig_bit(SIGUSR1) == 0 {
        klog_info!("SCENARIO: SIGUSR1 not latched into signal_pending");
        return TestResult::Fail;
    }

    let status = unsafe { (*task_ptr).status() };
    if status == TaskStatus::Blocked {
        klog_info!("SCENARIO: task still blocked after signal delivery");
        return TestResult::Fail;
    }

    TestResult::Pass
}

/// mmap a file-backed region, resolve the fault through the page cache the
/// way `boot`'s page-fault handler does, and check the page's contents match
/// what was written to the file.
pub fn test_scenario_mmap_file_coherency() -> TestResult {
    let _ = vfs_init_builtin_filesystems();

    let Ok(handle) = vfs_open(b"/tmp/scenario_mmap_coherency", true) else {
        klog_info!("SCENARIO: failed to create backing file");
        return TestResult::Fail;
    };
    let content = b"mmap coherency payload";
    if handle.write(0, content).unwrap_or(0) != content.len() {
        klog_info!("SCENARIO: short write to backing file");
        return TestResult::Fail;
    }

    let Some(file_map_id) = register_mapping(handle.fs, handle.inode, true) else {
        klog_info!("SCENARIO: register_mapping failed");
        return TestResult::Fail;
    };

    let Some(guard) = ProcessVmGuard::new() else {
        klog_info!("SCENARIO: process VM creation failed");
        return TestResult::Fail;
    };

    let mapped_addr = process_vm_mmap_file(
        guard.pid,
        0,
        PAGE_SIZE_4KB,
        PROT_READ | PROT_WRITE,
        MAP_SHARED,
        file_map_id,
        0,
    );
    if mapped_addr == 0 {
        klog_info!("SCENARIO: process_vm_mmap_file failed");
        return TestResult::Fail;
    }

    let Some(fault) = is_file_backed_fault(0, guard.pid, mapped_addr) else {
        klog_info!("SCENARIO: mapped address not recognized as file-backed");
        return TestResult::Fail;
    };
    if fault.file_map_id != file_map_id || !fault.shared {
        klog_info!("SCENARIO: file-backed fault metadata mismatch");
        return TestResult::Fail;
    }

    let page = match fault_in_page(fault.file_map_id, fault.file_offset) {
        Ok(p) => p,
        Err(e) => {
            klog_info!("SCENARIO: fault_in_page failed: {:?}", e);
            return TestResult::Fail;
        }
    };
    let phys = page.phys_addr();

    if let Err(e) = map_file_backed_page(guard.page_dir, guard.pid, mapped_addr, phys) {
        klog_info!("SCENARIO: map_file_backed_page failed: {:?}", e);
        return TestResult::Fail;
    }

    let Some(virt) = phys.to_virt_checked() else {
        klog_info!("SCENARIO: backing frame has no HHDM mapping");
        return TestResult::Fail;
    };
    let mapped = unsafe { core::slice::from_raw_parts(virt.as_mut_ptr::<u8>(), content.len()) };
    if mapped != content {
        klog_info!("SCENARIO: mapped page content diverges from file content");
        return TestResult::Fail;
    }

    TestResult::Pass
}

/// Write through a pipe, drain it, and confirm both halves of POSIX pipe
/// semantics: EOF on read once the writer closes, EPIPE on write once the
/// reader closes.
pub fn test_scenario_pipe_eof_and_sigpipe() -> TestResult {
    const PID: u32 = 0xA0F0_0001;
    let mut read_fd = 0;
    let mut write_fd = 0;
    if file_pipe_create(PID, 0, &mut read_fd, &mut write_fd) != 0 {
        klog_info!("SCENARIO: pipe creation failed");
        return TestResult::Fail;
    }

    let message = b"scenario pipe payload";
    let written = file_write_fd(PID, write_fd, message.as_ptr() as *const c_char, message.len());
    if written as usize != message.len() {
        klog_info!("SCENARIO: short pipe write");
        let _ = file_close_fd(PID, read_fd);
        let _ = file_close_fd(PID, write_fd);
        return TestResult::Fail;
    }

    let mut buf = [0u8; 64];
    let read = file_read_fd(PID, read_fd, buf.as_mut_ptr() as *mut c_char, buf.len());
    if read as usize != message.len() || &buf[..read as usize] != message {
        klog_info!("SCENARIO: pipe readback mismatch");
        let _ = file_close_fd(PID, read_fd);
        let _ = file_close_fd(PID, write_fd);
        return TestResult::Fail;
    }

    // Close the writer, then the reader must see EOF (0), not block.
    if file_close_fd(PID, write_fd) != 0 {
        klog_info!("SCENARIO: closing write end failed");
        return TestResult::Fail;
    }
    let eof = file_read_fd(PID, read_fd, buf.as_mut_ptr() as *mut c_char, buf.len());
    if eof != 0 {
        klog_info!("SCENARIO: expected EOF (0) after writer closed, got {}", eof);
        return TestResult::Fail;
    }

    // A second pipe exercises the other half: close the reader, then a write
    // must come back EPIPE instead of blocking or silently succeeding.
    let mut read_fd2 = 0;
    let mut write_fd2 = 0;
    if file_pipe_create(PID, 0, &mut read_fd2, &mut write_fd2) != 0 {
        klog_info!("SCENARIO: second pipe creation failed");
        let _ = file_close_fd(PID, read_fd);
        return TestResult::Fail;
    }
    if file_close_fd(PID, read_fd2) != 0 {
        klog_info!("SCENARIO: closing read end failed");
        return TestResult::Fail;
    }
    let rc = file_write_fd(PID, write_fd2, message.as_ptr() as *const c_char, message.len());
    if rc != PIPE_EPIPE {
        klog_info!("SCENARIO: expected PIPE_EPIPE, got {}", rc);
        let _ = file_close_fd(PID, write_fd2);
        return TestResult::Fail;
    }
    let _ = file_close_fd(PID, read_fd);
    let _ = file_close_fd(PID, write_fd2);

    TestResult::Pass
}

const SCRIPT_ROOT_INODE: InodeId = 1;
const SCRIPT_FILE_INODE: InodeId = 2;
const SCRIPT_FILE_NAME: &[u8] = b"a.sh";
const SCRIPT_CONTENT: &[u8] = b"#!/scenario_script/a.sh\n";

/// A single-file, read-only filesystem whose one file shebangs itself, used
/// to exercise the interpreter-loop guard without needing a real ELF
/// interpreter on hand.
struct SelfShebangFs;

impl FileSystem for SelfShebangFs {
    fn name(&self) -> &'static str {
        "scenario_script_fs"
    }

    fn root_inode(&self) -> InodeId {
        SCRIPT_ROOT_INODE
    }

    fn lookup(&self, parent: InodeId, name: &[u8]) -> VfsResult<InodeId> {
        if parent != SCRIPT_ROOT_INODE {
            return Err(VfsError::NotDirectory);
        }
        if name == b"." || name == b".." {
            return Ok(SCRIPT_ROOT_INODE);
        }
        if name.len() <= MAX_NAME_LEN && name == SCRIPT_FILE_NAME {
            return Ok(SCRIPT_FILE_INODE);
        }
        Err(VfsError::NotFound)
    }

    fn stat(&self, inode: InodeId) -> VfsResult<FileStat> {
        match inode {
            SCRIPT_ROOT_INODE => Ok(FileStat::new_directory(SCRIPT_ROOT_INODE)),
            SCRIPT_FILE_INODE => {
                let mut stat = FileStat::new_file(SCRIPT_FILE_INODE, SCRIPT_CONTENT.len() as u64);
                stat.mode = 0o755;
                Ok(stat)
            }
            _ => Err(VfsError::NotFound),
        }
    }

    fn read(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        if inode != SCRIPT_FILE_INODE {
            return if inode == SCRIPT_ROOT_INODE {
                Err(VfsError::IsDirectory)
            } else {
                Err(VfsError::NotFound)
            };
        }
        let offset = offset as usize;
        if offset >= SCRIPT_CONTENT.len() {
            return Ok(0);
        }
        let n = (SCRIPT_CONTENT.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&SCRIPT_CONTENT[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, _inode: InodeId, _offset: u64, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::ReadOnly)
    }

    fn create(&self, _parent: InodeId, _name: &[u8], _file_type: FileType) -> VfsResult<InodeId> {
        Err(VfsError::ReadOnly)
    }

    fn unlink(&self, _parent: InodeId, _name: &[u8]) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn readdir(
        &self,
        inode: InodeId,
        offset: usize,
        callback: &mut dyn FnMut(&[u8], InodeId, FileType) -> bool,
    ) -> VfsResult<usize> {
        if inode != SCRIPT_ROOT_INODE {
            return Err(VfsError::NotDirectory);
        }
        if offset == 0 && callback(SCRIPT_FILE_NAME, SCRIPT_FILE_INODE, FileType::Regular) {
            return Ok(1);
        }
        Ok(0)
    }
}

unsafe impl Send for SelfShebangFs {}
unsafe impl Sync for SelfShebangFs {}

static SELF_SHEBANG_FS: SelfShebangFs = SelfShebangFs;

/// Mount a filesystem whose only file `#!`s itself and confirm `execve`
/// refuses to follow the interpreter chain past its depth limit instead of
/// looping forever.
pub fn test_scenario_script_exec_interpreter_loop() -> TestResult {
    let _ = vfs_init_builtin_filesystems();
    let _ = vfs_mkdir(b"/scenario_script");
    if mount(b"/scenario_script", &SELF_SHEBANG_FS, 0).is_err() {
        klog_info!("SCENARIO: mounting self-shebang fixture failed");
        return TestResult::Fail;
    }

    let Some(guard) = ProcessVmGuard::new() else {
        klog_info!("SCENARIO: process VM creation failed");
        return TestResult::Fail;
    };

    let mut entry = 0u64;
    let mut stack_ptr = 0u64;
    let result = slopos_core::exec::binfmt::exec_path(
        guard.pid,
        b"/scenario_script/a.sh",
        None,
        None,
        &mut entry,
        &mut stack_ptr,
    );

    match result {
        Err(ExecError::NoExec) => TestResult::Pass,
        Err(other) => {
            klog_info!("SCENARIO: expected NoExec from interpreter loop, got {:?}", other);
            TestResult::Fail
        }
        Ok(()) => {
            klog_info!("SCENARIO: self-shebanging script loaded instead of hitting depth limit");
            TestResult::Fail
        }
    }
}
