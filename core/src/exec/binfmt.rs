//! Binary format registry.
//!
//! `execve` hands a `Binprm` to each registered format in turn until one
//! recognizes the file. A format may rewrite the `Binprm` and recurse back
//! into the registry instead of loading directly -- the `#!` script handler
//! does this to hand off to the named interpreter.

use alloc::vec::Vec;

use slopos_fs::vfs::ops::vfs_open;

use crate::exec::{EXEC_MAX_ARGS, EXEC_MAX_ELF_SIZE, EXEC_MAX_ENVS, EXEC_MAX_PATH, ExecError};

/// Maximum number of `#!` hops a single `execve` will follow before it gives
/// up. Matches the convention other Unix-like binfmt_script implementations
/// use to refuse an interpreter loop (`a.sh` shebanging `a.sh`).
const MAX_INTERP_DEPTH: u32 = 4;

/// First bytes of a shebang line read to sniff the format and parse the
/// interpreter. Shebang lines longer than this are rejected, matching the
/// historical Linux `BINPRM_BUF_SIZE`-derived line-length cap.
const SHEBANG_SNIFF_LEN: usize = 128;

/// The in-flight exec request. Argument and environment strings are owned
/// buffers so a format can rewrite them (prepend an interpreter, drop the
/// original argv[0]) before re-dispatching.
pub struct Binprm {
    pub path: Vec<u8>,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
}

impl Binprm {
    fn new(path: &[u8], argv: Option<&[&[u8]]>, envp: Option<&[&[u8]]>) -> Self {
        Self {
            path: path.to_vec(),
            argv: argv
                .map(|a| a.iter().map(|s| s.to_vec()).collect())
                .unwrap_or_default(),
            envp: envp
                .map(|e| e.iter().map(|s| s.to_vec()).collect())
                .unwrap_or_default(),
        }
    }
}

/// Outcome of offering a `Binprm` to one registered format.
pub enum FormatOutcome {
    /// This format doesn't recognize the file; try the next one.
    NotRecognized,
    /// Recognized and loaded; address space replaced, entry/stack set.
    Loaded,
}

pub trait BinaryFormat: Sync {
    fn try_load(
        &self,
        process_id: u32,
        prm: &mut Binprm,
        depth: u32,
        entry_out: &mut u64,
        stack_ptr_out: &mut u64,
    ) -> Result<FormatOutcome, ExecError>;
}

struct ElfFormat;
struct ScriptFormat;

static REGISTRY: &[&dyn BinaryFormat] = &[&ScriptFormat, &ElfFormat];

/// Entry point for `execve`: build the initial `Binprm` and offer it to the
/// registry. Exposed so the syscall handlers and `spawn_program` share one
/// code path with `do_exec`.
pub fn exec_path(
    process_id: u32,
    path: &[u8],
    argv: Option<&[&[u8]]>,
    envp: Option<&[&[u8]]>,
    entry_out: &mut u64,
    stack_ptr_out: &mut u64,
) -> Result<(), ExecError> {
    if path.is_empty() || path.len() > EXEC_MAX_PATH {
        return Err(ExecError::NameTooLong);
    }
    let mut prm = Binprm::new(path, argv, envp);
    dispatch(process_id, &mut prm, 0, entry_out, stack_ptr_out)
}

fn dispatch(
    process_id: u32,
    prm: &mut Binprm,
    depth: u32,
    entry_out: &mut u64,
    stack_ptr_out: &mut u64,
) -> Result<(), ExecError> {
    for format in REGISTRY {
        match format.try_load(process_id, prm, depth, entry_out, stack_ptr_out)? {
            FormatOutcome::Loaded => return Ok(()),
            FormatOutcome::NotRecognized => continue,
        }
    }
    Err(ExecError::NoExec)
}

fn open_and_stat(path: &[u8]) -> Result<(slopos_fs::vfs::ops::VfsHandle, usize), ExecError> {
    let handle = vfs_open(path, false).map_err(|e| match e {
        slopos_fs::VfsError::NotFound => ExecError::NoEntry,
        slopos_fs::VfsError::IsDirectory => ExecError::NoExec,
        slopos_fs::VfsError::PermissionDenied => ExecError::NoExec,
        _ => ExecError::IoError,
    })?;

    let file_stat = handle
        .fs
        .stat(handle.inode)
        .map_err(|_| ExecError::IoError)?;
    if (file_stat.mode & 0o111) == 0 {
        return Err(ExecError::NoExec);
    }

    let file_size = file_stat.size as usize;
    if file_size == 0 {
        return Err(ExecError::NoExec);
    }

    Ok((handle, file_size))
}

impl BinaryFormat for ElfFormat {
    fn try_load(
        &self,
        process_id: u32,
        prm: &mut Binprm,
        _depth: u32,
        entry_out: &mut u64,
        stack_ptr_out: &mut u64,
    ) -> Result<FormatOutcome, ExecError> {
        let (handle, file_size) = open_and_stat(&prm.path)?;
        if file_size > EXEC_MAX_ELF_SIZE {
            return Err(ExecError::NoExec);
        }

        let mut magic = [0u8; 4];
        let read = handle.read(0, &mut magic).map_err(|_| ExecError::IoError)?;
        if read < 4 || &magic != b"\x7FELF" {
            return Ok(FormatOutcome::NotRecognized);
        }

        let mut elf_data: Vec<u8> = Vec::new();
        elf_data
            .try_reserve(file_size)
            .map_err(|_| ExecError::NoMem)?;
        elf_data.resize(file_size, 0);

        let mut offset = 0u64;
        while (offset as usize) < file_size {
            let remaining = file_size - offset as usize;
            let chunk_size = remaining.min(4096);
            let read = handle
                .read(
                    offset,
                    &mut elf_data[offset as usize..offset as usize + chunk_size],
                )
                .map_err(|_| ExecError::IoError)?;
            if read == 0 {
                break;
            }
            offset += read as u64;
        }
        if (offset as usize) < file_size {
            elf_data.truncate(offset as usize);
        }

        let load_rc = slopos_mm::process_vm::process_vm_load_elf(
            process_id,
            elf_data.as_ptr(),
            elf_data.len(),
            entry_out as *mut u64,
        );
        if load_rc != 0 {
            return Err(ExecError::NoExec);
        }

        let argv_refs: Vec<&[u8]> = prm.argv.iter().map(|s| s.as_slice()).collect();
        let envp_refs: Vec<&[u8]> = prm.envp.iter().map(|s| s.as_slice()).collect();
        let argv = if argv_refs.is_empty() {
            None
        } else {
            Some(argv_refs.as_slice())
        };
        let envp = if envp_refs.is_empty() {
            None
        } else {
            Some(envp_refs.as_slice())
        };

        *stack_ptr_out = crate::exec::setup_user_stack(process_id, argv, envp)?;

        Ok(FormatOutcome::Loaded)
    }
}

impl BinaryFormat for ScriptFormat {
    fn try_load(
        &self,
        process_id: u32,
        prm: &mut Binprm,
        depth: u32,
        entry_out: &mut u64,
        stack_ptr_out: &mut u64,
    ) -> Result<FormatOutcome, ExecError> {
        let (handle, _file_size) = open_and_stat(&prm.path)?;

        let mut sniff = [0u8; SHEBANG_SNIFF_LEN];
        let read = handle.read(0, &mut sniff).map_err(|_| ExecError::IoError)?;
        let sniff = &sniff[..read];

        if sniff.len() < 2 || &sniff[..2] != b"#!" {
            return Ok(FormatOutcome::NotRecognized);
        }

        if depth >= MAX_INTERP_DEPTH {
            return Err(ExecError::NoExec);
        }

        let (new_path, new_argv) = rewrite_shebang(sniff, &prm.path, &prm.argv)?;
        if new_argv.len() > EXEC_MAX_ARGS || prm.envp.len() > EXEC_MAX_ENVS {
            return Err(ExecError::TooManyArgs);
        }

        prm.path = new_path;
        prm.argv = new_argv;

        dispatch(process_id, prm, depth + 1, entry_out, stack_ptr_out)?;
        Ok(FormatOutcome::Loaded)
    }
}

/// Parse a `#!interpreter [arg]` line from `sniff` (the first bytes of the
/// script) and rewrite `(path, argv)` the way `binfmt_script` does: the new
/// path is the interpreter, and the new argv is
/// `[basename(interpreter), arg?, original_path, original_argv[1..]]`.
pub(crate) fn rewrite_shebang(
    sniff: &[u8],
    original_path: &[u8],
    original_argv: &[Vec<u8>],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), ExecError> {
    let line_end = sniff.iter().position(|&b| b == b'\n').unwrap_or(sniff.len());
    let line = trim(&sniff[2..line_end]);
    if line.is_empty() {
        return Err(ExecError::NoExec);
    }

    let mut parts = line.splitn(2, |&b| b == b' ' || b == b'\t');
    let interp_path = parts.next().unwrap_or(&[]);
    let interp_arg = parts.next().map(trim).filter(|a| !a.is_empty());

    if interp_path.is_empty() || interp_path.len() > EXEC_MAX_PATH {
        return Err(ExecError::NoExec);
    }

    let interp_name = basename(interp_path);
    let original_rest: Vec<Vec<u8>> = original_argv.iter().skip(1).cloned().collect();

    let mut new_argv: Vec<Vec<u8>> = Vec::new();
    new_argv
        .try_reserve(2 + original_rest.len())
        .map_err(|_| ExecError::NoMem)?;
    new_argv.push(interp_name.to_vec());
    if let Some(arg) = interp_arg {
        new_argv.push(arg.to_vec());
    }
    new_argv.push(original_path.to_vec());
    new_argv.extend(original_rest);

    Ok((interp_path.to_vec(), new_argv))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ' && b != b'\t' && b != b'\r');
    let Some(start) = start else {
        return &[];
    };
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t' && b != b'\r')
        .unwrap_or(start);
    &bytes[start..=end]
}

fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
