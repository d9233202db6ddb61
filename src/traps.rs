//! Host-service trap dispatcher.
//!
//! TRAP's immediate operand selects a library; library 0 ("libc") pops a
//! function id from the data stack and dispatches on it. The table below is
//! the machine's only sanctioned path to host I/O: a closed, stable
//! enumeration whose ids and stack effects are part of the ABI.
//!
//! Host-call failures are ordinary result words (usually -1) pushed back for
//! VM code to inspect; only unknown library/function ids and memory faults
//! (bad string or buffer addresses) are interpreter errors. File descriptors
//! index a per-machine open-file table whose slots 0-2 are the process
//! standard streams; the argument vector consulted by `ARGC`/`ARGV` is the
//! one the embedder registered on the machine.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::errors::VmError;
use crate::vm::Machine;
use crate::{UWord, Word, WORD_BIT};

/// The libc library id.
pub const LIBC: UWord = 0;

/// STRLEN ( addr -- len )
pub const LIBC_STRLEN: UWord = 0x0;
/// STRNCPY ( dest src n -- dest )
pub const LIBC_STRNCPY: UWord = 0x1;
/// STDIN ( -- fd )
pub const LIBC_STDIN: UWord = 0x2;
/// STDOUT ( -- fd )
pub const LIBC_STDOUT: UWord = 0x3;
/// STDERR ( -- fd )
pub const LIBC_STDERR: UWord = 0x4;
/// O_RDONLY ( -- flag )
pub const LIBC_O_RDONLY: UWord = 0x5;
/// O_WRONLY ( -- flag )
pub const LIBC_O_WRONLY: UWord = 0x6;
/// O_RDWR ( -- flag )
pub const LIBC_O_RDWR: UWord = 0x7;
/// O_CREAT ( -- flag )
pub const LIBC_O_CREAT: UWord = 0x8;
/// O_TRUNC ( -- flag )
pub const LIBC_O_TRUNC: UWord = 0x9;
/// OPEN ( path flags -- fd )
pub const LIBC_OPEN: UWord = 0xa;
/// CLOSE ( fd -- result )
pub const LIBC_CLOSE: UWord = 0xb;
/// READ ( buf n fd -- nread )
pub const LIBC_READ: UWord = 0xc;
/// WRITE ( buf n fd -- result )
pub const LIBC_WRITE: UWord = 0xd;
/// SEEK_SET ( -- whence )
pub const LIBC_SEEK_SET: UWord = 0xe;
/// SEEK_CUR ( -- whence )
pub const LIBC_SEEK_CUR: UWord = 0xf;
/// SEEK_END ( -- whence )
pub const LIBC_SEEK_END: UWord = 0x10;
/// LSEEK ( fd lo hi whence -- lo hi )
pub const LIBC_LSEEK: UWord = 0x11;
/// FDATASYNC ( fd -- result )
pub const LIBC_FDATASYNC: UWord = 0x12;
/// RENAME ( from to -- result )
pub const LIBC_RENAME: UWord = 0x13;
/// REMOVE ( path -- result )
pub const LIBC_REMOVE: UWord = 0x14;
/// FILE_SIZE ( fd -- lo hi result )
pub const LIBC_FILE_SIZE: UWord = 0x15;
/// RESIZE_FILE ( lo hi fd -- result )
pub const LIBC_RESIZE_FILE: UWord = 0x16;
/// FILE_STATUS ( fd -- mode result )
pub const LIBC_FILE_STATUS: UWord = 0x17;
/// ARGC ( -- n )
pub const LIBC_ARGC: UWord = 0x100;
/// ARGV ( u addr n -- len )
pub const LIBC_ARGV: UWord = 0x101;

/// VM-visible open(2) flag bits: access mode in bits 0-1.
pub const OPEN_RDONLY: Word = 0x0;
/// Write-only access mode.
pub const OPEN_WRONLY: Word = 0x1;
/// Read-write access mode.
pub const OPEN_RDWR: Word = 0x2;
/// Create the file if it does not exist.
pub const OPEN_CREAT: Word = 0x40;
/// Truncate the file on open.
pub const OPEN_TRUNC: Word = 0x200;

/// SEEK_SET whence value.
pub const SEEK_SET: Word = 0;
/// SEEK_CUR whence value.
pub const SEEK_CUR: Word = 1;
/// SEEK_END whence value.
pub const SEEK_END: Word = 2;

/// Dispatches a TRAP instruction on its library id.
pub(crate) fn dispatch(m: &mut Machine, library: UWord) -> Result<(), VmError> {
    match library {
        LIBC => libc(m),
        _ => Err(VmError::InvalidLibrary),
    }
}

fn libc(m: &mut Machine) -> Result<(), VmError> {
    let function = m.popd()? as UWord;
    match function {
        LIBC_STRLEN => {
            let addr = m.popd()? as UWord;
            let len = cstring(m, addr)?.len();
            m.pushd(len as Word)
        }
        LIBC_STRNCPY => {
            let n = m.popd()? as UWord;
            let src = m.popd()? as UWord;
            let dest = m.popd()? as UWord;
            // strncpy: copy up to n bytes, zero-filling after a NUL.
            let mut terminated = false;
            for i in 0..n {
                let byte = if terminated {
                    0
                } else {
                    m.load_byte(src.wrapping_add(i))?
                };
                if byte == 0 {
                    terminated = true;
                }
                m.store_byte(dest.wrapping_add(i), byte)?;
            }
            m.pushd(dest as Word)
        }
        LIBC_STDIN => m.pushd(0),
        LIBC_STDOUT => m.pushd(1),
        LIBC_STDERR => m.pushd(2),
        LIBC_O_RDONLY => m.pushd(OPEN_RDONLY),
        LIBC_O_WRONLY => m.pushd(OPEN_WRONLY),
        LIBC_O_RDWR => m.pushd(OPEN_RDWR),
        LIBC_O_CREAT => m.pushd(OPEN_CREAT),
        LIBC_O_TRUNC => m.pushd(OPEN_TRUNC),
        LIBC_OPEN => {
            let flags = m.popd()?;
            let addr = m.popd()? as UWord;
            let path = path_at(m, addr)?;
            let fd = match open_options(flags).and_then(|opts| opts.open(&path).ok()) {
                Some(file) => alloc_fd(m, file),
                None => -1,
            };
            m.pushd(fd)
        }
        LIBC_CLOSE => {
            let fd = m.popd()?;
            let result = close_fd(m, fd);
            m.pushd(result)
        }
        LIBC_READ => {
            let fd = m.popd()?;
            let n = m.popd()? as UWord;
            let buf = m.popd()? as UWord;
            let result = read_fd(m, fd, buf, n);
            m.pushd(result)
        }
        LIBC_WRITE => {
            let fd = m.popd()?;
            let n = m.popd()? as UWord;
            let buf = m.popd()? as UWord;
            let result = write_fd(m, fd, buf, n);
            m.pushd(result)
        }
        LIBC_SEEK_SET => m.pushd(SEEK_SET),
        LIBC_SEEK_CUR => m.pushd(SEEK_CUR),
        LIBC_SEEK_END => m.pushd(SEEK_END),
        LIBC_LSEEK => {
            let whence = m.popd()?;
            let offset = pop_double(m)?;
            let fd = m.popd()?;
            match seek_fd(m, fd, whence, offset) {
                Some(pos) => push_double(m, pos as u128),
                None => push_double(m, -1i128 as u128),
            }
        }
        LIBC_FDATASYNC => {
            let fd = m.popd()?;
            let result = sync_fd(m, fd);
            m.pushd(result)
        }
        LIBC_RENAME => {
            let to_addr = m.popd()? as UWord;
            let from_addr = m.popd()? as UWord;
            let to = path_at(m, to_addr)?;
            let from = path_at(m, from_addr)?;
            let result = if fs::rename(&from, &to).is_ok() { 0 } else { -1 };
            m.pushd(result)
        }
        LIBC_REMOVE => {
            let addr = m.popd()? as UWord;
            let path = path_at(m, addr)?;
            let result = if fs::remove_file(&path).is_ok() || fs::remove_dir(&path).is_ok() {
                0
            } else {
                -1
            };
            m.pushd(result)
        }
        LIBC_FILE_SIZE => {
            let fd = m.popd()?;
            match with_file(m, fd, |file| file.metadata().map(|meta| meta.len())) {
                Some(len) => {
                    push_double(m, len as u128)?;
                    m.pushd(0)
                }
                None => {
                    push_double(m, 0)?;
                    m.pushd(-1)
                }
            }
        }
        LIBC_RESIZE_FILE => {
            let fd = m.popd()?;
            let length = pop_double(m)?;
            let result = match with_file(m, fd, |file| file.set_len(length as u64)) {
                Some(()) => 0,
                None => -1,
            };
            m.pushd(result)
        }
        LIBC_FILE_STATUS => {
            let fd = m.popd()?;
            match with_file(m, fd, |file| file.metadata().map(|meta| meta.mode())) {
                Some(mode) => {
                    m.pushd(mode as Word)?;
                    m.pushd(0)
                }
                None => {
                    m.pushd(0)?;
                    m.pushd(-1)
                }
            }
        }
        LIBC_ARGC => m.pushd(m.args.len() as Word),
        LIBC_ARGV => {
            let n = m.popd()? as UWord;
            let addr = m.popd()? as UWord;
            let index = m.popd()? as UWord;
            let result = copy_arg(m, index, addr, n);
            m.pushd(result)
        }
        _ => Err(VmError::InvalidFunction),
    }
}

// =========================
// Strings and buffers
// =========================

/// Reads the NUL-terminated byte string at `addr`.
fn cstring(m: &Machine, addr: UWord) -> Result<Vec<u8>, VmError> {
    let tail = m.memory().get(addr..).ok_or(VmError::InvalidLoad)?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(VmError::InvalidLoad)?;
    Ok(tail[..len].to_vec())
}

fn path_at(m: &Machine, addr: UWord) -> Result<PathBuf, VmError> {
    let bytes = cstring(m, addr)?;
    Ok(Path::new(std::ffi::OsStr::from_bytes(&bytes)).to_path_buf())
}

fn copy_arg(m: &mut Machine, index: UWord, addr: UWord, n: UWord) -> Word {
    let arg = match m.args.get(index) {
        Some(arg) => arg.clone(),
        None => return -1,
    };
    let count = n.min(arg.len());
    let end = match addr.checked_add(count) {
        Some(end) => end,
        None => return -1,
    };
    match m.mem.get_mut(addr..end) {
        Some(slice) => {
            slice.copy_from_slice(&arg[..count]);
            arg.len() as Word
        }
        None => -1,
    }
}

// =========================
// Descriptor table
// =========================

fn alloc_fd(m: &mut Machine, file: File) -> Word {
    for (i, slot) in m.files.iter_mut().enumerate().skip(3) {
        if slot.is_none() {
            *slot = Some(file);
            return i as Word;
        }
    }
    m.files.push(Some(file));
    (m.files.len() - 1) as Word
}

fn take_fd(m: &mut Machine, fd: Word) -> Option<(usize, File)> {
    let index = usize::try_from(fd).ok()?;
    if index < 3 || index >= m.files.len() {
        return None;
    }
    m.files[index].take().map(|file| (index, file))
}

/// Runs `op` on an open file, putting it back in its slot afterwards.
fn with_file<T, E>(
    m: &mut Machine,
    fd: Word,
    op: impl FnOnce(&mut File) -> Result<T, E>,
) -> Option<T> {
    let (index, mut file) = take_fd(m, fd)?;
    let result = op(&mut file).ok();
    m.files[index] = Some(file);
    result
}

fn open_options(flags: Word) -> Option<OpenOptions> {
    let mut opts = OpenOptions::new();
    match flags & 0x3 {
        OPEN_RDONLY => opts.read(true),
        OPEN_WRONLY => opts.write(true),
        OPEN_RDWR => opts.read(true).write(true),
        _ => return None,
    };
    if flags & OPEN_CREAT != 0 {
        opts.create(true);
    }
    if flags & OPEN_TRUNC != 0 {
        opts.truncate(true);
    }
    Some(opts)
}

fn close_fd(m: &mut Machine, fd: Word) -> Word {
    match fd {
        // The standard streams are not ours to close.
        0..=2 => 0,
        _ => match take_fd(m, fd) {
            Some((_, file)) => {
                drop(file);
                0
            }
            None => -1,
        },
    }
}

fn read_fd(m: &mut Machine, fd: Word, buf: UWord, n: UWord) -> Word {
    let end = match buf.checked_add(n) {
        Some(end) => end,
        None => return -1,
    };
    if fd == 0 {
        let slice = match m.mem.get_mut(buf..end) {
            Some(slice) => slice,
            None => return -1,
        };
        return match io::stdin().read(slice) {
            Ok(count) => count as Word,
            Err(_) => -1,
        };
    }
    let (index, mut file) = match take_fd(m, fd) {
        Some(entry) => entry,
        None => return -1,
    };
    let result = match m.mem.get_mut(buf..end) {
        Some(slice) => match file.read(slice) {
            Ok(count) => count as Word,
            Err(_) => -1,
        },
        None => -1,
    };
    m.files[index] = Some(file);
    result
}

fn write_fd(m: &mut Machine, fd: Word, buf: UWord, n: UWord) -> Word {
    let end = match buf.checked_add(n) {
        Some(end) => end,
        None => return -1,
    };
    let slice = match m.mem.get(buf..end) {
        Some(slice) => slice.to_vec(),
        None => return -1,
    };
    match fd {
        1 => match io::stdout().write(&slice) {
            Ok(count) => count as Word,
            Err(_) => -1,
        },
        2 => match io::stderr().write(&slice) {
            Ok(count) => count as Word,
            Err(_) => -1,
        },
        _ => match with_file(m, fd, |file| file.write(&slice)) {
            Some(count) => count as Word,
            None => -1,
        },
    }
}

fn seek_fd(m: &mut Machine, fd: Word, whence: Word, offset: u128) -> Option<u64> {
    let from = match whence {
        SEEK_SET => SeekFrom::Start(offset as u64),
        SEEK_CUR => SeekFrom::Current(offset as i64),
        SEEK_END => SeekFrom::End(offset as i64),
        _ => return None,
    };
    with_file(m, fd, |file| file.seek(from))
}

fn sync_fd(m: &mut Machine, fd: Word) -> Word {
    match fd {
        1 => match io::stdout().flush() {
            Ok(()) => 0,
            Err(_) => -1,
        },
        2 => match io::stderr().flush() {
            Ok(()) => 0,
            Err(_) => -1,
        },
        _ => match with_file(m, fd, |file| file.sync_data()) {
            Some(()) => 0,
            None => -1,
        },
    }
}

// =========================
// Double-word values
// =========================

/// Pushes a double word, low word first.
fn push_double(m: &mut Machine, value: u128) -> Result<(), VmError> {
    m.pushd(value as UWord as Word)?;
    m.pushd((value >> WORD_BIT) as UWord as Word)
}

/// Pops a double word pushed low word first.
fn pop_double(m: &mut Machine) -> Result<u128, VmError> {
    let hi = m.popd()? as UWord as u128;
    let lo = m.popd()? as UWord as u128;
    Ok((hi << WORD_BIT) | lo)
}
