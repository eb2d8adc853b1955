use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::sys::uio::pread;
use nix::unistd::{access, isatty, write, AccessFlags};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// If `fd` (stdout when `None`) is not a terminal we shouldn't chat on it.
pub fn probably_not_interactive(maybe_fd: Option<RawFd>) -> bool {
    let fd = maybe_fd.unwrap_or(libc::STDOUT_FILENO);
    !isatty(fd).unwrap_or(false)
}

pub fn dir_exists(dir: &Path) -> bool {
    dir.is_dir()
}

/// Create directory `dir`, creating parent directories as needed.
/// `dir_type` is printed in error messages. Fails if the resulting directory
/// is not writeable.
pub fn ensure_dir(dir: &Path, dir_type: &str, mode: Mode) {
    if !dir_exists(dir) {
        if let Err(e) = DirBuilder::new()
            .recursive(true)
            .mode(mode.bits())
            .create(dir)
        {
            fatal!("Can't create {} `{}': {}", dir_type, dir.display(), e);
        }
    }

    if access(dir, AccessFlags::W_OK).is_err() {
        fatal!("Can't write to {} `{}'", dir_type, dir.display());
    }
}

/// Keep the errno nix handed back. Anything run in between may clobber the
/// thread's errno.
pub fn errno_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Write all of `buf` to `fd`, looping on short writes and EINTR.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
            Ok(nwritten) => buf = &buf[nwritten..],
            Err(Errno::EINTR) => (),
            Err(e) => return Err(errno_to_io(e)),
        }
    }
    Ok(())
}

/// Like pread(2) but keeps reading until `buf` is full or end of file.
/// Returns the number of bytes actually read.
pub fn pread_all(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        match pread(fd, &mut buf[nread..], (offset + nread as u64) as libc::off_t) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(Errno::EINTR) => (),
            Err(e) => return Err(errno_to_io(e)),
        }
    }
    Ok(nread)
}
