use crate::util::errno_to_io;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::io;
use std::os::unix::io::RawFd;

/// Owns a raw file descriptor and closes it on drop.
// We DON'T want this to be Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    /// Returns a closed ScopedFd on failure. Check `is_open()`.
    pub fn open_path_with_mode<P: ?Sized + NixPath>(path: &P, oflag: OFlag, mode: Mode) -> Self {
        let rawfd = open(path, oflag, mode).unwrap_or(-1);
        ScopedFd { fd: rawfd }
    }

    /// Like `open_path_with_mode` but reports why the open failed.
    pub fn try_open_path_with_mode<P: ?Sized + NixPath>(
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> io::Result<Self> {
        match open(path, oflag, mode) {
            Ok(fd) => Ok(ScopedFd { fd }),
            Err(e) => Err(errno_to_io(e)),
        }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let res = ScopedFd::try_open_path_with_mode(
            dir.path().join("nope").as_path(),
            OFlag::O_RDONLY,
            Mode::empty(),
        );
        assert_eq!(res.err().map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    }

    #[test]
    fn close_is_idempotent() {
        let mut fd = ScopedFd::new();
        assert!(!fd.is_open());
        fd.close();
        assert_eq!(fd.as_raw(), -1);
    }
}
