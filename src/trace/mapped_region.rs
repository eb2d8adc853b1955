use crate::{
    remote_ptr::{RemotePtr, Void},
    trace::{trace_error::TraceError, trace_frame::FrameTime},
    util::errno_to_io,
};
use libc::pid_t;
use nix::sys::stat::stat;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::Path,
};

/// Longest path we store, excluding the terminating NUL the kernel would want.
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize - 1;

/// A path no longer than `MAX_PATH_LEN` bytes and without interior NULs.
/// The empty path stands for an anonymous mapping.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "OsString", into = "OsString")]
pub struct BoundedPath(OsString);

impl BoundedPath {
    pub fn new<S: AsRef<OsStr>>(s: S) -> Result<BoundedPath, TraceError> {
        BoundedPath::from_bytes(s.as_ref().as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<BoundedPath, TraceError> {
        if bytes.len() > MAX_PATH_LEN {
            return Err(TraceError::PathTooLong { len: bytes.len() });
        }
        if let Some(offset) = bytes.iter().position(|&b| b == 0) {
            return Err(TraceError::BadPath { offset });
        }
        Ok(BoundedPath(OsString::from_vec(bytes.to_vec())))
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<OsString> for BoundedPath {
    type Error = TraceError;

    fn try_from(s: OsString) -> Result<BoundedPath, TraceError> {
        BoundedPath::new(s)
    }
}

impl From<BoundedPath> for OsString {
    fn from(p: BoundedPath) -> OsString {
        p.0
    }
}

/// The parts of stat(2) that tell us whether a file is the one we saw
/// during recording.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

impl FileIdentity {
    pub fn from_stat(st: &libc::stat) -> FileIdentity {
        FileIdentity {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as i64,
            mtime: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as i64,
        }
    }

    pub fn of_path(path: &Path) -> Result<FileIdentity, TraceError> {
        match stat(path) {
            Ok(st) => Ok(FileIdentity::from_stat(&st)),
            Err(e) => Err(TraceError::io(path, errno_to_io(e))),
        }
    }
}

/// One memory mapping observed during recording.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct MappedRegionRecord {
    /// Stamped by the writer.
    pub time: FrameTime,
    pub tid: pid_t,
    /// If true the mapping's bytes follow in the raw data stream, recorded
    /// at `time`.
    pub copied: bool,
    pub path: BoundedPath,
    pub file_identity: FileIdentity,
    pub start: RemotePtr<Void>,
    pub end: RemotePtr<Void>,
}

impl MappedRegionRecord {
    /// `file_identity` should come from the file as it was when the mapping
    /// was observed, e.g. an fstat of the mapped fd.
    pub fn new(
        tid: pid_t,
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        path: BoundedPath,
        file_identity: FileIdentity,
    ) -> MappedRegionRecord {
        MappedRegionRecord {
            time: 0,
            tid,
            copied: false,
            path,
            file_identity,
            start,
            end,
        }
    }

    pub fn anonymous(tid: pid_t, start: RemotePtr<Void>, end: RemotePtr<Void>) -> MappedRegionRecord {
        MappedRegionRecord::new(tid, start, end, BoundedPath::default(), FileIdentity::default())
    }

    /// Stat `path` now and describe the mapping with what we find.
    pub fn backed_by_file(
        tid: pid_t,
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        path: &Path,
    ) -> Result<MappedRegionRecord, TraceError> {
        let bounded = BoundedPath::new(path)?;
        let file_identity = FileIdentity::of_path(path)?;
        Ok(MappedRegionRecord::new(tid, start, end, bounded, file_identity))
    }

    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    pub fn is_anonymous(&self) -> bool {
        self.path.is_empty()
    }
}
