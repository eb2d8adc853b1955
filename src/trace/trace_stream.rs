use crate::{
    remote_ptr::{RemotePtr, Void},
    trace::{sequencer::GlobalSequencer, trace_frame::FrameTime},
    util::{dir_exists, ensure_dir},
};
use libc::pid_t;
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::{
    env,
    ffi::{OsStr, OsString},
    fs::DirBuilder,
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

/// Bump this whenever the on-disk format of any substream changes.
pub const TRACE_VERSION: u32 = 1;

pub const DEFAULT_FRAMES_PER_FILE: u64 = 1_000_000;

/// Update `Substream::iter()` and TRACE_VERSION when you update this list.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Substream {
    /// Substream that stores events (trace frames). Split over several
    /// files, see `TraceStream::events_path()`.
    Events,
    RawData,
    /// Substream that stores metadata about files mmap'd during
    /// recording.
    Mmaps,
    /// Command line, environment and trace uuid.
    ArgsEnv,
}

impl Substream {
    pub fn iter() -> impl Iterator<Item = Substream> {
        [
            Substream::Events,
            Substream::RawData,
            Substream::Mmaps,
            Substream::ArgsEnv,
        ]
        .iter()
        .copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Substream::Events => "events",
            Substream::RawData => "data",
            Substream::Mmaps => "mmaps",
            Substream::ArgsEnv => "args_env",
        }
    }

    /// Uncompressed bytes per compressed block.
    pub fn block_size(self) -> usize {
        match self {
            Substream::Events => 1024 * 1024,
            Substream::RawData => 1024 * 1024,
            Substream::Mmaps => 64 * 1024,
            Substream::ArgsEnv => 64 * 1024,
        }
    }
}

/// Precedes the contents of each raw data block.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct RawDataMetadata {
    /// Time of the frame that was current when the data was recorded.
    pub time: FrameTime,
    pub rec_tid: pid_t,
    pub addr: RemotePtr<Void>,
    pub size: usize,
}

/// Raw data block, read back with its metadata.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawData {
    pub data: Vec<u8>,
    pub addr: RemotePtr<Void>,
    pub rec_tid: pid_t,
}

/// Written once per trace, before any frames.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct TraceHeader {
    pub uuid: [u8; 16],
    pub exe_image: OsString,
    pub cwd: OsString,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
}

impl TraceHeader {
    pub fn uuid_string(&self) -> String {
        self.uuid.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// TraceStream stores all the data common to both recording and
/// replay.  TraceWriter deals with recording-specific logic, and
/// TraceReader handles replay-specific details.
pub struct TraceStream {
    /// Directory into which we're saving the trace files.
    trace_dir: PathBuf,
    /// Ticked on the recording of each event (trace frame), and adopted from
    /// each frame read during replay.
    pub(super) sequencer: GlobalSequencer,
}

impl TraceStream {
    pub(super) fn new(trace_dir: &Path) -> TraceStream {
        TraceStream {
            trace_dir: trace_dir.to_owned(),
            sequencer: GlobalSequencer::new(),
        }
    }

    /// Return the directory storing this trace's files.
    pub fn dir(&self) -> &Path {
        &self.trace_dir
    }

    /// Return the current "global time" (event count) for this
    /// trace.
    pub fn time(&self) -> FrameTime {
        self.sequencer.current()
    }

    /// Return the path of the file for the given substream. For events this is
    /// the first file.
    pub(super) fn path(&self, s: Substream) -> PathBuf {
        match s {
            Substream::Events => self.events_path(0),
            _ => self.trace_dir.join(s.name()),
        }
    }

    pub(super) fn events_path(&self, index: u32) -> PathBuf {
        self.trace_dir.join(events_file_name(index))
    }

    /// Return the path of "version" file, into which the current
    /// trace format version is stored upon creation of the trace.
    pub(super) fn version_path(&self) -> PathBuf {
        self.trace_dir.join("version")
    }

    /// While the trace is being built, the version file is stored under this name.
    /// When the trace is closed we rename it to the correct name. This lets us
    /// detect incomplete traces.
    pub(super) fn incomplete_version_path(&self) -> PathBuf {
        self.trace_dir.join("incomplete")
    }
}

pub fn events_file_name(index: u32) -> String {
    format!("{}_{}", Substream::Events.name(), index)
}

/// Where traces go unless told otherwise.
pub fn trace_save_dir() -> PathBuf {
    if let Some(dir) = env::var_os("_RD_TRACE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = env::var_os("XDG_DATA_HOME") {
        if !dir.is_empty() {
            return Path::new(&dir).join("rd");
        }
    }
    match env::var_os("HOME") {
        Some(home) if !home.is_empty() => Path::new(&home).join(".local/share/rd"),
        _ => env::temp_dir().join("rd"),
    }
}

pub fn latest_trace_symlink() -> PathBuf {
    trace_save_dir().join("latest-trace")
}

/// Create a fresh `<exe basename>-<N>` directory, trying N = 0, 1, ... until
/// one doesn't exist yet.
pub fn make_trace_dir(exe_path: &Path, maybe_output_dir: Option<&Path>) -> PathBuf {
    let parent = match maybe_output_dir {
        Some(dir) => dir.to_owned(),
        None => trace_save_dir(),
    };
    ensure_dir(&parent, "trace directory", Mode::S_IRWXU);

    let base_name: &OsStr = exe_path.file_name().unwrap_or_else(|| OsStr::new("trace"));
    for nonce in 0..u32::MAX {
        let mut name = base_name.to_os_string();
        name.push(format!("-{}", nonce));
        let dir = parent.join(&name);
        match DirBuilder::new().mode(0o700).create(&dir) {
            Ok(()) => return dir,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => fatal!("Unable to create trace directory `{}': {}", dir.display(), e),
        }
    }

    fatal!(
        "Unable to create trace directory for `{}' in `{}'",
        exe_path.display(),
        parent.display()
    )
}

/// `None` means the latest trace. Single-component paths are looked up first
/// in the current directory, next in the default trace dir.
pub fn resolve_trace_name(maybe_trace_name: Option<&Path>) -> PathBuf {
    let trace_name = match maybe_trace_name {
        None => return latest_trace_symlink(),
        Some(name) => name,
    };

    if trace_name.components().count() == 1 && !trace_name.is_absolute() {
        if dir_exists(trace_name) {
            return trace_name.to_owned();
        }

        let resolved = trace_save_dir().join(trace_name);
        if dir_exists(&resolved) {
            return resolved;
        }
    }

    trace_name.to_owned()
}
