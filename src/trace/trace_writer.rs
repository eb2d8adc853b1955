use crate::{
    event::{EncodedEvent, Event},
    log::LogLevel::{LogDebug, LogInfo},
    registers::Registers,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    task::RecordTask,
    trace::{
        compressed_writer::{CompressedWriter, Sync},
        mapped_region::MappedRegionRecord,
        trace_error::TraceError,
        trace_frame::{EventInfo, ExecInfo, FrameKind, FrameTime, TraceFrame},
        trace_stream::{
            latest_trace_symlink, make_trace_dir, trace_save_dir, RawDataMetadata, Substream,
            TraceHeader, TraceStream, DEFAULT_FRAMES_PER_FILE, TRACE_VERSION,
        },
    },
    util::{probably_not_interactive, write_all},
};
use libc::pid_t;
use nix::{
    fcntl::{flock, FlockArg::LockExclusiveNonblock, OFlag},
    sys::stat::Mode,
};
use std::{
    collections::HashMap,
    env,
    ffi::OsStr,
    fs::{remove_file, rename},
    io::ErrorKind,
    ops::{Deref, DerefMut},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

/// Trace writing takes the trace directory through a defined set of states.
/// These states can be usefully observed by external programs.
///
/// -- Initially the trace directory does not exist.
/// -- The trace directory is created. It is empty.
/// -- A file `incomplete` is created in the trace directory and an exclusive
/// flock() lock is taken on it. The trace version is written to it.
/// -- Substreams are written (and periodically flushed) during recording.
/// -- At the end of trace recording, `incomplete` is renamed to `version`
/// and the lock is released.
///
/// Thus:
/// -- If the trace directory contains the file `version` the trace is valid
/// and ready for replay.
/// -- If the trace directory contains the file `incomplete` the recorder is
/// still running or died before the recording was complete. Whatever was
/// flushed can still be read.
pub struct TraceWriter {
    trace_stream: TraceStream,
    exe_path: PathBuf,
    writers: HashMap<Substream, CompressedWriter>,
    /// Index of the `events_<n>` file frames currently go to.
    events_file_index: u32,
    frames_in_events_file: u64,
    frames_per_file: u64,
    /// Last thread time handed out, per tid.
    thread_times: HashMap<pid_t, FrameTime>,
    header_written: bool,
    /// A termination frame has been written. Only `flush()` and `close()`
    /// are allowed after it.
    terminated: bool,
    /// Created under `trace_save_dir()`, so it becomes the latest trace.
    in_save_dir: bool,
    initialized: bool,
    closed: bool,
    /// Keep the 'incomplete' (later renamed to 'version') file open until we
    /// rename it, so our flock() lock stays held on it.
    version_fd: ScopedFd,
}

impl Deref for TraceWriter {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if self.initialized && !self.closed {
            self.close();
        }
    }
}

impl TraceWriter {
    /// Create the trace directory for a recording of `exe_path`. The trace
    /// name is `<basename of exe_path>-<N>` inside `maybe_output_dir`, or
    /// inside the trace save directory (`_RD_TRACE_DIR` if set).
    pub fn open(exe_path: &Path, maybe_output_dir: Option<&Path>) -> TraceWriter {
        let trace_dir = make_trace_dir(exe_path, maybe_output_dir);
        log!(LogInfo, "Created trace directory {}", trace_dir.display());
        TraceWriter {
            trace_stream: TraceStream::new(&trace_dir),
            exe_path: exe_path.to_owned(),
            writers: HashMap::new(),
            events_file_index: 0,
            frames_in_events_file: 0,
            frames_per_file: DEFAULT_FRAMES_PER_FILE,
            thread_times: HashMap::new(),
            header_written: false,
            terminated: false,
            in_save_dir: maybe_output_dir.is_none(),
            initialized: false,
            closed: false,
            version_fd: ScopedFd::new(),
        }
    }

    /// Start a new `events_<n>` file after this many frames. Must be called
    /// before `initialize()`.
    pub fn set_frames_per_file(&mut self, frames_per_file: u64) {
        if self.initialized {
            fatal!("set_frames_per_file() after initialize() on {}", self.dir().display());
        }
        if frames_per_file == 0 {
            fatal!("frames_per_file must be positive");
        }
        self.frames_per_file = frames_per_file;
    }

    pub fn frames_per_file(&self) -> u64 {
        self.frames_per_file
    }

    /// Open all substreams and create the `incomplete` version marker. A trace
    /// created in the default save directory also becomes the latest trace.
    pub fn initialize(&mut self) {
        if self.initialized {
            fatal!("Trace {} initialized twice", self.dir().display());
        }

        for s in Substream::iter() {
            let path = self.path(s);
            match CompressedWriter::new(&path, s.block_size()) {
                Ok(w) => {
                    self.writers.insert(s, w);
                }
                Err(e) => fatal!("Unable to open trace substream: {}", e),
            }
        }

        let ver_path = self.incomplete_version_path();
        self.version_fd = ScopedFd::open_path_with_mode(
            ver_path.as_path(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        if !self.version_fd.is_open() {
            fatal!("Unable to create {}", ver_path.display());
        }

        // Take an exclusive lock and hold it until we rename the file at
        // the end of recording and then close our file descriptor.
        if flock(self.version_fd.as_raw(), LockExclusiveNonblock).is_err() {
            fatal!("Unable to lock {}", ver_path.display());
        }
        let buf = format!("{}\n", TRACE_VERSION);
        if let Err(e) = write_all(self.version_fd.as_raw(), buf.as_bytes()) {
            fatal!("Unable to write {}: {}", ver_path.display(), e);
        }

        self.initialized = true;
        if self.in_save_dir {
            self.make_latest_trace();
        }
        if !probably_not_interactive(None) {
            println!(
                "rd: Saving execution to trace directory `{}'.",
                self.dir().display()
            );
        }
    }

    fn ensure_writable(&self, what: &str) {
        if !self.initialized {
            fatal!("{} before initialize() on {}", what, self.dir().display());
        }
        if self.closed {
            fatal!("{} after close() on {}", what, self.dir().display());
        }
    }

    fn ensure_recording(&self, what: &str) {
        self.ensure_writable(what);
        if self.terminated {
            fatal!(
                "{} after the termination frame at time {} on {}",
                what,
                self.time(),
                self.dir().display()
            );
        }
    }

    fn writer_mut(&mut self, s: Substream) -> &mut CompressedWriter {
        match self.writers.get_mut(&s) {
            Some(w) => w,
            None => fatal!("Substream {} is not open", s.name()),
        }
    }

    /// Write the command line and environment. Exactly once, before any
    /// frame.
    pub fn record_header<S: AsRef<OsStr>>(&mut self, argv: &[S], envp: &[S]) {
        self.ensure_writable("record_header()");
        if self.header_written {
            fatal!("Header recorded twice in {}", self.dir().display());
        }
        if self.time() > 0 {
            fatal!("Header recorded after the first frame in {}", self.dir().display());
        }

        let header = TraceHeader {
            uuid: rand::random::<[u8; 16]>(),
            exe_image: self.exe_path.clone().into_os_string(),
            cwd: env::current_dir()
                .map(|p| p.into_os_string())
                .unwrap_or_default(),
            argv: argv.iter().map(|a| a.as_ref().to_os_string()).collect(),
            envp: envp.iter().map(|e| e.as_ref().to_os_string()).collect(),
        };
        if let Err(e) = self.writer_mut(Substream::ArgsEnv).write_record(&header) {
            fatal!("Unable to write header: {}", e);
        }
        self.header_written = true;
    }

    /// Write a frame for `t` having stopped at `ev`.
    ///
    /// Recording a trace frame has the side effect of ticking
    /// the global time.
    pub fn record_event(&mut self, t: &dyn RecordTask, ev: EncodedEvent) -> FrameTime {
        self.ensure_recording("record_event()");
        if !self.header_written {
            fatal!("record_event() before record_header() on {}", self.dir().display());
        }
        self.write_frame(FrameKind::Event, Some(t), ev)
    }

    /// Write the final frame of the trace. `maybe_t` may be `None` when no
    /// task is left to attribute it to. Nothing but `flush()` and `close()`
    /// may follow.
    pub fn record_termination(&mut self, maybe_t: Option<&dyn RecordTask>) -> FrameTime {
        self.ensure_recording("record_termination()");
        if !self.header_written {
            fatal!("record_termination() before record_header() on {}", self.dir().display());
        }
        let time = self.write_frame(
            FrameKind::Termination,
            maybe_t,
            Event::trace_termination().encode(),
        );
        self.terminated = true;
        time
    }

    fn write_frame(
        &mut self,
        kind: FrameKind,
        maybe_t: Option<&dyn RecordTask>,
        ev: EncodedEvent,
    ) -> FrameTime {
        let global_time = self.sequencer.next();
        let (tid, thread_time, exec_info) = match maybe_t {
            Some(t) => {
                let tid = t.tid();
                let tt = self.thread_times.entry(tid).or_insert(0);
                *tt += 1;
                let extra = if cfg!(feature = "extra_perf_counters") {
                    t.extra_perf_counters()
                } else {
                    None
                };
                (
                    tid,
                    *tt,
                    ExecInfo {
                        ticks: t.ticks(),
                        extra,
                        regs: t.regs(),
                    },
                )
            }
            None => (
                0,
                0,
                ExecInfo {
                    ticks: 0,
                    extra: None,
                    regs: Registers::default(),
                },
            ),
        };

        let frame = TraceFrame::new_with(
            kind,
            EventInfo {
                global_time,
                thread_time,
                tid,
                ev,
            },
            exec_info,
        );

        if let Err(e) = self.append_frame(&frame) {
            fatal!("Unable to write frame {} to {}: {}", global_time, self.dir().display(), e);
        }
        global_time
    }

    fn append_frame(&mut self, frame: &TraceFrame) -> Result<(), TraceError> {
        if self.frames_in_events_file == self.frames_per_file {
            self.rotate_events_file()?;
        }
        self.writer_mut(Substream::Events).write_record(frame)?;
        self.frames_in_events_file += 1;
        Ok(())
    }

    fn rotate_events_file(&mut self) -> Result<(), TraceError> {
        let next_index = self.events_file_index + 1;
        let path = self.events_path(next_index);
        let new_writer = CompressedWriter::new(&path, Substream::Events.block_size())?;
        if let Some(mut old) = self.writers.insert(Substream::Events, new_writer) {
            old.close(Sync::Sync)?;
        }
        log!(LogDebug, "Rotated frames to {}", path.display());
        self.events_file_index = next_index;
        self.frames_in_events_file = 0;
        Ok(())
    }

    /// Write a raw-data block to the trace, tagged with the current global
    /// time. `addr` is the address in the tracee where the data came
    /// from/will be restored to.
    pub fn record_data(&mut self, t: &dyn RecordTask, addr: RemotePtr<Void>, data: &[u8]) {
        self.ensure_recording("record_data()");
        self.write_data(t.tid(), addr, data);
    }

    fn write_data(&mut self, rec_tid: pid_t, addr: RemotePtr<Void>, data: &[u8]) {
        let md = RawDataMetadata {
            time: self.time(),
            rec_tid,
            addr,
            size: data.len(),
        };
        if let Err(e) = self.write_raw(&md, data) {
            fatal!("Unable to write raw data at {}: {}", addr, e);
        }
    }

    fn write_raw(&mut self, md: &RawDataMetadata, data: &[u8]) -> Result<(), TraceError> {
        let w = self.writer_mut(Substream::RawData);
        w.write_record(md)?;
        w.write_bytes(data)
    }

    /// Append a mapping record built by the caller, stamped with the current
    /// global time. If `maybe_data` is supplied it must hold the whole mapping;
    /// it is embedded in the raw data stream at the same time and the record
    /// is marked as copied.
    pub fn record_mapping(
        &mut self,
        mut record: MappedRegionRecord,
        maybe_data: Option<&[u8]>,
    ) -> MappedRegionRecord {
        self.ensure_recording("record_mapping()");
        if record.end < record.start {
            fatal!("Mapping {}-{} ends before it starts", record.start, record.end);
        }
        if let Some(data) = maybe_data {
            if data.len() != record.size() {
                fatal!(
                    "Mapping {}-{} is {:#x} bytes but {:#x} bytes of contents were given",
                    record.start,
                    record.end,
                    record.size(),
                    data.len()
                );
            }
        }

        record.time = self.time();
        record.copied = maybe_data.is_some();
        if let Err(e) = self.writer_mut(Substream::Mmaps).write_record(&record) {
            fatal!("Unable to write mmaps: {}", e);
        }

        if let Some(data) = maybe_data {
            self.write_data(record.tid, record.start, data);
        }
        record
    }

    /// Write out and fsync everything buffered so far. Useful before a
    /// crash that won't run destructors.
    pub fn flush(&mut self) {
        self.ensure_writable("flush()");
        for w in self.writers.values_mut() {
            if let Err(e) = w.flush_blocks(Sync::Sync) {
                fatal!("Unable to flush trace: {}", e);
            }
        }
    }

    /// Flush and close all substreams and mark the trace complete. Writing
    /// afterwards is fatal.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.initialized {
            return;
        }

        for (_, w) in self.writers.iter_mut() {
            if let Err(e) = w.close(Sync::Sync) {
                fatal!("Unable to close trace substream: {}", e);
            }
        }

        let incomplete_path = self.incomplete_version_path();
        let path = self.version_path();
        if let Err(e) = rename(&incomplete_path, &path) {
            fatal!("Unable to create version file {}: {}", path.display(), e);
        }
        self.version_fd.close();
        log!(
            LogInfo,
            "Closed trace {} at time {}",
            self.dir().display(),
            self.time()
        );
    }

    /// Number of `events_<n>` files written so far.
    pub fn events_file_count(&self) -> u32 {
        self.events_file_index + 1
    }

    /// Point `latest-trace` in the save directory at this trace.
    fn make_latest_trace(&self) {
        let link_name = latest_trace_symlink();
        // Try to update the symlink to `self`.  We only try attempt
        // to set the symlink once.  If the link is re-created after
        // we unlink it, then another recorder is racing with us
        // and it "won".  The link is then valid and points at some
        // very-recent trace, so that's good enough.
        match remove_file(&link_name) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => fatal!("Unable to unlink {}: {}", link_name.display(), e),
        }

        // Link only the trace name, not the full path, so moving a directory full
        // of traces around doesn't break the latest-trace link.
        let target: PathBuf = match (self.dir().parent(), self.dir().file_name()) {
            (Some(parent), Some(name)) if parent == trace_save_dir() => PathBuf::from(name),
            _ => self.dir().to_owned(),
        };
        if let Err(e) = symlink(&target, &link_name) {
            if e.kind() != ErrorKind::AlreadyExists {
                fatal!(
                    "Failed to update symlink `{}' to `{}': {}",
                    link_name.display(),
                    target.display(),
                    e
                );
            }
        }
    }
}
