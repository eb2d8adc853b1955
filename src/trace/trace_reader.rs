use crate::{
    log::LogLevel::{LogDebug, LogWarn},
    remote_ptr::{RemotePtr, Void},
    trace::{
        codec::{decode_record, CodecError},
        compressed_reader::CompressedReader,
        mapped_region::{FileIdentity, MappedRegionRecord},
        trace_error::TraceError,
        trace_frame::{FrameTime, TraceFrame},
        trace_stream::{
            events_file_name, resolve_trace_name, RawData, RawDataMetadata, Substream,
            TraceHeader, TraceStream, TRACE_VERSION,
        },
    },
    util::dir_exists,
};
use libc::pid_t;
use std::{
    fs,
    io::ErrorKind,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeConstraint {
    CurrentTimeOnly,
    AnyTime,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReaderState {
    /// No frame consumed yet. The header is available.
    Opened,
    Streaming,
    /// Clean end reached, or the termination frame was consumed.
    Exhausted,
    /// The frame stream is truncated or corrupt. Nothing more can be read.
    Failed,
}

/// Read-only view of a trace directory, fed to replay one frame at a time.
pub struct TraceReader {
    trace_stream: TraceStream,
    events: CompressedReader,
    /// Which `events_<n>` file `events` reads.
    events_file_index: u32,
    /// Frames decoded from the current events file.
    frames_read_in_file: u64,
    data: CompressedReader,
    mmaps: CompressedReader,
    header: TraceHeader,
    header_loaded: bool,
    state: ReaderState,
    /// One frame of lookahead.
    peeked: Option<TraceFrame>,
    /// Metadata of the next raw data block, read but not yet consumed. The
    /// block's bytes are still unread in `data`.
    pending_raw: Option<RawDataMetadata>,
    /// Scratch for record bodies. Reused so that reads don't allocate.
    record_buf: Vec<u8>,
    /// The recording never finished.
    incomplete: bool,
}

impl Deref for TraceReader {
    type Target = TraceStream;

    fn deref(&self) -> &Self::Target {
        &self.trace_stream
    }
}

impl DerefMut for TraceReader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.trace_stream
    }
}

fn corrupt_record(r: &CompressedReader, e: CodecError) -> TraceError {
    TraceError::Corrupt {
        stream: r.stream_name().to_owned(),
        offset: r.block_offset(),
        reason: e.reason,
    }
}

impl TraceReader {
    /// Open the trace at `maybe_dir` (see `resolve_trace_name()`). Any
    /// problem with the trace is fatal.
    pub fn open(maybe_dir: Option<&Path>) -> TraceReader {
        match TraceReader::try_open(maybe_dir) {
            Ok(reader) => reader,
            Err(e) => fatal!("Unable to open trace: {}", e),
        }
    }

    pub fn try_open(maybe_dir: Option<&Path>) -> Result<TraceReader, TraceError> {
        let path = resolve_trace_name(maybe_dir);
        if !dir_exists(&path) {
            return Err(TraceError::MissingTrace { path });
        }

        let trace_stream = TraceStream::new(&path);
        let incomplete = check_version(&trace_stream)?;
        if incomplete {
            log!(
                LogWarn,
                "Trace {} is incomplete; reading what was flushed",
                path.display()
            );
        }

        let mut args_env = CompressedReader::new(&trace_stream.path(Substream::ArgsEnv))?;
        let mut record_buf = Vec::new();
        if !args_env.read_record(&mut record_buf)? {
            return Err(TraceError::Corrupt {
                stream: args_env.stream_name().to_owned(),
                offset: 0,
                reason: "missing header".to_owned(),
            });
        }
        let header: TraceHeader =
            decode_record(&record_buf).map_err(|e| corrupt_record(&args_env, e))?;

        let events = CompressedReader::new(&trace_stream.path(Substream::Events))?;
        let data = CompressedReader::new(&trace_stream.path(Substream::RawData))?;
        let mmaps = CompressedReader::new(&trace_stream.path(Substream::Mmaps))?;

        Ok(TraceReader {
            trace_stream,
            events,
            events_file_index: 0,
            frames_read_in_file: 0,
            data,
            mmaps,
            header,
            header_loaded: false,
            state: ReaderState::Opened,
            peeked: None,
            pending_raw: None,
            record_buf,
            incomplete,
        })
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// True if the recorder didn't get to close the trace.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Hand the recorded exe, command line and environment to the caller.
    /// Once, before frames are consumed.
    pub fn load_header(&mut self) -> TraceHeader {
        if self.header_loaded {
            fatal!("Header of {} loaded twice", self.dir().display());
        }
        if self.state != ReaderState::Opened {
            fatal!(
                "Header of {} loaded after frames were consumed",
                self.dir().display()
            );
        }
        self.header_loaded = true;
        self.header.clone()
    }

    /// The tid of the first recorded frame. Only valid before any frame has
    /// been consumed.
    pub fn main_thread_id(&mut self) -> pid_t {
        if self.state != ReaderState::Opened {
            fatal!("main_thread_id() after frames were consumed");
        }
        match self.peek_next() {
            Some(frame) => frame.tid(),
            None => fatal!("Trace {} has no frames", self.dir().display()),
        }
    }

    /// Where the next frame will be decoded from, as `events_<n>:<index>`.
    pub fn coordinate(&self) -> String {
        format!(
            "{}:{}",
            events_file_name(self.events_file_index),
            self.frames_read_in_file
        )
    }

    /// The global time of the last consumed frame. 0 before any.
    pub fn current_time(&self) -> FrameTime {
        self.time()
    }

    /// Decode the next frame from the events files, moving on to the next
    /// file at the end of each one.
    fn decode_next_frame(&mut self) -> Result<Option<TraceFrame>, TraceError> {
        loop {
            if self.events.read_record(&mut self.record_buf)? {
                let frame: TraceFrame = decode_record(&self.record_buf)
                    .map_err(|e| corrupt_record(&self.events, e))?;
                self.frames_read_in_file += 1;
                return Ok(Some(frame));
            }

            let next_path = self.events_path(self.events_file_index + 1);
            if !next_path.exists() {
                return Ok(None);
            }
            log!(LogDebug, "Moving on to {}", next_path.display());
            self.events = CompressedReader::new(&next_path)?;
            self.events_file_index += 1;
            self.frames_read_in_file = 0;
        }
    }

    fn fill_peek(&mut self) -> Result<(), TraceError> {
        match self.state {
            ReaderState::Exhausted => return Ok(()),
            ReaderState::Failed => {
                return Err(TraceError::Corrupt {
                    stream: events_file_name(self.events_file_index),
                    offset: self.events.block_offset(),
                    reason: "an earlier read failed".to_owned(),
                })
            }
            _ => (),
        }
        if self.peeked.is_none() {
            match self.decode_next_frame() {
                Ok(maybe_frame) => self.peeked = maybe_frame,
                Err(e) => {
                    self.state = ReaderState::Failed;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// The next frame, `Ok(None)` at a clean end of the trace, or the
    /// reason the trace can't be read any further.
    pub fn next_frame(&mut self) -> Result<Option<TraceFrame>, TraceError> {
        self.fill_peek()?;
        if self.state == ReaderState::Exhausted {
            return Ok(None);
        }
        let frame = match self.peeked.take() {
            Some(frame) => frame,
            None => {
                self.state = ReaderState::Exhausted;
                return Ok(None);
            }
        };

        if let Err(e) = self.sequencer.advance_to(frame.time()) {
            self.state = ReaderState::Failed;
            return Err(e);
        }
        self.state = if frame.is_termination() {
            ReaderState::Exhausted
        } else {
            ReaderState::Streaming
        };
        Ok(Some(frame))
    }

    /// Read the next frame. The trace must have one.
    pub fn read_next(&mut self) -> TraceFrame {
        match self.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => fatal!(
                "Unexpected end of trace {} at {}",
                self.dir().display(),
                self.coordinate()
            ),
            Err(e) => fatal!(
                "Trace {} unreadable at {}: {}",
                self.dir().display(),
                self.coordinate(),
                e
            ),
        }
    }

    /// Like `read_next()` but `None` at the end of the trace.
    pub fn try_read_next(&mut self) -> Option<TraceFrame> {
        match self.next_frame() {
            Ok(maybe_frame) => maybe_frame,
            Err(e) => fatal!(
                "Trace {} unreadable at {}: {}",
                self.dir().display(),
                self.coordinate(),
                e
            ),
        }
    }

    /// What the next `read_next()`/`try_read_next()` would return, without
    /// consuming it.
    pub fn peek_next(&mut self) -> Option<TraceFrame> {
        if let Err(e) = self.fill_peek() {
            fatal!(
                "Trace {} unreadable at {}: {}",
                self.dir().display(),
                self.coordinate(),
                e
            );
        }
        if self.state == ReaderState::Exhausted {
            return None;
        }
        self.peeked.clone()
    }

    /// Metadata of the next raw data block recorded at `time`, leaving it
    /// pending. Blocks from earlier frames that nobody asked for are skipped.
    fn raw_data_metadata_at(
        &mut self,
        time: FrameTime,
    ) -> Result<Option<RawDataMetadata>, TraceError> {
        loop {
            if self.pending_raw.is_none() {
                if !self.data.read_record(&mut self.record_buf)? {
                    return Ok(None);
                }
                let md: RawDataMetadata = decode_record(&self.record_buf)
                    .map_err(|e| corrupt_record(&self.data, e))?;
                self.pending_raw = Some(md);
            }

            let md = match self.pending_raw {
                Some(md) => md,
                None => return Ok(None),
            };
            if md.time < time {
                log!(
                    LogDebug,
                    "Skipping {} bytes of raw data at {} from time {}",
                    md.size,
                    md.addr,
                    md.time
                );
                self.pending_raw = None;
                self.data.skip(md.size)?;
                continue;
            }
            return Ok(if md.time == time { Some(md) } else { None });
        }
    }

    /// Read the next raw data block recorded at `frame`'s time, or `None` if
    /// there are no more.
    pub fn read_raw_data_for_frame(&mut self, frame: &TraceFrame) -> Option<RawData> {
        let md = match self.raw_data_metadata_at(frame.time()) {
            Ok(Some(md)) => md,
            Ok(None) => return None,
            Err(e) => fatal!("Unable to read raw data for frame {}: {}", frame.time(), e),
        };
        let mut data = vec![0u8; md.size];
        if let Err(e) = self.data.read(&mut data) {
            fatal!("Unable to read raw data for frame {}: {}", frame.time(), e);
        }
        self.pending_raw = None;
        Some(RawData {
            data,
            addr: md.addr,
            rec_tid: md.rec_tid,
        })
    }

    /// Like `read_raw_data_for_frame()` but the block must exist.
    pub fn read_raw_data(&mut self, frame: &TraceFrame) -> RawData {
        match self.read_raw_data_for_frame(frame) {
            Some(raw) => raw,
            None => fatal!(
                "Expected raw data for frame {} in {}",
                frame.time(),
                self.dir().display()
            ),
        }
    }

    /// Consume the next raw data block at `frame`'s time, returning only its
    /// metadata.
    pub fn read_raw_data_metadata_for_frame(
        &mut self,
        frame: &TraceFrame,
    ) -> Option<RawDataMetadata> {
        let res = self
            .raw_data_metadata_at(frame.time())
            .and_then(|maybe_md| match maybe_md {
                Some(md) => {
                    self.data.skip(md.size)?;
                    self.pending_raw = None;
                    Ok(Some(md))
                }
                None => Ok(None),
            });
        match res {
            Ok(maybe_md) => maybe_md,
            Err(e) => fatal!("Unable to read raw data for frame {}: {}", frame.time(), e),
        }
    }

    /// Copy the next raw data block at `frame`'s time straight into `buf`.
    /// Returns the block size and the address it was recorded at. On error
    /// the block stays pending and can be retried with a bigger buffer.
    pub fn read_raw_data_direct(
        &mut self,
        frame: &TraceFrame,
        buf: &mut [u8],
    ) -> Result<(usize, RemotePtr<Void>), TraceError> {
        let md = match self.raw_data_metadata_at(frame.time())? {
            Some(md) => md,
            None => return Err(TraceError::NoRawData { time: frame.time() }),
        };
        if buf.len() < md.size {
            return Err(TraceError::SizeMismatch {
                needed: md.size,
                available: buf.len(),
            });
        }
        self.data.read(&mut buf[..md.size])?;
        self.pending_raw = None;
        Ok((md.size, md.addr))
    }

    /// The next mapping record. With `CurrentTimeOnly`, only if it was
    /// recorded at the current frame's time: later records are left for
    /// later, records from earlier frames that nobody asked for are skipped.
    pub fn read_mapped_region(&mut self, constraint: TimeConstraint) -> Option<MappedRegionRecord> {
        loop {
            self.mmaps.save_state();
            let found = match self.mmaps.read_record(&mut self.record_buf) {
                Ok(found) => found,
                Err(e) => fatal!("Unable to read mmaps: {}", e),
            };
            if !found {
                self.mmaps.discard_state();
                return None;
            }

            let record: MappedRegionRecord = match decode_record(&self.record_buf) {
                Ok(r) => r,
                Err(e) => fatal!("Unable to read mmaps: {}", corrupt_record(&self.mmaps, e)),
            };
            if constraint == TimeConstraint::CurrentTimeOnly {
                if record.time < self.time() {
                    log!(
                        LogDebug,
                        "Skipping mapping {}-{} from time {}",
                        record.start,
                        record.end,
                        record.time
                    );
                    self.mmaps.discard_state();
                    continue;
                }
                if record.time > self.time() {
                    self.mmaps.restore_state();
                    return None;
                }
            }
            self.mmaps.discard_state();
            return Some(record);
        }
    }

    /// The next mapping record, regardless of frame time.
    pub fn read_next_mapping(&mut self) -> Option<MappedRegionRecord> {
        self.read_mapped_region(TimeConstraint::AnyTime)
    }

    /// Re-stat the backing file of a mapping that wasn't copied into the
    /// trace and check it's still the same file.
    pub fn validate_backing_file(&self, record: &MappedRegionRecord) -> bool {
        if record.copied || record.is_anonymous() {
            return true;
        }
        match FileIdentity::of_path(record.path.as_path()) {
            Ok(id) if id == record.file_identity => true,
            Ok(id) => {
                log!(
                    LogWarn,
                    "Backing file {} changed since recording: {:?} != {:?}",
                    record.path.as_path().display(),
                    id,
                    record.file_identity
                );
                false
            }
            Err(e) => {
                log!(LogWarn, "{}", e);
                false
            }
        }
    }

    /// Go back to the state right after `open()`.
    pub fn rewind(&mut self) {
        if self.events_file_index == 0 {
            self.events.rewind();
        } else {
            let path = self.path(Substream::Events);
            self.events = match CompressedReader::new(&path) {
                Ok(r) => r,
                Err(e) => fatal!("Unable to reopen trace: {}", e),
            };
        }
        self.events_file_index = 0;
        self.frames_read_in_file = 0;
        self.data.rewind();
        self.mmaps.rewind();
        self.sequencer.reset();
        self.header_loaded = false;
        self.state = ReaderState::Opened;
        self.peeked = None;
        self.pending_raw = None;
    }

    fn substream_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut index = 0;
        loop {
            let p = self.events_path(index);
            if !p.exists() {
                break;
            }
            files.push(p);
            index += 1;
        }
        for s in Substream::iter().filter(|s| *s != Substream::Events) {
            files.push(self.path(s));
        }
        files
    }

    fn sum_over_substreams<F>(&self, f: F) -> u64
    where
        F: Fn(&CompressedReader) -> Result<u64, TraceError>,
    {
        let mut total = 0;
        for path in self.substream_files() {
            match CompressedReader::new(&path).and_then(|r| f(&r)) {
                Ok(n) => total += n,
                Err(e) => fatal!("Unable to gather trace stats: {}", e),
            }
        }
        total
    }

    /// Total bytes of trace data once decompressed.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.sum_over_substreams(|r| r.uncompressed_bytes())
    }

    /// Total bytes of trace data on disk, excluding the version file.
    pub fn compressed_bytes(&self) -> u64 {
        self.sum_over_substreams(|r| r.compressed_bytes())
    }
}

/// Returns whether the trace is incomplete, i.e. only has the `incomplete`
/// marker.
fn check_version(ts: &TraceStream) -> Result<bool, TraceError> {
    let (path, incomplete) = if ts.version_path().exists() {
        (ts.version_path(), false)
    } else if ts.incomplete_version_path().exists() {
        (ts.incomplete_version_path(), true)
    } else {
        return Err(TraceError::MissingTrace {
            path: ts.dir().to_owned(),
        });
    };

    let version_str = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(TraceError::MissingTrace {
                path: ts.dir().to_owned(),
            })
        }
        Err(e) => return Err(TraceError::io(&path, e)),
    };
    match version_str.trim().parse::<u32>() {
        Ok(v) if v == TRACE_VERSION => Ok(incomplete),
        _ => Err(TraceError::Version {
            path: ts.dir().to_owned(),
            found: version_str.trim().to_owned(),
            expected: TRACE_VERSION,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        event::{EncodedEvent, Event, EventType, SyscallState},
        task::test_task::FakeTask,
        trace::{trace_frame::FrameKind, trace_writer::TraceWriter},
    };
    use std::{fs::OpenOptions, io::Write};

    fn recording(out: &Path) -> TraceWriter {
        let mut w = TraceWriter::open(Path::new("/usr/bin/prog"), Some(out));
        w.initialize();
        w.record_header(&["prog", "-v"], &["PATH=/bin"]);
        w
    }

    fn task(tid: pid_t, n: u64) -> FakeTask {
        let mut t = FakeTask::new(tid);
        t.ticks = n * 100;
        t.regs.rip = 0x400000 + n;
        t.regs.rax = n;
        t
    }

    #[test]
    fn frames_read_back_in_order() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        let n = 50u64;
        for i in 1..=n {
            let tid = 100 + (i % 3) as pid_t;
            w.record_event(&task(tid, i), EncodedEvent(i as u32));
        }
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        assert_eq!(r.current_time(), 0);
        let mut last_thread_time = std::collections::HashMap::new();
        for i in 1..=n {
            let f = r.read_next();
            assert_eq!(f.time(), i);
            assert_eq!(f.kind(), FrameKind::Event);
            assert_eq!(f.tid(), 100 + (i % 3) as pid_t);
            assert_eq!(f.event(), EncodedEvent(i as u32));
            assert_eq!(f.ticks(), i * 100);
            assert_eq!(f.regs_ref().rip, 0x400000 + i);
            assert_eq!(f.regs_ref().rax, i);
            if cfg!(feature = "extra_perf_counters") {
                assert_eq!(f.extra_perf_counters().map(|e| e.page_faults), Some(2));
            } else {
                assert!(f.extra_perf_counters().is_none());
            }
            let prev = last_thread_time.insert(f.tid(), f.thread_time()).unwrap_or(0);
            assert!(f.thread_time() > prev);
        }
        assert_eq!(r.current_time(), n);
        assert_eq!(r.try_read_next(), None);
        assert_eq!(r.state(), ReaderState::Exhausted);
        assert_eq!(r.try_read_next(), None);
    }

    #[test]
    fn header_and_main_thread() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        w.record_event(&task(77, 1), EncodedEvent(1));
        w.record_event(&task(78, 2), EncodedEvent(1));
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        assert_eq!(r.main_thread_id(), 77);
        let h = r.load_header();
        assert_eq!(h.exe_image, "/usr/bin/prog");
        assert_eq!(h.argv, vec!["prog", "-v"]);
        assert_eq!(h.envp, vec!["PATH=/bin"]);
        // main_thread_id() peeked; reading must still start at frame 1.
        assert_eq!(r.read_next().time(), 1);
    }

    #[test]
    fn peek_does_not_advance() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        for i in 1..=3 {
            w.record_event(&task(9, i), EncodedEvent(i as u32));
        }
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        r.read_next();
        let peeked = r.peek_next().unwrap();
        assert_eq!(r.current_time(), 1);
        assert_eq!(r.peek_next().unwrap(), peeked);
        let read = r.read_next();
        assert_eq!(read, peeked);
        assert_eq!(read.time(), 2);
        assert_eq!(r.read_next().time(), 3);
        assert_eq!(r.peek_next(), None);
    }

    #[test]
    fn termination_without_task() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        w.record_event(&task(9, 1), EncodedEvent(1));
        w.record_termination(None);
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        r.read_next();
        let f = r.read_next();
        assert!(f.is_termination());
        assert_eq!(f.time(), 2);
        assert_eq!(f.tid(), 0);
        assert_eq!(
            Event::decode(f.event()).map(|e| e.event_type()),
            Some(EventType::EvTraceTermination)
        );
        assert_eq!(r.state(), ReaderState::Exhausted);
        assert_eq!(r.try_read_next(), None);
    }

    #[test]
    fn syscall_entry_exit_then_exit() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        let t = FakeTask::new(42);
        w.record_event(&t, Event::syscall(60, SyscallState::EnteringSyscall).encode());
        w.record_event(&t, Event::syscall(60, SyscallState::ExitingSyscall).encode());
        w.record_event(&t, Event::exit().encode());
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        let frames: Vec<TraceFrame> = (0..3).map(|_| r.read_next()).collect();
        let times: Vec<FrameTime> = frames.iter().map(|f| f.time()).collect();
        assert_eq!(times, vec![1, 2, 3]);
        assert!(frames.iter().all(|f| f.tid() == 42));
        assert!(frames[0].thread_time() < frames[1].thread_time());
        assert!(frames[1].thread_time() < frames[2].thread_time());
        let last = Event::decode(frames[2].event()).unwrap();
        assert_eq!(last.event_type(), EventType::EvExit);
    }

    #[test]
    fn raw_data_direct() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        let t = FakeTask::new(42);
        let block: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        let addr = RemotePtr::<Void>::new_from_val(0x400000);
        w.record_event(&t, EncodedEvent(1));
        w.record_data(&t, addr, &block);
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        let f = r.read_next();
        let mut small = [0u8; 10];
        match r.read_raw_data_direct(&f, &mut small) {
            Err(TraceError::SizeMismatch { needed, available }) => {
                assert_eq!(needed, 4096);
                assert_eq!(available, 10);
            }
            other => panic!("expected size mismatch, got {:?}", other),
        }
        // The block is still there for a correctly sized buffer.
        let mut buf = vec![0u8; 4096];
        let (n, rec_addr) = r.read_raw_data_direct(&f, &mut buf).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(rec_addr, addr);
        assert_eq!(buf, block);
        match r.read_raw_data_direct(&f, &mut buf) {
            Err(TraceError::NoRawData { time }) => assert_eq!(time, 1),
            other => panic!("expected no raw data, got {:?}", other),
        }
    }

    #[test]
    fn raw_data_belongs_to_its_frame() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        let t = FakeTask::new(3);
        w.record_event(&t, EncodedEvent(1));
        w.record_data(&t, RemotePtr::new_from_val(0x1000), b"first");
        w.record_data(&t, RemotePtr::new_from_val(0x2000), b"second");
        w.record_event(&t, EncodedEvent(1));
        w.record_event(&t, EncodedEvent(1));
        w.record_data(&t, RemotePtr::new_from_val(0x3000), b"third");
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        let f1 = r.read_next();
        let md = r.read_raw_data_metadata_for_frame(&f1).unwrap();
        assert_eq!(md.size, 5);
        assert_eq!(md.rec_tid, 3);
        // The second block of frame 1 is never asked for.
        let f2 = r.read_next();
        assert_eq!(r.read_raw_data_for_frame(&f2), None);
        let f3 = r.read_next();
        let raw = r.read_raw_data(&f3);
        assert_eq!(raw.data, b"third".to_vec());
        assert_eq!(raw.addr.as_usize(), 0x3000);
        assert_eq!(r.read_raw_data_for_frame(&f3), None);
    }

    #[test]
    fn mappings() {
        let out = tempfile::tempdir().unwrap();
        let lib = out.path().join("libfoo.so");
        std::fs::write(&lib, b"\x7fELF not really").unwrap();

        let mut w = recording(out.path());
        let t = FakeTask::new(8);
        w.record_event(&t, EncodedEvent(1));
        let copied = w.record_mapping(
            MappedRegionRecord::anonymous(
                8,
                RemotePtr::new_from_val(0x10000),
                RemotePtr::new_from_val(0x10008),
            ),
            Some(b"contents"),
        );
        w.record_event(&t, EncodedEvent(1));
        let backed = MappedRegionRecord::backed_by_file(
            8,
            RemotePtr::new_from_val(0x20000),
            RemotePtr::new_from_val(0x21000),
            &lib,
        )
        .unwrap();
        w.record_mapping(backed, None);
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        assert_eq!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly), None);
        let f1 = r.read_next();
        let m1 = r
            .read_mapped_region(TimeConstraint::CurrentTimeOnly)
            .unwrap();
        assert_eq!(m1, copied);
        assert!(m1.copied);
        assert_eq!(m1.size(), 8);
        assert_eq!(r.read_raw_data(&f1).data, b"contents".to_vec());
        assert_eq!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly), None);

        r.read_next();
        let m2 = r.read_next_mapping().unwrap();
        assert!(!m2.copied);
        assert_eq!(m2.time, 2);
        assert_eq!(m2.path.as_path(), lib.as_path());
        assert!(r.validate_backing_file(&m2));
        std::fs::write(&lib, b"replaced with something longer").unwrap();
        assert!(!r.validate_backing_file(&m2));
        assert_eq!(r.read_next_mapping(), None);
    }

    #[test]
    fn mapping_before_first_frame_does_not_block_later_ones() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        let exe = MappedRegionRecord::anonymous(
            8,
            RemotePtr::new_from_val(0x400000),
            RemotePtr::new_from_val(0x401000),
        );
        assert_eq!(w.record_mapping(exe.clone(), None).time, 0);
        w.record_event(&FakeTask::new(8), EncodedEvent(1));
        let heap = MappedRegionRecord::anonymous(
            8,
            RemotePtr::new_from_val(0x600000),
            RemotePtr::new_from_val(0x602000),
        );
        w.record_mapping(heap, None);
        w.record_event(&FakeTask::new(8), EncodedEvent(1));
        w.record_mapping(exe, None);
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        r.read_next();
        // Nobody asked for the time 0 mapping; it's skipped.
        let m = r
            .read_mapped_region(TimeConstraint::CurrentTimeOnly)
            .unwrap();
        assert_eq!(m.time, 1);
        assert_eq!(m.start.as_usize(), 0x600000);
        assert_eq!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly), None);
        r.read_next();
        let m = r
            .read_mapped_region(TimeConstraint::CurrentTimeOnly)
            .unwrap();
        assert_eq!(m.time, 2);
        assert_eq!(m.start.as_usize(), 0x400000);

        // Before any frame is read, time 0 mappings are current.
        r.rewind();
        let m = r
            .read_mapped_region(TimeConstraint::CurrentTimeOnly)
            .unwrap();
        assert_eq!(m.time, 0);
        assert_eq!(r.read_mapped_region(TimeConstraint::CurrentTimeOnly), None);
    }

    #[test]
    fn latest_trace_is_the_default() {
        let save_dir = tempfile::tempdir().unwrap();
        std::env::set_var("_RD_TRACE_DIR", save_dir.path());
        let mut w = TraceWriter::open(Path::new("/usr/bin/prog"), None);
        w.initialize();
        w.record_header(&["prog"], &[] as &[&str]);
        w.record_event(&FakeTask::new(31), EncodedEvent(1));
        let dir = w.dir().to_owned();
        w.close();
        assert_eq!(dir, save_dir.path().join("prog-0"));
        assert_eq!(
            fs::read_link(save_dir.path().join("latest-trace")).unwrap(),
            PathBuf::from("prog-0")
        );

        let mut r = TraceReader::open(None);
        assert_eq!(r.main_thread_id(), 31);
        assert_eq!(r.read_next().time(), 1);

        // Traces written elsewhere leave the link alone.
        let elsewhere = tempfile::tempdir().unwrap();
        let mut w = recording(elsewhere.path());
        w.close();
        assert_eq!(
            fs::read_link(save_dir.path().join("latest-trace")).unwrap(),
            PathBuf::from("prog-0")
        );
        std::env::remove_var("_RD_TRACE_DIR");
    }

    #[test]
    fn trailing_garbage_is_truncation() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        for i in 1..=3 {
            w.record_event(&task(1, i), EncodedEvent(1));
        }
        let dir = w.dir().to_owned();
        w.close();
        // Half a block header.
        OpenOptions::new()
            .append(true)
            .open(dir.join("events_0"))
            .unwrap()
            .write_all(&[1, 2, 3, 4, 5])
            .unwrap();

        let mut r = TraceReader::open(Some(&dir));
        for _ in 0..3 {
            assert!(r.next_frame().unwrap().is_some());
        }
        match r.next_frame() {
            Err(TraceError::Truncated { stream, .. }) => assert_eq!(stream, "events_0"),
            other => panic!("expected truncation, got {:?}", other),
        }
        assert_eq!(r.state(), ReaderState::Failed);
        assert!(r.next_frame().is_err());
    }

    #[test]
    fn rotated_files_read_contiguously() {
        let out = tempfile::tempdir().unwrap();
        let mut w = TraceWriter::open(Path::new("/usr/bin/prog"), Some(out.path()));
        w.set_frames_per_file(4);
        w.initialize();
        w.record_header(&["prog"], &[] as &[&str]);
        for i in 1..=10 {
            w.record_event(&task(2, i), EncodedEvent(1));
        }
        let dir = w.dir().to_owned();
        w.close();

        let mut r = TraceReader::open(Some(&dir));
        for i in 1..=10 {
            if i == 9 {
                // The next file is only opened once this one runs dry.
                assert_eq!(r.coordinate(), "events_1:4");
            }
            assert_eq!(r.read_next().time(), i);
            if i == 9 {
                assert_eq!(r.coordinate(), "events_2:1");
            }
        }
        assert_eq!(r.coordinate(), "events_2:2");
        assert_eq!(r.try_read_next(), None);

        r.rewind();
        assert_eq!(r.current_time(), 0);
        assert_eq!(r.coordinate(), "events_0:0");
        assert_eq!(r.read_next().time(), 1);
        assert!(r.compressed_bytes() > 0);
        assert!(r.uncompressed_bytes() > 0);
    }

    #[test]
    fn flushed_incomplete_trace_is_readable() {
        let out = tempfile::tempdir().unwrap();
        let mut w = recording(out.path());
        w.record_event(&task(5, 1), EncodedEvent(1));
        w.flush();
        let dir = w.dir().to_owned();

        let mut r = TraceReader::try_open(Some(&dir)).unwrap();
        assert!(r.is_incomplete());
        assert_eq!(r.read_next().time(), 1);
        assert_eq!(r.try_read_next(), None);
        w.close();
    }

    #[test]
    fn open_errors() {
        let out = tempfile::tempdir().unwrap();
        match TraceReader::try_open(Some(&out.path().join("nothing-here"))) {
            Err(TraceError::MissingTrace { .. }) => (),
            _ => panic!("expected MissingTrace"),
        }

        let mut w = recording(out.path());
        let dir = w.dir().to_owned();
        w.close();
        std::fs::write(dir.join("version"), "999\n").unwrap();
        match TraceReader::try_open(Some(&dir)) {
            Err(TraceError::Version { found, expected, .. }) => {
                assert_eq!(found, "999");
                assert_eq!(expected, TRACE_VERSION);
            }
            _ => panic!("expected Version error"),
        }
    }
}
