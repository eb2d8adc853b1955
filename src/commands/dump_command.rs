use crate::{
    commands::{
        rd_options::{RdOptions, RdSubCommand},
        RdCommand,
    },
    registers::REGISTER_NAMES,
    trace::{
        mapped_region::MappedRegionRecord,
        trace_frame::FrameTime,
        trace_reader::{TimeConstraint, TraceReader},
    },
};
use std::{
    borrow::Cow,
    io,
    io::{stdout, Write},
    path::PathBuf,
};

pub struct DumpCommand {
    dump_recorded_data_metadata: bool,
    dump_mmaps: bool,
    raw_dump: bool,
    statistics: bool,
    only_tid: Option<libc::pid_t>,
    trace_dir: Option<PathBuf>,
    event_spec: Option<(FrameTime, Option<FrameTime>)>,
}

impl DumpCommand {
    pub fn new(options: &RdOptions) -> DumpCommand {
        match options.cmd.clone() {
            RdSubCommand::Dump {
                recorded_metadata,
                mmaps,
                raw_dump,
                statistics,
                only_tid,
                trace_dir,
                event_spec,
            } => DumpCommand {
                dump_recorded_data_metadata: recorded_metadata,
                dump_mmaps: mmaps,
                raw_dump,
                statistics,
                only_tid,
                trace_dir,
                event_spec,
            },
            _ => fatal!("Unexpected RdSubCommand variant. Not a Dump variant!"),
        }
    }

    fn dump(&self, f: &mut dyn Write) -> io::Result<()> {
        let mut trace = match TraceReader::try_open(self.trace_dir.as_deref()) {
            Ok(t) => t,
            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
        };

        if self.raw_dump {
            write!(f, "global_time thread_time tid event ticks")?;
            for name in REGISTER_NAMES.iter() {
                write!(f, " {}", name)?;
            }
            writeln!(f)?;
        }

        self.dump_events_matching(&mut trace, f)?;

        if self.statistics {
            return dump_statistics(&trace, f);
        }

        Ok(())
    }

    /// Dump all frames whose time falls in `self.event_spec` to `f`, along
    /// with the mappings and raw data recorded at each one.
    fn dump_events_matching(&self, trace: &mut TraceReader, f: &mut dyn Write) -> io::Result<()> {
        let (start, end) = match self.event_spec {
            None => (0, FrameTime::MAX),
            Some((s, None)) => (s, s),
            Some((s, Some(e))) => (s, e),
        };

        // Mappings recorded before the first frame.
        if start == 0 {
            while let Some(km) = trace.read_mapped_region(TimeConstraint::CurrentTimeOnly) {
                if self.dump_mmaps && self.only_tid.map_or(true, |tid| tid == km.tid) {
                    dump_mapping(f, &km)?;
                }
            }
        }

        loop {
            let frame = match trace.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} (at {})", e, trace.coordinate()),
                    ))
                }
            };
            if end < frame.time() {
                return Ok(());
            }

            let selected = start <= frame.time()
                && self.only_tid.map_or(true, |tid| tid == frame.tid());
            if !selected {
                // Leave nothing behind that a later frame could mistake for
                // its own.
                while trace
                    .read_mapped_region(TimeConstraint::CurrentTimeOnly)
                    .is_some()
                {}
                continue;
            }

            if self.raw_dump {
                frame.dump_raw(Some(f))?;
            } else {
                frame.dump(Some(f))?;
            }

            while let Some(km) = trace.read_mapped_region(TimeConstraint::CurrentTimeOnly) {
                if self.dump_mmaps {
                    dump_mapping(f, &km)?;
                }
            }

            while let Some(data) = trace.read_raw_data_metadata_for_frame(&frame) {
                if self.dump_recorded_data_metadata {
                    writeln!(
                        f,
                        "  {{ tid:{}, addr:{}, length:{:#x} }}",
                        data.rec_tid, data.addr, data.size
                    )?;
                }
            }
        }
    }
}

fn dump_mapping(f: &mut dyn Write, km: &MappedRegionRecord) -> io::Result<()> {
    let source: Cow<str> = if km.copied {
        "<copied>".into()
    } else if km.is_anonymous() {
        "<anonymous>".into()
    } else {
        km.path.as_path().to_string_lossy()
    };
    writeln!(
        f,
        "  {{ map_time:{}, tid:{}, start:{}, end:{}, size:{:#x}, source:{} }}",
        km.time,
        km.tid,
        km.start,
        km.end,
        km.size(),
        source
    )
}

fn dump_statistics(trace: &TraceReader, f: &mut dyn Write) -> io::Result<()> {
    let ub = trace.uncompressed_bytes();
    let cb = trace.compressed_bytes();
    let ratio = if cb == 0 { 0.0 } else { ub as f64 / cb as f64 };

    writeln!(
        f,
        "// Uncompressed bytes {}, compressed bytes {}, ratio {:.2}",
        ub, cb, ratio
    )
}

impl RdCommand for DumpCommand {
    fn run(&mut self) -> io::Result<()> {
        self.dump(&mut stdout())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        event::{Event, SyscallState},
        remote_ptr::RemotePtr,
        task::test_task::FakeTask,
        trace::trace_writer::TraceWriter,
    };
    use std::path::Path;
    use structopt::StructOpt;

    fn sample_trace(out: &Path) -> PathBuf {
        let mut w = TraceWriter::open(Path::new("/bin/true"), Some(out));
        w.initialize();
        w.record_header(&["true"], &["HOME=/root"]);
        let a = FakeTask::new(10);
        let b = FakeTask::new(11);
        w.record_event(&a, Event::syscall(1, SyscallState::EnteringSyscall).encode());
        w.record_data(&a, RemotePtr::new_from_val(0x7000), &[0u8; 16]);
        w.record_event(&b, Event::sched().encode());
        w.record_mapping(
            MappedRegionRecord::anonymous(
                11,
                RemotePtr::new_from_val(0x10000),
                RemotePtr::new_from_val(0x11000),
            ),
            None,
        );
        w.record_event(&a, Event::syscall(1, SyscallState::ExitingSyscall).encode());
        w.record_termination(None);
        let dir = w.dir().to_owned();
        w.close();
        dir
    }

    fn run_dump(args: &[&str]) -> String {
        let opts = RdOptions::from_iter_safe(args).unwrap();
        let mut out = Vec::new();
        DumpCommand::new(&opts).dump(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dump_everything() {
        let out = tempfile::tempdir().unwrap();
        let dir = sample_trace(out.path());
        let dir_s = dir.to_str().unwrap();

        let text = run_dump(&["rd-trace", "dump", "-m", "-p", dir_s]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("{global_time:1, thread_time:1, event:`SYSCALL: entering 1'"));
        assert_eq!(lines[1], "  { tid:10, addr:0x7000, length:0x10 }");
        assert!(lines[2].starts_with("{global_time:2,"));
        assert!(lines[3].starts_with("  { map_time:2, tid:11, start:0x10000, end:0x11000"));
        assert!(lines[3].ends_with("source:<anonymous> }"));
        assert!(lines[5].contains("TRACE_TERMINATION"));
    }

    #[test]
    fn dump_filtered() {
        let out = tempfile::tempdir().unwrap();
        let dir = sample_trace(out.path());
        let dir_s = dir.to_str().unwrap();

        let text = run_dump(&["rd-trace", "dump", "-t", "10", "-p", dir_s, "2-3"]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("{global_time:3, thread_time:2,"));

        let raw = run_dump(&["rd-trace", "dump", "-r", "-s", dir_s, "1"]);
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("global_time thread_time tid event ticks r15"));
        assert!(lines[1].starts_with(" 1 1 10 "));
        assert!(lines[2].starts_with("// Uncompressed bytes"));
    }

    #[test]
    fn dump_mappings_around_the_first_frame() {
        let out = tempfile::tempdir().unwrap();
        let mut w = TraceWriter::open(Path::new("/bin/true"), Some(out.path()));
        w.initialize();
        w.record_header(&["true"], &[] as &[&str]);
        let exe = MappedRegionRecord::backed_by_file(
            10,
            RemotePtr::new_from_val(0x400000),
            RemotePtr::new_from_val(0x401000),
            Path::new("/bin/true"),
        )
        .unwrap();
        w.record_mapping(exe, None);
        w.record_event(&FakeTask::new(10), Event::sched().encode());
        w.record_mapping(
            MappedRegionRecord::anonymous(
                10,
                RemotePtr::new_from_val(0x7000),
                RemotePtr::new_from_val(0x7004),
            ),
            Some(b"abcd"),
        );
        w.record_event(&FakeTask::new(10), Event::sched().encode());
        let dir = w.dir().to_owned();
        w.close();

        let text = run_dump(&["rd-trace", "dump", "-p", dir.to_str().unwrap()]);
        let maps: Vec<&str> = text.lines().filter(|l| l.contains("map_time")).collect();
        assert_eq!(maps.len(), 2);
        assert!(maps[0].starts_with("  { map_time:0, tid:10, start:0x400000"));
        assert!(maps[0].ends_with("source:/bin/true }"));
        assert!(maps[1].starts_with("  { map_time:1, tid:10, start:0x7000"));
        assert!(maps[1].ends_with("source:<copied> }"));
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].starts_with("{global_time:1,"));
        assert_eq!(lines[2], maps[1]);
    }

    #[test]
    fn dump_missing_trace_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        let missing = out.path().join("nope-0");
        let opts =
            RdOptions::from_iter_safe(&["rd-trace", "dump", missing.to_str().unwrap()]).unwrap();
        let mut buf = Vec::new();
        assert!(DumpCommand::new(&opts).dump(&mut buf).is_err());
    }
}
