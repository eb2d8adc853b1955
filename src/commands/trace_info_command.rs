use crate::{
    commands::{
        rd_options::{RdOptions, RdSubCommand},
        RdCommand,
    },
    trace::{
        trace_frame::{FrameKind, FrameTime},
        trace_reader::TraceReader,
    },
};
use libc::pid_t;
use serde::Serialize;
use std::{
    ffi::OsString,
    io,
    io::{stdout, Write},
    path::PathBuf,
};

pub struct TraceInfoCommand {
    trace_dir: Option<PathBuf>,
}

impl TraceInfoCommand {
    pub fn new(options: &RdOptions) -> TraceInfoCommand {
        match options.cmd.clone() {
            RdSubCommand::TraceInfo { trace_dir } => TraceInfoCommand { trace_dir },
            _ => fatal!("Unexpected RdSubCommand variant. Not a `TraceInfo` variant!"),
        }
    }

    fn info(&self) -> io::Result<TraceInfo> {
        let mut trace = TraceReader::try_open(self.trace_dir.as_deref())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let header = trace.load_header();

        let mut info = TraceInfo {
            uuid: header.uuid_string(),
            exe_image: lossy(&header.exe_image),
            cwd: lossy(&header.cwd),
            argv: header.argv.iter().map(lossy).collect(),
            environ: header.envp.iter().map(lossy).collect(),
            main_thread: None,
            frames: 0,
            last_time: 0,
            terminated: false,
            incomplete: trace.is_incomplete(),
            uncompressed_bytes: trace.uncompressed_bytes(),
            compressed_bytes: trace.compressed_bytes(),
        };

        loop {
            match trace.next_frame() {
                Ok(Some(frame)) => {
                    info.main_thread.get_or_insert(frame.tid());
                    info.frames += 1;
                    info.last_time = frame.time();
                    info.terminated = frame.kind() == FrameKind::Termination;
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} (at {})", e, trace.coordinate()),
                    ))
                }
            }
        }
        Ok(info)
    }
}

fn lossy(s: &OsString) -> String {
    s.to_string_lossy().into_owned()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfo {
    uuid: String,
    exe_image: String,
    cwd: String,
    argv: Vec<String>,
    environ: Vec<String>,
    main_thread: Option<pid_t>,
    frames: u64,
    last_time: FrameTime,
    terminated: bool,
    incomplete: bool,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

impl RdCommand for TraceInfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let info = self.info()?;
        let serialized = serde_json::to_string(&info)?;
        writeln!(stdout(), "{}", serialized)
    }
}
