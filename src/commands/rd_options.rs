use crate::trace::trace_frame::FrameTime;
use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rd-trace",
    about = "Inspect traces recorded by rd",
    after_help = "Use RD_LOG to control logging; e.g. RD_LOG=all:warn,trace_reader:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct RdOptions {
    #[structopt(subcommand)]
    pub cmd: RdSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum RdSubCommand {
    /// Dump data from the recorded trace
    #[structopt(name = "dump")]
    Dump {
        /// Dump recorded data metadata
        #[structopt(short = "m", long)]
        recorded_metadata: bool,

        /// Dump mmap data
        #[structopt(short = "p", long)]
        mmaps: bool,

        /// Dump trace frames in a more easily machine-parseable
        /// format instead of the default human-readable format
        #[structopt(short = "r", long = "raw")]
        raw_dump: bool,

        /// Dump statistics about the trace
        #[structopt(short = "s", long)]
        statistics: bool,

        /// Dump events only for the specified tid
        #[structopt(short = "t", long = "tid")]
        only_tid: Option<libc::pid_t>,

        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,

        /// Event specs can be either an event number like `127`, or a range
        /// like `1000-5000`. By default, all events are dumped
        #[structopt(parse(try_from_str = parse_range))]
        event_spec: Option<(FrameTime, Option<FrameTime>)>,
    },

    /// Dump trace header in JSON format.
    #[structopt(name = "trace-info")]
    TraceInfo {
        /// Which directory is the trace data in? If omitted the latest trace dir is used
        trace_dir: Option<PathBuf>,
    },
}

pub fn parse_range(range_or_single: &str) -> Result<(FrameTime, Option<FrameTime>), Box<dyn Error>> {
    let mut parts = range_or_single.splitn(2, '-');
    let low = parts.next().unwrap_or("").trim().parse::<FrameTime>()?;
    let high = match parts.next() {
        Some(h) => Some(h.trim().parse::<FrameTime>()?),
        None => None,
    };
    match high {
        Some(h) if h < low => Err(Box::new(clap::Error::with_description(
            "The end of an event range can't precede its start",
            clap::ErrorKind::InvalidValue,
        ))),
        _ => Ok((low, high)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(parse_range("127").unwrap(), (127, None));
        assert_eq!(parse_range("1000-5000").unwrap(), (1000, Some(5000)));
        assert!(parse_range("5000-1000").is_err());
        assert!(parse_range("x-3").is_err());
    }

    #[test]
    fn dump_args() {
        let opts =
            RdOptions::from_iter_safe(&["rd-trace", "dump", "-r", "-t", "42", "ls-0", "3-9"])
                .unwrap();
        match opts.cmd {
            RdSubCommand::Dump {
                raw_dump,
                only_tid,
                trace_dir,
                event_spec,
                mmaps,
                ..
            } => {
                assert!(raw_dump);
                assert!(!mmaps);
                assert_eq!(only_tid, Some(42));
                assert_eq!(trace_dir, Some(PathBuf::from("ls-0")));
                assert_eq!(event_spec, Some((3, Some(9))));
            }
            _ => panic!("expected dump"),
        }
    }
}
