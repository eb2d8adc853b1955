use crate::{
    event::{EncodedEvent, Event},
    registers::Registers,
};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::{
    io,
    io::{stdout, Write},
};

/// DIFF NOTE: This is i64 in rr
pub type FrameTime = u64;

/// Retired conditional branches.
pub type Ticks = u64;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum FrameKind {
    Event,
    /// The last frame of a completed recording.
    Termination,
}

/// Ordering and identity of a frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct EventInfo {
    pub global_time: FrameTime,
    pub thread_time: FrameTime,
    pub tid: pid_t,
    pub ev: EncodedEvent,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ExtraPerfCounters {
    pub hw_interrupts: u64,
    pub page_faults: u64,
    pub instructions_retired: u64,
}

/// Execution state captured with a frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ExecInfo {
    pub ticks: Ticks,
    pub extra: Option<ExtraPerfCounters>,
    pub regs: Registers,
}

/// We DONT want Copy
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TraceFrame {
    pub(super) kind: FrameKind,
    pub(super) event_info: EventInfo,
    pub(super) exec_info: ExecInfo,
}

impl TraceFrame {
    pub fn new_with(kind: FrameKind, event_info: EventInfo, exec_info: ExecInfo) -> TraceFrame {
        TraceFrame {
            kind,
            event_info,
            exec_info,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }
    pub fn is_termination(&self) -> bool {
        self.kind == FrameKind::Termination
    }
    pub fn time(&self) -> FrameTime {
        self.event_info.global_time
    }
    pub fn thread_time(&self) -> FrameTime {
        self.event_info.thread_time
    }
    pub fn tid(&self) -> pid_t {
        self.event_info.tid
    }
    pub fn event(&self) -> EncodedEvent {
        self.event_info.ev
    }
    pub fn ticks(&self) -> Ticks {
        self.exec_info.ticks
    }
    pub fn extra_perf_counters(&self) -> Option<&ExtraPerfCounters> {
        self.exec_info.extra.as_ref()
    }
    pub fn regs_ref(&self) -> &Registers {
        &self.exec_info.regs
    }

    fn write_event(&self, out: &mut dyn Write) -> io::Result<()> {
        match Event::decode(self.event()) {
            Some(ev) => write!(out, "{}", ev),
            None => write!(out, "UNKNOWN({})", self.event()),
        }
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), including a newline character.
    pub fn dump(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            "{{global_time:{}, thread_time:{}, event:`",
            self.time(),
            self.thread_time()
        )?;
        self.write_event(out)?;
        write!(out, "' tid:{}, ticks:{}", self.tid(), self.ticks())?;
        if let Some(extra) = self.extra_perf_counters() {
            write!(
                out,
                ", hw_interrupts:{}, page_faults:{}, instructions_retired:{}",
                extra.hw_interrupts, extra.page_faults, extra.instructions_retired
            )?;
        }
        write!(out, "}} ")?;
        self.regs_ref().write_register_file_compact(out)?;
        writeln!(out)
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), including a newline character.  An
    /// easily machine-parseable format is dumped.
    pub fn dump_raw(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            " {} {} {} {} {}",
            self.time(),
            self.thread_time(),
            self.tid(),
            self.event().as_u32(),
            self.ticks()
        )?;
        self.regs_ref().write_register_file_for_trace_raw(out)?;
        writeln!(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::SyscallState;
    use crate::registers::REGISTER_COUNT;

    fn frame() -> TraceFrame {
        let mut regs = Registers::default();
        regs.rip = 0x401000;
        TraceFrame::new_with(
            FrameKind::Event,
            EventInfo {
                global_time: 7,
                thread_time: 3,
                tid: 42,
                ev: Event::syscall(0, SyscallState::ExitingSyscall).encode(),
            },
            ExecInfo {
                ticks: 1000,
                extra: None,
                regs,
            },
        )
    }

    #[test]
    fn dump_is_one_line() {
        let mut out: Vec<u8> = Vec::new();
        frame().dump(Some(&mut out)).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(s.matches('\n').count(), 1);
        assert!(s.starts_with("{global_time:7, thread_time:3, event:`SYSCALL: exiting 0' tid:42"));
        assert!(s.contains("rip:0x401000"));
    }

    #[test]
    fn dump_raw_has_every_register() {
        let mut out: Vec<u8> = Vec::new();
        frame().dump_raw(Some(&mut out)).unwrap();
        let s = String::from_utf8(out).unwrap();
        let fields: Vec<&str> = s.split_whitespace().collect();
        assert_eq!(fields.len(), 5 + REGISTER_COUNT);
        assert_eq!(fields[0], "7");
        assert_eq!(fields[2], "42");
    }
}
