use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result};

/// The opaque 32-bit event token stored in every trace frame. The trace
/// machinery never looks inside it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct EncodedEvent(pub u32);

impl EncodedEvent {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for EncodedEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Events serve two purposes: tracking Task state during recording, and
/// being stored in traces to guide replay.
///
/// The discriminants are part of the encoded token. Don't reorder.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum EventType {
    EvUnassigned = 0,
    EvSentinel = 1,
    EvNoop = 2,
    EvDesched = 3,
    EvSeccompTrap = 4,
    EvSyscallInterruption = 5,
    /// Synthesized at the very end of a recording.
    EvTraceTermination = 6,
    /// No associated data.
    EvExit = 7,
    /// Scheduling signal interrupted the trace.
    EvSched = 8,
    /// A disabled RDTSC or CPUID instruction.
    EvInstructionTrap = 9,
    /// Recorded syscallbuf data for one or more buffered syscalls.
    EvSyscallbufFlush = 10,
    EvSyscallbufAbortCommit = 11,
    EvSyscallbufReset = 12,
    EvPatchSyscall = 13,
    /// Map memory pages due to a (future) memory access.
    EvGrowMap = 14,
    /// Data is the signal number.
    EvSignal = 15,
    EvSignalDelivery = 16,
    EvSignalHandler = 17,
    /// Data is the syscall number.
    EvSyscall = 18,
}

use EventType::*;

const ALL_EVENT_TYPES: [EventType; 19] = [
    EvUnassigned,
    EvSentinel,
    EvNoop,
    EvDesched,
    EvSeccompTrap,
    EvSyscallInterruption,
    EvTraceTermination,
    EvExit,
    EvSched,
    EvInstructionTrap,
    EvSyscallbufFlush,
    EvSyscallbufAbortCommit,
    EvSyscallbufReset,
    EvPatchSyscall,
    EvGrowMap,
    EvSignal,
    EvSignalDelivery,
    EvSignalHandler,
    EvSyscall,
];

impl EventType {
    fn from_u32(v: u32) -> Option<EventType> {
        ALL_EVENT_TYPES.get(v as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            EvUnassigned => "(unassigned)",
            EvSentinel => "(sentinel)",
            EvNoop => "NOOP",
            EvDesched => "DESCHED",
            EvSeccompTrap => "SECCOMP_TRAP",
            EvSyscallInterruption => "SYSCALL_INTERRUPTION",
            EvTraceTermination => "TRACE_TERMINATION",
            EvExit => "EXIT",
            EvSched => "SCHED",
            EvInstructionTrap => "INSTRUCTION_TRAP",
            EvSyscallbufFlush => "SYSCALLBUF_FLUSH",
            EvSyscallbufAbortCommit => "SYSCALLBUF_ABORT_COMMIT",
            EvSyscallbufReset => "SYSCALLBUF_RESET",
            EvPatchSyscall => "PATCH_SYSCALL",
            EvGrowMap => "GROW_MAP",
            EvSignal => "SIGNAL",
            EvSignalDelivery => "SIGNAL_DELIVERY",
            EvSignalHandler => "SIGNAL_HANDLER",
            EvSyscall => "SYSCALL",
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    /// Not present in trace. Just a dummy value.
    NoSyscall,
    EnteringSyscall,
    ExitingSyscall,
}

/// Minimal event classification. Packs into an `EncodedEvent` as
/// `type:6 | is_syscall_entry:1 | data:25` from the low bit up.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    event_type: EventType,
    state: SyscallState,
    data: u32,
}

const TYPE_BITS: u32 = 6;
const ENTRY_BIT: u32 = 1 << TYPE_BITS;
const DATA_SHIFT: u32 = TYPE_BITS + 1;
const MAX_DATA: u32 = (1 << (32 - DATA_SHIFT)) - 1;

impl Event {
    fn new(event_type: EventType, state: SyscallState, data: u32) -> Event {
        if data > MAX_DATA {
            fatal!("Event data {} does not fit in an encoded event", data);
        }
        Event {
            event_type,
            state,
            data,
        }
    }

    pub fn syscall(number: u32, state: SyscallState) -> Event {
        Event::new(EvSyscall, state, number)
    }

    pub fn exit() -> Event {
        Event::new(EvExit, SyscallState::NoSyscall, 0)
    }

    pub fn sched() -> Event {
        Event::new(EvSched, SyscallState::NoSyscall, 0)
    }

    pub fn trace_termination() -> Event {
        Event::new(EvTraceTermination, SyscallState::NoSyscall, 0)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn syscall_state(&self) -> SyscallState {
        self.state
    }

    pub fn encode(&self) -> EncodedEvent {
        let mut v = self.event_type as u32;
        if self.state == SyscallState::EnteringSyscall {
            v |= ENTRY_BIT;
        }
        EncodedEvent(v | (self.data << DATA_SHIFT))
    }

    /// `None` if the token doesn't name a known event type.
    pub fn decode(e: EncodedEvent) -> Option<Event> {
        let event_type = EventType::from_u32(e.0 & (ENTRY_BIT - 1))?;
        let state = if event_type != EvSyscall {
            SyscallState::NoSyscall
        } else if e.0 & ENTRY_BIT != 0 {
            SyscallState::EnteringSyscall
        } else {
            SyscallState::ExitingSyscall
        };
        Some(Event {
            event_type,
            state,
            data: e.0 >> DATA_SHIFT,
        })
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self.event_type {
            EvSyscall => {
                let phase = match self.state {
                    SyscallState::EnteringSyscall => "entering",
                    _ => "exiting",
                };
                write!(f, "{}: {} {}", self.event_type.name(), phase, self.data)
            }
            EvSignal | EvSignalDelivery | EvSignalHandler => {
                write!(f, "{}: {}", self.event_type.name(), self.data)
            }
            _ => write!(f, "{}", self.event_type.name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn syscall_phase_survives_encoding() {
        let enter = Event::syscall(60, SyscallState::EnteringSyscall);
        let exit = Event::syscall(60, SyscallState::ExitingSyscall);
        assert_ne!(enter.encode(), exit.encode());
        assert_eq!(Event::decode(enter.encode()), Some(enter));
        assert_eq!(Event::decode(exit.encode()), Some(exit));
        assert_eq!(format!("{}", enter), "SYSCALL: entering 60");
    }

    #[test]
    fn unknown_type_does_not_decode() {
        assert_eq!(Event::decode(EncodedEvent(0x3f)), None);
    }

    #[test]
    fn exit_has_no_syscall_state() {
        let ev = Event::decode(Event::exit().encode()).unwrap();
        assert_eq!(ev.event_type(), EvExit);
        assert_eq!(ev.syscall_state(), SyscallState::NoSyscall);
    }
}
