use crate::registers::Registers;
use crate::trace::trace_frame::{ExtraPerfCounters, Ticks};
use libc::pid_t;

/// What the trace writer needs from a recorded task. Attaching, stopping and
/// reading tracee state all happen behind this boundary.
pub trait RecordTask {
    fn tid(&self) -> pid_t;

    /// Register file at the current stop.
    fn regs(&self) -> Registers;

    /// Retired conditional branch count since the task started.
    fn ticks(&self) -> Ticks;

    /// Only consulted when built with the `extra_perf_counters` feature.
    fn extra_perf_counters(&self) -> Option<ExtraPerfCounters> {
        None
    }
}

#[cfg(test)]
pub mod test_task {
    use super::*;

    /// A task whose state is set directly by the test.
    #[derive(Clone, Default)]
    pub struct FakeTask {
        pub tid: pid_t,
        pub regs: Registers,
        pub ticks: Ticks,
    }

    impl FakeTask {
        pub fn new(tid: pid_t) -> FakeTask {
            FakeTask {
                tid,
                ..Default::default()
            }
        }
    }

    impl RecordTask for FakeTask {
        fn tid(&self) -> pid_t {
            self.tid
        }

        fn regs(&self) -> Registers {
            self.regs
        }

        fn ticks(&self) -> Ticks {
            self.ticks
        }

        fn extra_perf_counters(&self) -> Option<ExtraPerfCounters> {
            Some(ExtraPerfCounters {
                hw_interrupts: 3,
                page_faults: 2,
                instructions_retired: self.ticks * 4,
            })
        }
    }
}
