use crate::trace::{trace_error::TraceError, trace_frame::FrameTime};

/// The single total order shared by every frame in a trace. The first frame
/// gets time 1; 0 means "nothing yet".
#[derive(Copy, Clone, Default, Debug)]
pub struct GlobalSequencer {
    time: FrameTime,
}

impl GlobalSequencer {
    pub fn new() -> GlobalSequencer {
        GlobalSequencer { time: 0 }
    }

    /// Hand out the next time. Recording side.
    pub fn next(&mut self) -> FrameTime {
        match self.time.checked_add(1) {
            Some(t) => {
                self.time = t;
                t
            }
            None => fatal!("Global time overflowed after {}", self.time),
        }
    }

    pub fn current(&self) -> FrameTime {
        self.time
    }

    /// Adopt the time of a frame just read. Replay side.
    /// Anything but the immediate successor means frames were lost or
    /// reordered.
    pub fn advance_to(&mut self, t: FrameTime) -> Result<(), TraceError> {
        let expected = self.time.wrapping_add(1);
        if t != expected || expected == 0 {
            return Err(TraceError::TimeMismatch { expected, found: t });
        }
        self.time = t;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.time = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn next_counts_from_one() {
        let mut s = GlobalSequencer::new();
        assert_eq!(s.current(), 0);
        assert_eq!(s.next(), 1);
        assert_eq!(s.next(), 2);
        assert_eq!(s.current(), 2);
    }

    #[test]
    fn advance_rejects_gaps() {
        let mut s = GlobalSequencer::new();
        s.advance_to(1).unwrap();
        match s.advance_to(3) {
            Err(TraceError::TimeMismatch { expected, found }) => {
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            }
            _ => panic!("expected a time mismatch"),
        }
        assert_eq!(s.current(), 1);
        assert!(s.advance_to(1).is_err());
    }
}
