//! Record encodings. Every record is stored as `len: u32 | body` inside a
//! substream. Bodies are bincode with fixed-width little-endian integers, so
//! each record's layout is its struct's fields in declaration order:
//!
//! TraceFrame:
//!   kind u32 (0 event, 1 termination)
//!   event info: global_time u64, thread_time u64, tid i32, event u32
//!   exec info: ticks u64, extra: u8 tag [hw_interrupts u64, page_faults u64,
//!   instructions_retired u64], 27 registers u64 (user_regs_struct order)
//!
//! RawDataMetadata:
//!   time u64, rec_tid i32, addr u64, size u64
//!   (followed in the stream by `size` unframed content bytes)
//!
//! MappedRegionRecord:
//!   time u64, tid i32, copied u8, path bytes, dev u64, ino u64, mode u32,
//!   uid u32, gid u32, size i64, mtime i64, mtime_nsec i64, start u64, end u64
//!
//! TraceHeader:
//!   uuid [u8; 16], exe_image, cwd, argv, envp
//!
//! Sequences and byte strings are `len: u64 | data`. OS strings carry an
//! extra u32 tag in front (serde's unix/windows split).

use crate::trace::{
    mapped_region::MappedRegionRecord, trace_frame::TraceFrame, trace_stream::RawDataMetadata,
    trace_stream::TraceHeader,
};
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CodecError {
    pub reason: String,
}

pub type CodecResult<T> = Result<T, CodecError>;

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> CodecError {
        CodecError {
            reason: e.to_string(),
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Something stored as one framed record in a substream.
pub trait Record: Serialize + DeserializeOwned {
    /// Invariants the type system can't express. Run on every decoded record.
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

impl Record for TraceFrame {}

impl Record for RawDataMetadata {}

impl Record for TraceHeader {}

impl Record for MappedRegionRecord {
    fn check(&self) -> Result<(), &'static str> {
        if self.end < self.start {
            return Err("mapping ends before it starts");
        }
        Ok(())
    }
}

/// Decode a whole record body. Every byte must be consumed.
pub fn decode_record<R: Record>(body: &[u8]) -> CodecResult<R> {
    let r: R = options().deserialize(body)?;
    r.check().map_err(|reason| CodecError {
        reason: reason.to_owned(),
    })?;
    Ok(r)
}

/// Encode `r` into `buf`, replacing its contents.
pub fn encode_record<R: Record>(r: &R, buf: &mut Vec<u8>) -> CodecResult<()> {
    buf.clear();
    options().serialize_into(&mut *buf, r)?;
    Ok(())
}
