pub mod codec;
mod compressed_reader;
mod compressed_writer;
pub mod mapped_region;
pub mod sequencer;
pub mod trace_error;
pub mod trace_frame;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;
