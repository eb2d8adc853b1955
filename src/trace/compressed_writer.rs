use crate::{
    scoped_fd::ScopedFd,
    trace::{
        codec::{encode_record, Record},
        trace_error::TraceError,
    },
    util::{errno_to_io, write_all},
};
use brotli_sys::{
    BrotliEncoderCompressStream, BrotliEncoderCreateInstance, BrotliEncoderDestroyInstance,
    BrotliEncoderSetParameter, BROTLI_OPERATION_FINISH, BROTLI_OPERATION_PROCESS,
    BROTLI_PARAM_QUALITY,
};
use nix::{fcntl::OFlag, sys::stat::Mode, unistd::fsync};
use std::{
    io::{Error, ErrorKind},
    mem::size_of,
    path::{Path, PathBuf},
    ptr,
};

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Sync {
    DontSync,
    Sync,
}

/// Precedes every compressed block. Stored little-endian.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct BlockHeader {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    /// crc32 of the uncompressed data.
    pub checksum: u32,
}

pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

assert_eq_size!(BlockHeader, [u8; 12]);

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut b = [0u8; BLOCK_HEADER_SIZE];
        b[0..4].copy_from_slice(&self.compressed_length.to_le_bytes());
        b[4..8].copy_from_slice(&self.uncompressed_length.to_le_bytes());
        b[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; BLOCK_HEADER_SIZE]) -> BlockHeader {
        let word = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        BlockHeader {
            compressed_length: word(0),
            uncompressed_length: word(4),
            checksum: word(8),
        }
    }
}

/// CompressedWriter opens an output file and writes compressed blocks to it.
/// Data is buffered until `block_size` bytes have accumulated (or the writer
/// is flushed), then compressed with brotli and written preceded by a
/// `BlockHeader`.
///
/// Each data block is compressed independently, so a reader can stop at any
/// block boundary.
pub struct CompressedWriter {
    fd: ScopedFd,
    path: PathBuf,
    block_size: usize,
    buffer: Vec<u8>,
    /// Reused for every block.
    output_buffer: Vec<u8>,
    /// Scratch for `write_record()`.
    record_buffer: Vec<u8>,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
    error: bool,
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        if self.fd.is_open() {
            if let Err(e) = self.close(Sync::DontSync) {
                log!(crate::log::LogError, "{}", e);
            }
        }
    }
}

impl CompressedWriter {
    pub fn new(path: &Path, block_size: usize) -> Result<CompressedWriter, TraceError> {
        let fd = ScopedFd::try_open_path_with_mode(
            path,
            OFlag::O_CLOEXEC | OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| TraceError::io(path, e))?;

        Ok(CompressedWriter {
            fd,
            path: path.to_owned(),
            block_size,
            buffer: Vec::with_capacity(block_size),
            output_buffer: Vec::new(),
            record_buffer: Vec::new(),
            uncompressed_bytes: 0,
            compressed_bytes: 0,
            error: false,
        })
    }

    /// Encode `record` and write it length-prefixed.
    pub fn write_record<R: Record>(&mut self, record: &R) -> Result<(), TraceError> {
        let mut rec = std::mem::take(&mut self.record_buffer);
        let res = match encode_record(record, &mut rec) {
            Ok(()) => self.write_record_body(&rec),
            Err(e) => Err(TraceError::Encode { reason: e.reason }),
        };
        self.record_buffer = rec;
        res
    }

    /// Write an already encoded body length-prefixed.
    pub fn write_record_body(&mut self, body: &[u8]) -> Result<(), TraceError> {
        self.write_bytes(&(body.len() as u32).to_le_bytes())?;
        self.write_bytes(body)
    }

    /// Append unframed bytes.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<(), TraceError> {
        if self.error || !self.fd.is_open() {
            return Err(TraceError::io(
                &self.path,
                Error::new(ErrorKind::Other, "write to a closed or failed stream"),
            ));
        }
        while !data.is_empty() {
            let amount = std::cmp::min(self.block_size - self.buffer.len(), data.len());
            self.buffer.extend_from_slice(&data[..amount]);
            data = &data[amount..];
            if self.buffer.len() == self.block_size {
                self.write_block()?;
            }
        }
        Ok(())
    }

    /// Compress and write whatever is buffered. Does nothing if the buffer is
    /// empty.
    fn write_block(&mut self) -> Result<(), TraceError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        // Add slop for incompressible data
        let max_len = self.buffer.len() + self.buffer.len() / 8 + 1024 + BLOCK_HEADER_SIZE;
        self.output_buffer.resize(max_len, 0);
        let compressed_length =
            unsafe { do_compress(&self.buffer, &mut self.output_buffer[BLOCK_HEADER_SIZE..]) };
        if compressed_length == 0 {
            self.error = true;
            return Err(TraceError::io(
                &self.path,
                Error::new(ErrorKind::Other, "brotli compression failed"),
            ));
        }

        let header = BlockHeader {
            compressed_length: compressed_length as u32,
            uncompressed_length: self.buffer.len() as u32,
            checksum: crc32fast::hash(&self.buffer),
        };
        self.output_buffer[..BLOCK_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let total = BLOCK_HEADER_SIZE + compressed_length;
        if let Err(e) = write_all(self.fd.as_raw(), &self.output_buffer[..total]) {
            self.error = true;
            return Err(TraceError::io(&self.path, e));
        }

        log!(
            crate::log::LogDebug,
            "{}: block of {} bytes compressed to {}",
            self.path.display(),
            header.uncompressed_length,
            compressed_length
        );
        self.uncompressed_bytes += self.buffer.len() as u64;
        self.compressed_bytes += total as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Make everything written so far readable, and optionally durable.
    pub fn flush_blocks(&mut self, sync: Sync) -> Result<(), TraceError> {
        if !self.fd.is_open() {
            return Ok(());
        }
        self.write_block()?;
        if sync == Sync::Sync {
            if let Err(e) = fsync(self.fd.as_raw()) {
                self.error = true;
                return Err(TraceError::io(&self.path, errno_to_io(e)));
            }
        }
        Ok(())
    }

    pub fn close(&mut self, sync: Sync) -> Result<(), TraceError> {
        if !self.fd.is_open() {
            return Ok(());
        }
        let res = self.flush_blocks(sync);
        self.fd.close();
        res
    }

    /// Bytes handed to us so far, including what is still buffered.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes + self.buffer.len() as u64
    }

    /// Bytes actually written to the file, headers included.
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }
}

/// See http://robert.ocallahan.org/2017/07/selecting-compression-algorithm-for-rr.html
const RD_BROTLI_LEVEL: u32 = 5;

/// Returns the compressed length, 0 on failure.
unsafe fn do_compress(input: &[u8], output_buf: &mut [u8]) -> usize {
    let state = BrotliEncoderCreateInstance(None, None, ptr::null_mut());
    if state.is_null() {
        fatal!("BrotliEncoderCreateInstance failed");
    }

    if 0 == BrotliEncoderSetParameter(state, BROTLI_PARAM_QUALITY, RD_BROTLI_LEVEL) {
        fatal!("Brotli initialization failed");
    }

    let mut ret: usize = 0;
    let mut output_buf_len: usize = output_buf.len();
    let mut outp: *mut u8 = output_buf.as_mut_ptr();
    let mut uncompressed_len: usize = input.len();
    let mut inp: *const u8 = input.as_ptr();
    while uncompressed_len > 0 {
        if 0 == BrotliEncoderCompressStream(
            state,
            BROTLI_OPERATION_PROCESS,
            &mut uncompressed_len,
            &mut inp,
            &mut output_buf_len,
            &mut outp,
            &mut ret,
        ) {
            BrotliEncoderDestroyInstance(state);
            return 0;
        }
    }
    let mut zero: usize = 0;
    if 0 == BrotliEncoderCompressStream(
        state,
        BROTLI_OPERATION_FINISH,
        &mut zero,
        &mut inp,
        &mut output_buf_len,
        &mut outp,
        &mut ret,
    ) {
        ret = 0;
    }

    BrotliEncoderDestroyInstance(state);
    ret
}
