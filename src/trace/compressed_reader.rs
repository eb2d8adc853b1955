use crate::{
    scoped_fd::ScopedFd,
    trace::{
        compressed_writer::{BlockHeader, BLOCK_HEADER_SIZE},
        trace_error::TraceError,
    },
    util::pread_all,
};
use brotli_sys::{BrotliDecoderDecompress, BROTLI_DECODER_RESULT_SUCCESS};
use nix::{fcntl::OFlag, sys::stat::Mode};
use std::{
    cmp::min,
    path::{Path, PathBuf},
};

/// Refuse blocks claiming to be bigger than this; the writer never produces
/// them and a corrupt length shouldn't make us allocate gigabytes.
const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

struct SavedState {
    fd_offset: u64,
    block_offset: u64,
    eof: bool,
    buffer_read_pos: usize,
}

/// CompressedReader opens an input file written by CompressedWriter
/// and reads data from it. Data is decompressed by the thread that
/// calls read().
pub struct CompressedReader {
    /// We don't rely on the fd's file position. Instead track the current
    /// position in fd_offset and use pread.
    fd_offset: u64,
    /// Offset of the block currently in `buffer`. For diagnostics.
    block_offset: u64,
    fd: ScopedFd,
    path: PathBuf,
    stream_name: String,
    eof: bool,
    buffer: Vec<u8>,
    buffer_read_pos: usize,
    compressed: Vec<u8>,

    saved: Option<SavedState>,
    saved_buffer: Vec<u8>,
}

impl CompressedReader {
    pub fn new(path: &Path) -> Result<CompressedReader, TraceError> {
        let fd = ScopedFd::try_open_path_with_mode(
            path,
            OFlag::O_CLOEXEC | OFlag::O_RDONLY,
            Mode::empty(),
        )
        .map_err(|e| TraceError::io(path, e))?;
        let stream_name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => path.display().to_string(),
        };

        Ok(CompressedReader {
            fd_offset: 0,
            block_offset: 0,
            fd,
            path: path.to_owned(),
            stream_name,
            eof: false,
            buffer: Vec::new(),
            buffer_read_pos: 0,
            compressed: Vec::new(),
            saved: None,
            saved_buffer: Vec::new(),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Offset in the file of the block we're reading from.
    pub fn block_offset(&self) -> u64 {
        self.block_offset
    }

    fn truncated(&self, offset: u64) -> TraceError {
        TraceError::Truncated {
            stream: self.stream_name.clone(),
            offset,
        }
    }

    fn corrupt(&self, offset: u64, reason: String) -> TraceError {
        TraceError::Corrupt {
            stream: self.stream_name.clone(),
            offset,
            reason,
        }
    }

    /// Returns true if there's no more data, at a block boundary.
    pub fn at_end(&mut self) -> Result<bool, TraceError> {
        if self.buffer_read_pos < self.buffer.len() {
            return Ok(false);
        }
        Ok(!self.refill_buffer()?)
    }

    /// Fill `data` completely. Running out of blocks part way is truncation.
    pub fn read(&mut self, data: &mut [u8]) -> Result<(), TraceError> {
        let mut done = 0;
        while done < data.len() {
            if self.buffer_read_pos == self.buffer.len() && !self.refill_buffer()? {
                let offset = self.fd_offset;
                return Err(self.truncated(offset));
            }
            let amount = min(
                data.len() - done,
                self.buffer.len() - self.buffer_read_pos,
            );
            data[done..done + amount]
                .copy_from_slice(&self.buffer[self.buffer_read_pos..self.buffer_read_pos + amount]);
            self.buffer_read_pos += amount;
            done += amount;
        }
        Ok(())
    }

    /// Read a `len: u32 | body` record into `out`, replacing its contents.
    /// `Ok(false)` means a clean end of stream before the record started.
    pub fn read_record(&mut self, out: &mut Vec<u8>) -> Result<bool, TraceError> {
        if self.at_end()? {
            return Ok(false);
        }
        let mut len_bytes = [0u8; 4];
        self.read(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BLOCK_SIZE {
            let offset = self.block_offset;
            return Err(self.corrupt(offset, format!("record length {} is implausible", len)));
        }
        out.resize(len, 0);
        self.read(out)?;
        Ok(true)
    }

    /// Advances the read position by the given size.
    pub fn skip(&mut self, mut size: usize) -> Result<(), TraceError> {
        while size > 0 {
            if self.buffer_read_pos == self.buffer.len() && !self.refill_buffer()? {
                let offset = self.fd_offset;
                return Err(self.truncated(offset));
            }
            let amount = min(size, self.buffer.len() - self.buffer_read_pos);
            self.buffer_read_pos += amount;
            size -= amount;
        }
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.fd_offset = 0;
        self.block_offset = 0;
        self.buffer.clear();
        self.buffer_read_pos = 0;
        self.eof = false;
        self.saved = None;
    }

    /// Save the current position. Nested saves are not allowed.
    pub fn save_state(&mut self) {
        if self.saved.is_some() {
            fatal!("Nested save_state() on {}", self.stream_name);
        }
        self.saved_buffer.clear();
        self.saved_buffer.extend_from_slice(&self.buffer);
        self.saved = Some(SavedState {
            fd_offset: self.fd_offset,
            block_offset: self.block_offset,
            eof: self.eof,
            buffer_read_pos: self.buffer_read_pos,
        });
    }

    /// Restore previously saved position.
    pub fn restore_state(&mut self) {
        let s = match self.saved.take() {
            Some(s) => s,
            None => fatal!("restore_state() without save_state() on {}", self.stream_name),
        };
        std::mem::swap(&mut self.buffer, &mut self.saved_buffer);
        self.fd_offset = s.fd_offset;
        self.block_offset = s.block_offset;
        self.eof = s.eof;
        self.buffer_read_pos = s.buffer_read_pos;
    }

    /// Discard saved position
    pub fn discard_state(&mut self) {
        if self.saved.take().is_none() {
            fatal!("discard_state() without save_state() on {}", self.stream_name);
        }
    }

    /// Gathers stats on the file stream. These are independent of what's
    /// actually been read.
    pub fn uncompressed_bytes(&self) -> Result<u64, TraceError> {
        let mut total = 0;
        self.for_each_header(|h| total += h.uncompressed_length as u64)?;
        Ok(total)
    }

    pub fn compressed_bytes(&self) -> Result<u64, TraceError> {
        let mut total = 0;
        self.for_each_header(|h| {
            total += (BLOCK_HEADER_SIZE + h.compressed_length as usize) as u64
        })?;
        Ok(total)
    }

    fn for_each_header<F: FnMut(&BlockHeader)>(&self, mut f: F) -> Result<(), TraceError> {
        let mut offset = 0u64;
        loop {
            let mut raw = [0u8; BLOCK_HEADER_SIZE];
            let n = pread_all(self.fd.as_raw(), &mut raw, offset)
                .map_err(|e| TraceError::io(&self.path, e))?;
            if n == 0 {
                return Ok(());
            }
            if n < BLOCK_HEADER_SIZE {
                return Err(TraceError::Truncated {
                    stream: self.stream_name.clone(),
                    offset,
                });
            }
            let h = BlockHeader::from_bytes(&raw);
            f(&h);
            offset += (BLOCK_HEADER_SIZE + h.compressed_length as usize) as u64;
        }
    }

    /// Decompress the next block into `buffer`. `Ok(false)` at a clean end of
    /// file. The block buffers are reused so steady-state reads don't
    /// allocate.
    fn refill_buffer(&mut self) -> Result<bool, TraceError> {
        if self.eof {
            return Ok(false);
        }

        let offset = self.fd_offset;
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        let n = pread_all(self.fd.as_raw(), &mut raw, offset)
            .map_err(|e| TraceError::io(&self.path, e))?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        if n < BLOCK_HEADER_SIZE {
            return Err(self.truncated(offset));
        }

        let header = BlockHeader::from_bytes(&raw);
        let compressed_len = header.compressed_length as usize;
        let uncompressed_len = header.uncompressed_length as usize;
        if compressed_len == 0
            || uncompressed_len == 0
            || compressed_len > MAX_BLOCK_SIZE
            || uncompressed_len > MAX_BLOCK_SIZE
        {
            return Err(self.corrupt(
                offset,
                format!(
                    "bad block header ({} compressed, {} uncompressed)",
                    compressed_len, uncompressed_len
                ),
            ));
        }

        self.compressed.resize(compressed_len, 0);
        let payload_offset = offset + BLOCK_HEADER_SIZE as u64;
        let n = pread_all(self.fd.as_raw(), &mut self.compressed, payload_offset)
            .map_err(|e| TraceError::io(&self.path, e))?;
        if n < compressed_len {
            return Err(self.truncated(offset));
        }

        self.buffer.resize(uncompressed_len, 0);
        let mut decoded_size: usize = uncompressed_len;
        let result = unsafe {
            BrotliDecoderDecompress(
                compressed_len,
                self.compressed.as_ptr(),
                &mut decoded_size,
                self.buffer.as_mut_ptr(),
            )
        };
        if result != BROTLI_DECODER_RESULT_SUCCESS || decoded_size != uncompressed_len {
            return Err(self.corrupt(offset, "brotli decompression failed".to_owned()));
        }
        if crc32fast::hash(&self.buffer) != header.checksum {
            return Err(self.corrupt(offset, "checksum mismatch".to_owned()));
        }

        self.block_offset = offset;
        self.fd_offset = payload_offset + compressed_len as u64;
        self.buffer_read_pos = 0;
        Ok(true)
    }
}
