//! Framed, seekable-by-block compressed I/O.
//!
//! A compressed partition file is a sequence of independently-compressed
//! blocks, each prefixed by its compressed and raw lengths. Framing at a
//! fixed block size (rather than compressing the whole stream as one LZ4
//! frame) lets a reader resume at any block boundary without decompressing
//! everything before it. Readers cross block boundaries transparently:
//! [`Lz4BlockReader`]
//! implements [`Read`] and refills its internal buffer from the next block
//! once the current one is exhausted.
//!
//! The raw (uncompressed) path is a thin passthrough so callers can treat
//! compressed and raw partition files identically above this module.

use std::io::{self, Read, Write};

/// Default block size: large enough to amortize LZ4 frame overhead, small
/// enough that a partial read doesn't force decompressing an unreasonable
/// amount of trailing data.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20; // 1 MiB

/// Buffers writes and flushes them as independently LZ4-compressed blocks.
///
/// Each block on the wire is `[compressed_len:u32][raw_len:u32][compressed
/// bytes]`. The final partial block is flushed by [`Self::finish`]; skipping
/// that call loses buffered data and is a writer bug, not a format concern.
pub struct Lz4BlockWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    block_size: usize,
}

impl<W: Write> Lz4BlockWriter<W> {
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self::with_block_size(inner, DEFAULT_BLOCK_SIZE)
    }

    #[must_use]
    pub fn with_block_size(inner: W, block_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(block_size),
            block_size,
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::block::compress(&self.buf);
        #[allow(clippy::cast_possible_truncation)]
        let compressed_len = compressed.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        let raw_len = self.buf.len() as u32;
        self.inner.write_all(&compressed_len.to_le_bytes())?;
        self.inner.write_all(&raw_len.to_le_bytes())?;
        self.inner.write_all(&compressed)?;
        self.buf.clear();
        Ok(())
    }

    /// Flushes any buffered bytes as a final block and returns the
    /// underlying writer. Failing to call this (or dropping the writer
    /// instead) silently drops the last block, so treat it as a fatal
    /// error if it fails.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Lz4BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let space = self.block_size.saturating_sub(self.buf.len());
            let take = space.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() >= self.block_size {
                self.flush_block()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Intentionally does not flush a partial block: blocks are only
        // finalized by `finish`, so mid-stream readers never see a runt
        // block they'd have to special-case.
        self.inner.flush()
    }
}

/// Reads the block stream produced by [`Lz4BlockWriter`], decompressing one
/// block at a time and serving bytes out of an internal cursor.
pub struct Lz4BlockReader<R: Read> {
    inner: R,
    current: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> Lz4BlockReader<R> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            current: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.inner, &mut len_buf)? {
            false => {
                self.eof = true;
                Ok(false)
            }
            true => {
                let compressed_len = u32::from_le_bytes(len_buf) as usize;
                self.inner.read_exact(&mut len_buf)?;
                let raw_len = u32::from_le_bytes(len_buf) as usize;
                let mut compressed = vec![0u8; compressed_len];
                self.inner.read_exact(&mut compressed)?;
                self.current = lz4_flex::block::decompress(&compressed, raw_len)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.pos = 0;
                Ok(true)
            }
        }
    }
}

impl<R: Read> Read for Lz4BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.current.len() && !self.refill()? {
            return Ok(0);
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// `read_exact`, but returns `Ok(false)` instead of erroring when the
/// stream is exhausted before a single byte is read (clean EOF at a block
/// boundary, as opposed to a truncated block).
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated block frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Either side of the raw/compressed split selected by a partition file's
/// `compressed` flag.
pub enum Sink<W: Write> {
    Raw(W),
    Compressed(Lz4BlockWriter<W>),
}

impl<W: Write> Sink<W> {
    #[must_use]
    pub fn new(inner: W, compressed: bool) -> Self {
        if compressed {
            Self::Compressed(Lz4BlockWriter::new(inner))
        } else {
            Self::Raw(inner)
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Raw(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Compressed(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Raw(w) => w.write(data),
            Self::Compressed(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Raw(w) => w.flush(),
            Self::Compressed(w) => w.flush(),
        }
    }
}

pub enum Source<R: Read> {
    Raw(R),
    Compressed(Lz4BlockReader<R>),
}

impl<R: Read> Source<R> {
    #[must_use]
    pub fn new(inner: R, compressed: bool) -> Self {
        if compressed {
            Self::Compressed(Lz4BlockReader::new(inner))
        } else {
            Self::Raw(inner)
        }
    }
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(r) => r.read(buf),
            Self::Compressed(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_small_write() {
        let mut w = Lz4BlockWriter::new(Vec::new());
        w.write_all(b"hello partitioned world").unwrap();
        let bytes = w.finish().unwrap();

        let mut r = Lz4BlockReader::new(bytes.as_slice());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello partitioned world");
    }

    #[test]
    fn roundtrip_crosses_multiple_blocks() {
        let mut w = Lz4BlockWriter::with_block_size(Vec::new(), 16);
        let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        w.write_all(&data).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = Lz4BlockReader::new(bytes.as_slice());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn small_reads_cross_block_boundary_transparently() {
        let mut w = Lz4BlockWriter::with_block_size(Vec::new(), 8);
        w.write_all(b"abcdefghijklmnopqrstuvwxyz").unwrap();
        let bytes = w.finish().unwrap();

        let mut r = Lz4BlockReader::new(bytes.as_slice());
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = r.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"abcdefghijklmnopqrstuvwxyz");
    }

    #[test]
    fn empty_stream_roundtrips() {
        let w = Lz4BlockWriter::new(Vec::new());
        let bytes = w.finish().unwrap();
        let mut r = Lz4BlockReader::new(bytes.as_slice());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn sink_source_raw_passthrough() {
        let mut sink = Sink::new(Vec::new(), false);
        sink.write_all(b"raw bytes").unwrap();
        let bytes = sink.finish().unwrap();

        let mut source = Source::new(bytes.as_slice(), false);
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw bytes");
    }
}
