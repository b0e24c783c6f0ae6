//! CRC + compression stream (C3). Every byte that lands on disk passes
//! through a `CrcWriter`; compression, when enabled, sits underneath it so
//! the running CRC-32C is always computed over what's actually written
//! (§4.3: "the CRC of the compressed output").

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{RmanError, Result};

pub struct CrcWriter<W: Write> {
    inner: W,
    crc: u32,
    len: u64,
}

impl<W: Write> CrcWriter<W> {
    pub fn new(inner: W) -> Self {
        CrcWriter { inner, crc: 0, len: 0 }
    }

    pub fn finish(self) -> (W, u32, u64) {
        (self.inner, self.crc, self.len)
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The write side of the stream: plain pass-through, or DEFLATE-compressed,
/// both backed by a `CrcWriter` on the bytes that actually reach disk.
pub enum FileSink<W: Write> {
    Plain(CrcWriter<W>),
    Gz(GzEncoder<CrcWriter<W>>),
}

impl<W: Write> FileSink<W> {
    pub fn new(inner: W, compress: bool) -> Self {
        if compress {
            FileSink::Gz(GzEncoder::new(CrcWriter::new(inner), Compression::default()))
        } else {
            FileSink::Plain(CrcWriter::new(inner))
        }
    }

    /// Flush any remaining compressed frames and return the final CRC-32C
    /// and byte count of what was written to `inner`.
    pub fn finish(self) -> io::Result<(W, u32, u64)> {
        match self {
            FileSink::Plain(w) => Ok(w.finish()),
            FileSink::Gz(enc) => {
                let crc_writer = enc.finish()?;
                Ok(crc_writer.finish())
            }
        }
    }
}

impl<W: Write> Write for FileSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileSink::Plain(w) => w.write(buf),
            FileSink::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileSink::Plain(w) => w.flush(),
            FileSink::Gz(w) => w.flush(),
        }
    }
}

/// The read side: plain pass-through, or the inverse DEFLATE decoder. A
/// clean end-of-stream is only reported once the gzip framing itself is
/// exhausted; a truncated member surfaces as an I/O error from the
/// decoder, which callers convert to `Corrupted`/`System` at the boundary.
pub enum FileSource<R: Read> {
    Plain(R),
    Gz(GzDecoder<R>),
}

impl<R: Read> FileSource<R> {
    pub fn new(inner: R, compressed: bool) -> Self {
        if compressed {
            FileSource::Gz(GzDecoder::new(inner))
        } else {
            FileSource::Plain(inner)
        }
    }
}

impl<R: Read> Read for FileSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileSource::Plain(r) => r.read(buf),
            FileSource::Gz(r) => r.read(buf),
        }
    }
}

/// Copy `reader` to `writer` in fixed-size chunks, polling the interrupt
/// flag between chunks (§5 "per-chunk in CRC/compression stream").
/// Interruption mid-copy is always FATAL, never recoverable.
pub fn copy_with_interrupt<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64> {
    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        if utils::interrupt::is_requested() {
            return Err(RmanError::Interrupted);
        }
        let n = reader.read(&mut buf).map_err(|e| RmanError::System(e.into()))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| RmanError::System(e.into()))?;
        total += n as u64;
    }
    Ok(total)
}
