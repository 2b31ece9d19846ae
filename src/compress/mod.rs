//! # Streaming Codec Engine
//!
//! Chunked Zstandard compression and decompression over any `Read`/`Write` pair.
//!
//! ## Key Features:
//! - **Bounded memory**: data moves through one reusable buffer of `chunk_size` bytes, so
//!   peak memory does not grow with the input.
//! - **Integrity**: every uncompressed byte passes through a [`HashAccumulator`]; frames are
//!   written with the zstd content checksum enabled.
//! - **Codec threads**: `zstd`'s multithreaded mode is enabled when more than one thread
//!   is configured.
//! - **Typed decode failures**: a bad frame header is [`SpacerError::Decode`], an input that
//!   stops mid-frame is [`SpacerError::TruncatedStream`], both carrying the compressed
//!   offset reached.

use crate::common::CompressionLevel;
use crate::config::Options;
use crate::error::{IoContext, Result, SpacerError};
use crate::hash::HashAccumulator;
use crate::progress::ProgressTracker;

use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::Path;

/// Little-endian magic of a regular zstd frame.
pub const ZSTD_MAGIC: u32 = 0xFD2F_B528;
/// Skippable frames use magics `0x184D2A50..=0x184D2A5F`.
const SKIPPABLE_MAGIC_MASK: u32 = 0xFFFF_FFF0;
const SKIPPABLE_MAGIC: u32 = 0x184D_2A50;

/// Per-stream tuning derived from [`Options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Bytes read per step.
    pub chunk_size: usize,
    /// zstd worker threads; 0 or 1 compresses on the calling thread.
    pub threads: u32,
}

impl StreamSettings {
    pub fn from_options(options: &Options) -> Self {
        Self {
            chunk_size: options.chunk_size,
            threads: options.parallel_threads.min(u32::MAX as usize) as u32,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_options(&Options::default())
    }
}

/// Byte counts of one finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    /// Bytes read from the source.
    pub bytes_in: u64,
    /// Bytes written to the sink.
    pub bytes_out: u64,
}

/// A `Write` adapter that counts the bytes passed to its inner writer.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A `Read` adapter that counts the bytes taken from its inner reader.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Fills `buf` from `source` until it is full or the source is exhausted.
///
/// Returns the number of bytes read; anything short of `buf.len()` means end of input.
pub fn read_chunk<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// An open compression stream.
///
/// Every byte written is hashed and fed to one zstd stream, so data written by separate
/// calls (an entry table followed by many payloads) shares a single compression context.
pub struct StreamEncoder<W: Write> {
    encoder: zstd::stream::write::Encoder<'static, CountingWriter<W>>,
    hasher: HashAccumulator,
    bytes_in: u64,
}

impl<W: Write> StreamEncoder<W> {
    /// Opens a zstd stream on `sink` at `level`.
    ///
    /// # Arguments
    /// * `sink` - Destination of the compressed bytes.
    /// * `level` - Zstandard level, passed to the codec unmodified.
    /// * `settings` - Thread count for the codec.
    pub fn new(sink: W, level: CompressionLevel, settings: &StreamSettings) -> Result<Self> {
        let mut encoder = zstd::stream::write::Encoder::new(CountingWriter::new(sink), level.get())?;
        encoder.include_checksum(true)?;
        if settings.threads > 1 {
            encoder.multithread(settings.threads)?;
        }
        Ok(Self {
            encoder,
            hasher: HashAccumulator::new(),
            bytes_in: 0,
        })
    }

    /// Hashes and compresses `bytes`.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes)?;
        self.encoder.write_all(bytes)?;
        self.bytes_in += bytes.len() as u64;
        Ok(())
    }

    /// Streams `source` to its end through `buf`, one chunk at a time, reporting each
    /// chunk to `tracker` and checking for cancellation before each read.
    ///
    /// `origin` names the source in I/O errors. Returns the number of bytes copied.
    pub fn copy_from<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        buf: &mut [u8],
        tracker: &ProgressTracker,
        origin: &Path,
    ) -> Result<u64> {
        let mut copied = 0u64;
        loop {
            tracker.check_cancelled()?;
            let n = read_chunk(source, buf).at(origin)?;
            if n == 0 {
                break;
            }
            self.write_chunk(&buf[..n])?;
            tracker.advance(n as u64);
            copied += n as u64;
            if n < buf.len() {
                break;
            }
        }
        Ok(copied)
    }

    /// Ends the frame and returns the stream totals, the hex digest of everything written
    /// and the sink.
    pub fn finish(mut self) -> Result<(StreamStats, String, W)> {
        let digest = self.hasher.finalize()?;
        let counting = self.encoder.finish()?;
        let stats = StreamStats {
            bytes_in: self.bytes_in,
            bytes_out: counting.count(),
        };
        Ok((stats, digest, counting.into_inner()))
    }
}

/// Compresses all of `source` into `sink`.
///
/// Returns the stream totals and the SHA-256 hex digest of the uncompressed input.
///
/// # Arguments
/// * `source` - Uncompressed input; read in `settings.chunk_size` steps.
/// * `sink` - Receives one zstd frame.
/// * `level` - Zstandard level.
/// * `settings` - Chunk size and codec threads.
/// * `tracker` - Progress and cancellation; checked between chunks.
/// * `origin` - Names the source in I/O errors.
pub fn compress_stream<R: Read, W: Write>(
    mut source: R,
    sink: W,
    level: CompressionLevel,
    settings: &StreamSettings,
    tracker: &ProgressTracker,
    origin: &Path,
) -> Result<(StreamStats, String)> {
    let mut encoder = StreamEncoder::new(sink, level, settings)?;
    let mut buf = vec![0u8; settings.chunk_size];
    encoder.copy_from(&mut source, &mut buf, tracker, origin)?;
    let (stats, digest, _) = encoder.finish()?;
    tracing::debug!(
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "compressed stream"
    );
    Ok((stats, digest))
}

type Prefixed<R> = io::Chain<Cursor<[u8; 4]>, R>;

/// Reads and checks the 4-byte frame magic of `source`.
fn check_magic<R: Read>(mut source: R) -> Result<Prefixed<R>> {
    let mut magic = [0u8; 4];
    let n = read_chunk(&mut source, &mut magic)?;
    if n < magic.len() {
        return Err(SpacerError::TruncatedStream { offset: n as u64 });
    }
    let value = u32::from_le_bytes(magic);
    if value != ZSTD_MAGIC && value & SKIPPABLE_MAGIC_MASK != SKIPPABLE_MAGIC {
        return Err(SpacerError::Decode {
            offset: 0,
            reason: format!("bad frame magic {value:#010x}"),
        });
    }
    Ok(Cursor::new(magic).chain(source))
}

/// Decoding reader returned by [`open_decoder`].
pub struct DecodeReader<R: Read> {
    decoder: zstd::stream::read::Decoder<'static, BufReader<CountingReader<Prefixed<R>>>>,
}

impl<R: Read> DecodeReader<R> {
    /// Compressed bytes consumed from the source so far.
    pub fn compressed_offset(&self) -> u64 {
        self.decoder.get_ref().get_ref().count()
    }

    /// Translates a read error of this decoder into the crate's error type.
    pub fn map_error(&self, err: io::Error) -> SpacerError {
        let offset = self.compressed_offset();
        match err.kind() {
            io::ErrorKind::UnexpectedEof => SpacerError::TruncatedStream { offset },
            _ => SpacerError::Decode {
                offset,
                reason: err.to_string(),
            },
        }
    }

    /// Reads until `buf` is full or the stream ends, with errors already translated.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_chunk(&mut self.decoder, buf).map_err(|e| self.map_error(e))
    }
}

/// Plain `Read` access for consumers such as the container table parser. Errors carry the
/// translated [`SpacerError`] inside the `io::Error`; `SpacerError::from` recovers it.
impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let kind = e.kind();
                Err(io::Error::new(kind, self.map_error(e)))
            }
        }
    }
}

/// Checks the frame magic of `source` and opens a decoding reader over it.
///
/// Concatenated frames are decoded back to back.
pub fn open_decoder<R: Read>(source: R) -> Result<DecodeReader<R>> {
    let prefixed = check_magic(source)?;
    let buffered = BufReader::new(CountingReader::new(prefixed));
    let decoder = zstd::stream::read::Decoder::with_buffer(buffered)?;
    Ok(DecodeReader { decoder })
}

/// Decompresses all of `source` into `sink`.
///
/// Returns the stream totals and the SHA-256 hex digest of the decompressed output.
/// Progress is reported in compressed bytes consumed, so callers should set the tracker
/// total to the compressed size.
///
/// # Arguments
/// * `source` - A zstd stream, one or more frames.
/// * `sink` - Receives the decompressed bytes.
/// * `settings` - Chunk size.
/// * `tracker` - Progress and cancellation; checked between chunks.
/// * `sink_path` - Names the sink in I/O errors.
pub fn decompress_stream<R: Read, W: Write>(
    source: R,
    mut sink: W,
    settings: &StreamSettings,
    tracker: &ProgressTracker,
    sink_path: &Path,
) -> Result<(StreamStats, String)> {
    let mut reader = open_decoder(source)?;
    let mut hasher = HashAccumulator::new();
    let mut buf = vec![0u8; settings.chunk_size];
    let mut bytes_out = 0u64;
    let mut reported = 0u64;

    loop {
        tracker.check_cancelled()?;
        let n = reader.read_chunk(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
        sink.write_all(&buf[..n]).at(sink_path)?;
        bytes_out += n as u64;

        let consumed = reader.compressed_offset();
        tracker.advance(consumed - reported);
        reported = consumed;

        if n < buf.len() {
            break;
        }
    }
    sink.flush().at(sink_path)?;

    let stats = StreamStats {
        bytes_in: reader.compressed_offset(),
        bytes_out,
    };
    tracing::debug!(
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "decompressed stream"
    );
    Ok((stats, hasher.finalize()?))
}
