//! Chunk sorting and sorted-run writing.

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::control::CancelToken;
use crate::quicksort;
use crate::record::Record;

/// Rough bytes-per-record estimate used to pre-size parse output.
const ESTIMATED_BYTES_PER_RECORD: usize = 32;

/// Staging buffer size for run writes. A single record larger than this
/// bypasses staging and goes straight to the underlying stream.
pub const STAGING_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Compression level for intermediate runs.
pub const ZSTD_LEVEL: i32 = 3;

/// Chunk write error.
#[derive(Debug)]
pub enum WriteError {
    /// The underlying stream failed.
    Io(io::Error),
    /// Cooperative cancellation was observed at a staging flush. The
    /// run file is left unfinished and must not be merged.
    Cancelled,
}

impl Error for WriteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WriteError::Io(err) => Some(err),
            WriteError::Cancelled => None,
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Io(err) => write!(f, "chunk write failed: {}", err),
            WriteError::Cancelled => write!(f, "chunk write cancelled"),
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> WriteError {
        WriteError::Io(err)
    }
}

/// Scans `buf` and parses one record per newline-terminated slice, plus
/// the unterminated tail. Records that fail to parse are dropped.
pub fn parse_chunk(buf: &[u8]) -> Vec<Record> {
    let mut records = Vec::with_capacity(buf.len() / ESTIMATED_BYTES_PER_RECORD);
    let mut start = 0usize;
    for newline in memchr::memchr_iter(b'\n', buf) {
        push_record(buf, start, newline, &mut records);
        start = newline + 1;
    }
    if start < buf.len() {
        push_record(buf, start, buf.len(), &mut records);
    }
    records
}

fn push_record(buf: &[u8], start: usize, end: usize, out: &mut Vec<Record>) {
    if end == start {
        return;
    }
    match Record::parse(buf, start, end) {
        Ok(record) => out.push(record),
        Err(err) => log::trace!("dropping malformed record at offset {}: {}", start, err),
    }
}

/// Parses and sorts one raw chunk.
pub fn sort_chunk(buf: &[u8]) -> Vec<Record> {
    let mut records = parse_chunk(buf);
    quicksort::sort_records(buf, &mut records);
    records
}

/// Sink for sorted-run bytes: a plain file or a zstd stream over one.
///
/// An enum rather than `Box<dyn Write>` keeps the write hot path free
/// of vtable dispatch.
enum RunSink {
    Plain(File),
    Compressed(zstd::stream::write::Encoder<'static, File>),
}

impl RunSink {
    fn create(path: &Path, compress: bool) -> io::Result<RunSink> {
        let file = File::create(path)?;
        if compress {
            Ok(RunSink::Compressed(zstd::stream::write::Encoder::new(
                file, ZSTD_LEVEL,
            )?))
        } else {
            Ok(RunSink::Plain(file))
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            RunSink::Plain(mut file) => file.flush(),
            RunSink::Compressed(encoder) => encoder.finish().map(|_| ()),
        }
    }
}

impl Write for RunSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RunSink::Plain(file) => file.write(buf),
            RunSink::Compressed(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RunSink::Plain(file) => file.flush(),
            RunSink::Compressed(encoder) => encoder.flush(),
        }
    }
}

/// Writes `\n`-terminated records through a fixed-size staging buffer
/// that amortizes syscalls (and, for compressed runs, codec calls).
pub struct RunWriter {
    sink: RunSink,
    staged: Vec<u8>,
    capacity: usize,
}

impl RunWriter {
    pub fn create(path: &Path, compress: bool) -> io::Result<RunWriter> {
        RunWriter::with_capacity(path, compress, STAGING_BUF_SIZE)
    }

    pub fn with_capacity(path: &Path, compress: bool, capacity: usize) -> io::Result<RunWriter> {
        Ok(RunWriter {
            sink: RunSink::create(path, compress)?,
            staged: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Appends one record plus its newline. Returns whether the staging
    /// buffer was flushed; callers treat a flush as a suspension point.
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<bool> {
        let mut flushed = false;
        if self.staged.len() + bytes.len() + 1 > self.capacity {
            self.flush_staged()?;
            flushed = true;
        }
        if bytes.len() + 1 > self.capacity {
            // Oversized record: staging would only add a copy.
            self.sink.write_all(bytes)?;
            self.sink.write_all(b"\n")?;
        } else {
            self.staged.extend_from_slice(bytes);
            self.staged.push(b'\n');
        }
        Ok(flushed)
    }

    fn flush_staged(&mut self) -> io::Result<()> {
        if !self.staged.is_empty() {
            self.sink.write_all(&self.staged)?;
            self.staged.clear();
        }
        Ok(())
    }

    /// Flushes staged bytes and finalizes the stream.
    pub fn finish(mut self) -> io::Result<()> {
        self.flush_staged()?;
        self.sink.finish()
    }
}

/// Writes one sorted chunk to `path`, checking for cancellation at each
/// staging flush. A cancelled write is an error: the stream was never
/// finalized, so the file on disk is not a usable run.
pub fn write_chunk(
    buf: &[u8],
    records: &[Record],
    path: &Path,
    compress: bool,
    cancel: &CancelToken,
) -> Result<(), WriteError> {
    let mut writer = RunWriter::create(path, compress)?;
    for record in records {
        if writer.push(record.bytes(buf))? && cancel.is_cancelled() {
            return Err(WriteError::Cancelled);
        }
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Read;

    use rstest::*;

    use crate::control::CancelToken;
    use crate::record::Record;

    use super::{parse_chunk, sort_chunk, write_chunk, RunWriter, WriteError};

    fn rendered(buf: &[u8], records: &[Record]) -> Vec<u8> {
        let mut out = Vec::new();
        for record in records {
            out.extend_from_slice(record.bytes(buf));
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn test_parse_chunk_handles_tail_without_newline() {
        let records = parse_chunk(b"1. a\n2. b\n3. tail");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].number, 3);
    }

    #[test]
    fn test_parse_chunk_drops_malformed_records() {
        let buf = b"1. ok\ngarbage\n\nx7. bad digits\n2. also ok\n";
        let records = parse_chunk(buf);
        let numbers: Vec<u64> = records.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_sort_chunk_orders_by_string_then_number() {
        let buf = b"5. Banana\n1. Apple\n3. Apple\n2. Cherry\n4. Banana\n";
        let records = sort_chunk(buf);
        assert_eq!(
            rendered(buf, &records),
            b"1. Apple\n3. Apple\n4. Banana\n5. Banana\n2. Cherry\n"
        );
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_write_chunk_roundtrip(#[case] compress: bool) {
        let buf = b"2. bb\n1. aa\n3. cc";
        let records = sort_chunk(buf);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");

        write_chunk(buf, &records, &path, compress, &CancelToken::new()).unwrap();

        let raw = fs::read(&path).unwrap();
        let restored = if compress {
            let mut decoder = zstd::stream::read::Decoder::new(&raw[..]).unwrap();
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).unwrap();
            out
        } else {
            raw
        };
        assert_eq!(restored, b"1. aa\n2. bb\n3. cc\n");
    }

    #[test]
    fn test_oversized_record_bypasses_staging() {
        let big = format!("1. {}", "x".repeat(64));
        let buf = big.as_bytes();
        let records = parse_chunk(buf);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");

        // Staging capacity far below the record length.
        let mut writer = RunWriter::with_capacity(&path, false, 16).unwrap();
        for record in &records {
            writer.push(record.bytes(buf)).unwrap();
        }
        writer.finish().unwrap();

        let mut expected = buf.to_vec();
        expected.push(b'\n');
        assert_eq!(fs::read(&path).unwrap(), expected);
    }

    #[test]
    fn test_write_chunk_observes_cancellation() {
        // Enough records to overflow the staging buffer: the first
        // flush is the cancellation point.
        let line = format!("1. {}", "y".repeat(1020));
        let mut buf = Vec::new();
        for _ in 0..6_000 {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        let records = parse_chunk(&buf);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");

        let cancel = CancelToken::new();
        cancel.cancel();

        let err = write_chunk(&buf, &records, &path, false, &cancel).unwrap_err();
        assert!(matches!(err, WriteError::Cancelled));
    }
}
