//! Streaming reader for sorted runs.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::record::Record;

/// Read buffer size for run streams.
const READ_BUF_SIZE: usize = 256 * 1024;

enum RunSource {
    Plain(BufReader<File>),
    Compressed(BufReader<zstd::stream::read::Decoder<'static, BufReader<File>>>),
}

impl RunSource {
    fn read_until(&mut self, delim: u8, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            RunSource::Plain(reader) => reader.read_until(delim, buf),
            RunSource::Compressed(reader) => reader.read_until(delim, buf),
        }
    }
}

/// Streams one sorted run as parsed records.
///
/// The reader owns a growable line buffer that is reused across lines;
/// a record returned by [`RunReader::read_next`] stays valid only until
/// the next call.
pub struct RunReader {
    source: RunSource,
    line: Vec<u8>,
}

impl RunReader {
    /// Opens a run, transparently decoding it when `compressed`.
    pub fn open(path: &Path, compressed: bool) -> io::Result<RunReader> {
        let file = File::open(path)?;
        let source = if compressed {
            RunSource::Compressed(BufReader::with_capacity(
                READ_BUF_SIZE,
                zstd::stream::read::Decoder::new(file)?,
            ))
        } else {
            RunSource::Plain(BufReader::with_capacity(READ_BUF_SIZE, file))
        };

        Ok(RunReader {
            source,
            line: Vec::with_capacity(256),
        })
    }

    /// Bytes of the current record's line.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    /// Reads the next record, skipping lines that fail to parse.
    /// Returns `None` at end of stream.
    pub fn read_next(&mut self) -> io::Result<Option<Record>> {
        loop {
            self.line.clear();
            let n = self.source.read_until(b'\n', &mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.last() == Some(&b'\n') {
                self.line.pop();
            }
            if self.line.is_empty() {
                continue;
            }
            match Record::parse(&self.line, 0, self.line.len()) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => log::trace!("skipping unparsable run line: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use crate::chunk::{sort_chunk, write_chunk};
    use crate::control::CancelToken;

    use super::RunReader;

    fn read_all(reader: &mut RunReader) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(record) = reader.read_next().unwrap() {
            lines.push(record.bytes(reader.line()).to_vec());
        }
        lines
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_streams_a_sorted_run(#[case] compressed: bool) {
        let buf = b"3. c\n1. a\n2. b\n";
        let records = sort_chunk(buf);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        write_chunk(buf, &records, &path, compressed, &CancelToken::new()).unwrap();

        let mut reader = RunReader::open(&path, compressed).unwrap();
        assert_eq!(
            read_all(&mut reader),
            vec![b"1. a".to_vec(), b"2. b".to_vec(), b"3. c".to_vec()]
        );
    }

    #[test]
    fn test_empty_run_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        fs::write(&path, b"").unwrap();

        let mut reader = RunReader::open(&path, false).unwrap();
        assert!(reader.read_next().unwrap().is_none());
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        fs::write(&path, b"1. ok\nnot a record\n\n2. fine\n").unwrap();

        let mut reader = RunReader::open(&path, false).unwrap();
        assert_eq!(read_all(&mut reader), vec![b"1. ok".to_vec(), b"2. fine".to_vec()]);
    }

    #[test]
    fn test_final_record_without_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        fs::write(&path, b"1. a\n2. tail").unwrap();

        let mut reader = RunReader::open(&path, false).unwrap();
        assert_eq!(read_all(&mut reader), vec![b"1. a".to_vec(), b"2. tail".to_vec()]);
    }
}
