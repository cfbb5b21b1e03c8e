//! Record codec for `<Number>. <String>` lines.

use std::cmp::Ordering;
use std::fmt;

use memchr::memchr_iter;

/// Why a byte sequence failed to parse as a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The line contains no `". "` separator.
    MissingSeparator,
    /// The separator is present but no digits precede it.
    EmptyNumber,
    /// A non-digit byte in the number part.
    InvalidDigit,
    /// The number does not fit in 64 bits.
    NumberOverflow,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingSeparator => write!(f, "no '. ' separator"),
            ParseError::EmptyNumber => write!(f, "empty number part"),
            ParseError::InvalidDigit => write!(f, "non-digit byte in number part"),
            ParseError::NumberOverflow => write!(f, "number does not fit in 64 bits"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed record: byte offsets into an external buffer plus the number
/// decoded once at parse time.
///
/// The descriptor is small and `Copy`; the record bytes themselves never
/// move while sorting. A `Record` is only meaningful together with the
/// buffer it was parsed from, which every accessor takes explicitly so
/// descriptors can cross thread and queue boundaries on their own.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    num_start: u32,
    num_len: u32,
    str_start: u32,
    str_len: u32,
    /// Numeric tie-breaker.
    pub number: u64,
}

impl Record {
    /// Parses one record from `buf[start..end]`.
    ///
    /// The slice must not include the trailing newline. Offsets in the
    /// returned descriptor are absolute within `buf`. The number part is
    /// everything before the first `". "` occurrence; the string part is
    /// everything after it, possibly empty.
    pub fn parse(buf: &[u8], start: usize, end: usize) -> Result<Record, ParseError> {
        let line = &buf[start..end];
        let sep = memchr_iter(b'.', line)
            .find(|&pos| line.get(pos + 1) == Some(&b' '))
            .ok_or(ParseError::MissingSeparator)?;
        if sep == 0 {
            return Err(ParseError::EmptyNumber);
        }

        let mut number: u64 = 0;
        for &digit in &line[..sep] {
            if !digit.is_ascii_digit() {
                return Err(ParseError::InvalidDigit);
            }
            number = number
                .checked_mul(10)
                .and_then(|n| n.checked_add(u64::from(digit - b'0')))
                .ok_or(ParseError::NumberOverflow)?;
        }

        Ok(Record {
            num_start: start as u32,
            num_len: sep as u32,
            str_start: (start + sep + 2) as u32,
            str_len: (end - start - sep - 2) as u32,
            number,
        })
    }

    /// The string part, separator and newline excluded.
    #[inline]
    pub fn string<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.str_start as usize..(self.str_start + self.str_len) as usize]
    }

    /// The full record bytes, exactly as they appeared in the input.
    #[inline]
    pub fn bytes<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.num_start as usize..(self.str_start + self.str_len) as usize]
    }
}

/// The total order of the whole system: byte-lexicographic on the string
/// part, ties broken by ascending numeric value.
#[inline]
pub fn compare(a: &Record, a_buf: &[u8], b: &Record, b_buf: &[u8]) -> Ordering {
    a.string(a_buf)
        .cmp(b.string(b_buf))
        .then_with(|| a.number.cmp(&b.number))
}
